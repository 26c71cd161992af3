/// Store integration tests
/// Drive a ConversationStore against the in-memory backend

use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{advance, sleep};
use wirewave_core::memory_backend::{FailMode, MemoryBackend};
use wirewave_core::realtime::{self, spawn_pump};
use wirewave_core::{
    Config, ConversationStore, MessageId, ProvisionalId, ServerId, ServerMessage, StoreEvent,
    SyncError,
};

const ME: &str = "me@x.com";

fn setup(config: Config) -> (ConversationStore, Arc<MemoryBackend>) {
    let backend = Arc::new(MemoryBackend::new(ME));
    let store = ConversationStore::new(config, backend.clone(), backend.clone()).unwrap();
    (store, backend)
}

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn inbound(id: u64, from: &str, secs: i64, read: bool) -> ServerMessage {
    ServerMessage {
        id: ServerId(id),
        sender_id: from.to_string(),
        receiver_id: ME.to_string(),
        content: format!("message {}", id),
        sent_at: at(secs),
        read,
        client_provisional_id: None,
    }
}

fn outbound(id: u64, to: &str, secs: i64) -> ServerMessage {
    ServerMessage {
        id: ServerId(id),
        sender_id: ME.to_string(),
        receiver_id: to.to_string(),
        content: format!("reply {}", id),
        sent_at: at(secs),
        read: false,
        client_provisional_id: None,
    }
}

#[tokio::test]
async fn test_offline_send_rolls_back() {
    let (store, backend) = setup(Config::for_user(ME));
    let mut events = store.subscribe();
    backend.set_offline(true).await;

    let err = store.send("b@x.com", "hello").await.unwrap_err();
    match &err {
        SyncError::SendFailed { peer_id, content, retry_count, .. } => {
            assert_eq!(peer_id, "b@x.com");
            assert_eq!(content, "hello");
            assert_eq!(*retry_count, 0);
        }
        other => panic!("expected SendFailed, got {:?}", other),
    }
    assert!(err.is_retryable());
    assert!(store.get_conversation("b@x.com").await.is_empty());
    assert!(store.list_conversations().await.is_empty());
    assert_eq!(store.pending_sends().await, 0);

    let mut saw_failure = false;
    while let Ok(event) = events.try_recv() {
        if let StoreEvent::SendFailed { content, .. } = event {
            assert_eq!(content, "hello");
            saw_failure = true;
        }
    }
    assert!(saw_failure);

    // Back online, the failed input can be re-sent as is
    backend.set_offline(false).await;
    let msg = store.retry(&err).await.unwrap();
    assert_eq!(msg.content, "hello");
    let conversation = store.get_conversation("b@x.com").await;
    assert_eq!(conversation.len(), 1);
    assert!(!conversation[0].is_provisional());
}

#[tokio::test]
async fn test_send_confirms_provisional_entry() {
    let (store, backend) = setup(Config::for_user(ME));
    backend.set_latency(Duration::from_millis(100)).await;

    let sending = {
        let store = store.clone();
        tokio::spawn(async move { store.send("b@x.com", "  hi there ").await })
    };
    sleep(Duration::from_millis(30)).await;

    let visible = store.get_conversation("b@x.com").await;
    assert_eq!(visible.len(), 1);
    assert!(visible[0].is_provisional());
    assert_eq!(visible[0].content, "hi there");
    assert_eq!(store.pending_sends().await, 1);

    let msg = sending.await.unwrap().unwrap();
    let id = msg.server_id().unwrap();
    let conversation = store.get_conversation("b@x.com").await;
    assert_eq!(conversation.len(), 1);
    assert_eq!(conversation[0].id, MessageId::Confirmed(id));
    assert_eq!(backend.stored(id).await.unwrap().content, "hi there");
}

#[tokio::test]
async fn test_invalid_send_never_reaches_backend() {
    let (store, backend) = setup(Config::for_user(ME));
    assert!(matches!(
        store.send("b@x.com", "   ").await,
        Err(SyncError::Validation(_))
    ));
    assert!(matches!(
        store.send("b@x.com", &"x".repeat(2001)).await,
        Err(SyncError::Validation(_))
    ));
    assert_eq!(backend.calls().await.send, 0);
    assert!(store.get_conversation("b@x.com").await.is_empty());
}

#[tokio::test]
async fn test_server_rejection_rolls_back() {
    let (store, backend) = setup(Config::for_user(ME));
    backend.fail_next_send(FailMode::Validation).await;
    let err = store.send("b@x.com", "hello").await.unwrap_err();
    assert!(!err.is_retryable());
    assert!(store.get_conversation("b@x.com").await.is_empty());
}

#[tokio::test]
async fn test_duplicate_push_keeps_one_entry() {
    let (store, _backend) = setup(Config::for_user(ME));
    store.on_message_push(inbound(42, "b@x.com", 0, false)).await;
    store.on_message_push(inbound(42, "b@x.com", 0, true)).await;

    let conversation = store.get_conversation("b@x.com").await;
    assert_eq!(conversation.len(), 1);
    assert!(conversation[0].read);
    assert_eq!(store.unread_count("b@x.com").await, 0);
}

#[tokio::test]
async fn test_push_and_fetch_overlap() {
    let (store, _backend) = setup(Config::for_user(ME));
    store.on_message_push(inbound(2, "b@x.com", 20, false)).await;
    store
        .on_periodic_fetch(vec![
            inbound(1, "b@x.com", 10, false),
            inbound(2, "b@x.com", 20, false),
            outbound(3, "b@x.com", 30),
        ])
        .await;

    let ids: Vec<MessageId> = store
        .get_conversation("b@x.com")
        .await
        .iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(
        ids,
        vec![
            MessageId::Confirmed(ServerId(1)),
            MessageId::Confirmed(ServerId(2)),
            MessageId::Confirmed(ServerId(3)),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_typing_expires() {
    let (store, _backend) = setup(Config::for_user(ME));
    store.on_typing("c@x.com").await;
    assert!(store.is_typing("c@x.com").await);

    advance(Duration::from_secs(2)).await;
    assert!(store.is_typing("c@x.com").await);

    advance(Duration::from_secs(2)).await;
    assert!(!store.is_typing("c@x.com").await);
    assert!(store.typing_peers().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_prune_drops_expired_typing() {
    let (store, _backend) = setup(Config::for_user(ME));
    store.on_presence("c@x.com", true).await;
    store.on_presence("a@x.com", true).await;
    store.on_typing("c@x.com").await;
    store.on_typing("a@x.com").await;
    assert_eq!(store.online_peers().await, vec!["a@x.com".to_string(), "c@x.com".to_string()]);

    assert_eq!(store.prune_typing().await, 0);
    advance(Duration::from_secs(4)).await;
    assert_eq!(store.prune_typing().await, 2);
    assert_eq!(store.prune_typing().await, 0);

    // Presence outlives typing
    assert_eq!(store.online_peers().await.len(), 2);
}

#[tokio::test]
async fn test_inbound_message_clears_typing() {
    let (store, _backend) = setup(Config::for_user(ME));
    store.on_typing("c@x.com").await;
    store.on_typing(ME).await;
    assert_eq!(store.typing_peers().await, vec!["c@x.com".to_string()]);

    store.on_message_push(inbound(1, "c@x.com", 0, false)).await;
    assert!(!store.is_typing("c@x.com").await);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_rejects_fourth_send() {
    let config = Config {
        rate_limit_max_sends: 3,
        rate_limit_window: Duration::from_secs(10),
        ..Config::for_user(ME)
    };
    let (store, backend) = setup(config);

    for i in 0..3 {
        store.send("b@x.com", &format!("msg {}", i)).await.unwrap();
    }
    match store.send("b@x.com", "one too many").await {
        Err(SyncError::RateLimited { retry_after }) => {
            assert!(retry_after <= Duration::from_secs(10))
        }
        other => panic!("expected RateLimited, got {:?}", other),
    }
    assert_eq!(backend.calls().await.send, 3);
    assert_eq!(store.get_conversation("b@x.com").await.len(), 3);

    advance(Duration::from_secs(10)).await;
    assert!(store.send("b@x.com", "later").await.is_ok());
}

#[tokio::test]
async fn test_mark_read_batches_once() {
    let (store, backend) = setup(Config::for_user(ME));
    let delivered = backend.deliver("b@x.com", "ping").await;
    store.refresh().await.unwrap();
    assert_eq!(store.unread_count("b@x.com").await, 1);

    let (a, b) = tokio::join!(
        store.mark_read([delivered.id, delivered.id]),
        store.mark_read([delivered.id])
    );
    assert_eq!(a.unwrap() + b.unwrap(), 1);
    assert_eq!(backend.calls().await.mark_read, 1);
    assert_eq!(store.unread_count("b@x.com").await, 0);
    assert!(backend.stored(delivered.id).await.unwrap().read);

    // Nothing left to confirm
    assert_eq!(store.mark_conversation_read("b@x.com").await.unwrap(), 0);
    assert_eq!(backend.calls().await.mark_read, 1);
}

#[tokio::test]
async fn test_mark_read_ignores_outbound_and_unknown() {
    let (store, backend) = setup(Config::for_user(ME));
    store.on_periodic_fetch(vec![outbound(5, "b@x.com", 0)]).await;
    assert_eq!(store.mark_read([ServerId(5), ServerId(99)]).await.unwrap(), 0);
    assert_eq!(backend.calls().await.mark_read, 0);
}

#[tokio::test]
async fn test_mark_read_failure_reverts() {
    let (store, backend) = setup(Config::for_user(ME));
    let mut events = store.subscribe();
    let delivered = backend.deliver("b@x.com", "ping").await;
    store.refresh().await.unwrap();
    backend.fail_mark_read(true).await;

    match store.mark_conversation_read("b@x.com").await {
        Err(SyncError::ReadSyncFailed { ids, .. }) => assert_eq!(ids, vec![delivered.id]),
        other => panic!("expected ReadSyncFailed, got {:?}", other),
    }
    let conversation = store.get_conversation("b@x.com").await;
    assert!(!conversation[0].read);
    assert_eq!(store.unread_count("b@x.com").await, 1);

    let mut reverted = false;
    while let Ok(event) = events.try_recv() {
        if let StoreEvent::ReadSyncFailed { ids, .. } = event {
            assert_eq!(ids, vec![delivered.id]);
            reverted = true;
        }
    }
    assert!(reverted);

    backend.fail_mark_read(false).await;
    assert_eq!(store.mark_conversation_read("b@x.com").await.unwrap(), 1);
    assert_eq!(store.unread_count("b@x.com").await, 0);
}

#[tokio::test]
async fn test_deleted_message_survives_stale_fetch() {
    let (store, backend) = setup(Config::for_user(ME));
    let delivered = backend.deliver("b@x.com", "oops").await;
    store.refresh().await.unwrap();

    store.delete(delivered.id).await.unwrap();
    assert!(store.get_conversation("b@x.com").await.is_empty());

    // A fetch that started before the delete still carries the message
    let outcome = store.on_periodic_fetch(vec![delivered.clone()]).await;
    assert_eq!(outcome.suppressed, 1);
    assert!(store.get_conversation("b@x.com").await.is_empty());

    // Same for a late push
    store.on_message_push(delivered.clone()).await;
    assert!(store.get_conversation("b@x.com").await.is_empty());

    // Deleting again is not an error
    store.delete(delivered.id).await.unwrap();
    assert_eq!(backend.calls().await.delete, 2);
}

#[tokio::test]
async fn test_delete_failure_keeps_message() {
    let (store, backend) = setup(Config::for_user(ME));
    let delivered = backend.deliver("b@x.com", "keep me").await;
    store.refresh().await.unwrap();
    backend.set_offline(true).await;

    assert!(matches!(
        store.delete(delivered.id).await,
        Err(SyncError::Network(_))
    ));
    assert_eq!(store.get_conversation("b@x.com").await.len(), 1);
}

#[tokio::test]
async fn test_clear_conversation() {
    let (store, backend) = setup(Config::for_user(ME));
    backend.deliver("b@x.com", "one").await;
    backend.deliver("b@x.com", "two").await;
    backend.deliver("c@x.com", "other").await;
    store.refresh().await.unwrap();

    assert_eq!(store.clear("b@x.com").await.unwrap(), 2);
    assert!(store.get_conversation("b@x.com").await.is_empty());
    assert_eq!(store.get_conversation("c@x.com").await.len(), 1);

    let summaries = store.list_conversations().await;
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].peer_id, "c@x.com");
}

#[tokio::test]
async fn test_send_completing_after_clear_is_discarded() {
    let (store, backend) = setup(Config::for_user(ME));
    backend.set_latency(Duration::from_millis(100)).await;

    let sending = {
        let store = store.clone();
        tokio::spawn(async move { store.send("b@x.com", "too late").await })
    };
    sleep(Duration::from_millis(30)).await;
    assert_eq!(store.get_conversation("b@x.com").await.len(), 1);

    assert_eq!(store.clear("b@x.com").await.unwrap(), 1);
    let msg = sending.await.unwrap().unwrap();
    assert!(store.get_conversation("b@x.com").await.is_empty());
    assert_eq!(store.pending_sends().await, 0);

    // The server kept it, but the cleared conversation stays cleared
    assert!(backend.stored(msg.server_id().unwrap()).await.is_some());
    store.refresh().await.unwrap();
    assert!(store.get_conversation("b@x.com").await.is_empty());
}

#[tokio::test]
async fn test_echo_and_response_leave_one_entry() {
    let (push_tx, push_channel) = realtime::channel(16);
    let backend = Arc::new(MemoryBackend::new(ME).with_push(push_tx));
    let store =
        ConversationStore::new(Config::for_user(ME), backend.clone(), backend.clone()).unwrap();
    let pump = spawn_pump(store.clone(), push_channel);

    let msg = store.send("b@x.com", "hello").await.unwrap();
    sleep(Duration::from_millis(50)).await;

    let conversation = store.get_conversation("b@x.com").await;
    assert_eq!(conversation.len(), 1);
    assert_eq!(conversation[0].id, msg.id);
    assert!(!conversation[0].is_provisional());
    pump.abort();
}

#[tokio::test]
async fn test_echo_before_response() {
    let (store, _backend) = setup(Config::for_user(ME));
    let provisional = ProvisionalId::new();
    let mut echo = outbound(7, "b@x.com", 0);
    echo.client_provisional_id = Some(provisional);

    // An echo for a send this store never started is an ordinary message
    store.on_message_push(echo.clone()).await;
    store.on_message_push(echo).await;
    assert_eq!(store.get_conversation("b@x.com").await.len(), 1);
}

#[tokio::test]
async fn test_remote_read_push() {
    let (store, _backend) = setup(Config::for_user(ME));
    store.on_periodic_fetch(vec![outbound(3, "b@x.com", 0)]).await;
    store.on_read_push(ServerId(3)).await;
    assert!(store.get_conversation("b@x.com").await[0].read);

    // Unknown ids are ignored
    store.on_read_push(ServerId(404)).await;
}

#[tokio::test]
async fn test_summaries_and_unread_counts() {
    let (store, _backend) = setup(Config::for_user(ME));
    store
        .on_periodic_fetch(vec![
            inbound(1, "b@x.com", 10, false),
            inbound(2, "b@x.com", 20, false),
            outbound(3, "b@x.com", 30),
            inbound(4, "c.d@x.com", 40, false),
            inbound(5, "e@x.com", 5, true),
        ])
        .await;

    let summaries = store.list_conversations().await;
    let peers: Vec<&str> = summaries.iter().map(|s| s.peer_id.as_str()).collect();
    assert_eq!(peers, vec!["c.d@x.com", "b@x.com", "e@x.com"]);
    assert_eq!(summaries[0].display_name, "C D");
    assert_eq!(summaries[0].initials, "CD");

    assert_eq!(store.unread_count("b@x.com").await, 2);
    assert_eq!(store.unread_count("e@x.com").await, 0);
    assert_eq!(store.total_unread().await, 3);
    assert_eq!(store.preview("b@x.com").await.unwrap(), "You: reply 3");

    let found = store.list_contacts("c.d", Default::default()).await;
    assert_eq!(found.len(), 1);
}

#[tokio::test]
async fn test_presence_updates_summaries() {
    let (store, _backend) = setup(Config::for_user(ME));
    store.on_periodic_fetch(vec![inbound(1, "b@x.com", 0, false)]).await;
    store.on_presence("b@x.com", true).await;
    assert!(store.is_online("b@x.com").await);
    assert!(store.list_conversations().await[0].online);

    store.on_typing("b@x.com").await;
    store.on_presence("b@x.com", false).await;
    assert!(!store.is_typing("b@x.com").await);
    assert!(!store.list_conversations().await[0].online);
}

#[tokio::test]
async fn test_observers_see_consistent_state() {
    let (store, _backend) = setup(Config::for_user(ME));
    let mut events = store.subscribe();

    store.on_message_push(inbound(1, "b@x.com", 0, false)).await;
    match events.recv().await.unwrap() {
        StoreEvent::MessagesChanged { peer_id, revision } => {
            assert_eq!(peer_id, "b@x.com");
            let snapshot = store.snapshot(Some("b@x.com")).await;
            assert!(snapshot.revision >= revision);
            assert_eq!(snapshot.messages.len(), 1);
            assert_eq!(snapshot.conversations.len(), 1);
            assert_eq!(snapshot.conversations[0].unread_count, 1);
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_send_timeout() {
    let config = Config {
        send_timeout: Duration::from_millis(20),
        ..Config::for_user(ME)
    };
    let (store, backend) = setup(config);
    backend.set_latency(Duration::from_millis(200)).await;

    match store.send("b@x.com", "slow").await {
        Err(SyncError::SendFailed { source, .. }) => {
            assert!(matches!(*source, SyncError::Timeout(_)))
        }
        other => panic!("expected SendFailed, got {:?}", other),
    }
    assert!(store.get_conversation("b@x.com").await.is_empty());
}

#[tokio::test]
async fn test_refresh_offline() {
    let (store, backend) = setup(Config::for_user(ME));
    backend.set_offline(true).await;
    assert!(matches!(store.refresh().await, Err(SyncError::Network(_))));
}

#[tokio::test]
async fn test_push_and_fetch_converge_on_read_state() {
    let (push_first, _a) = setup(Config::for_user(ME));
    push_first.on_message_push(inbound(42, "b@x.com", 0, true)).await;
    push_first.on_periodic_fetch(vec![inbound(42, "b@x.com", 0, false)]).await;

    let (fetch_first, _b) = setup(Config::for_user(ME));
    fetch_first.on_periodic_fetch(vec![inbound(42, "b@x.com", 0, false)]).await;
    fetch_first.on_message_push(inbound(42, "b@x.com", 0, true)).await;

    let a = push_first.get_conversation("b@x.com").await;
    let b = fetch_first.get_conversation("b@x.com").await;
    assert_eq!(a.len(), 1);
    assert_eq!(b.len(), 1);
    assert_eq!(a[0].read, b[0].read);
    assert!(a[0].read);
    assert_eq!(push_first.unread_count("b@x.com").await, 0);
    assert_eq!(fetch_first.unread_count("b@x.com").await, 0);
}

#[tokio::test]
async fn test_fetch_during_mark_read_keeps_message_read() {
    let (store, backend) = setup(Config::for_user(ME));
    let delivered = backend.deliver("b@x.com", "ping").await;
    store.refresh().await.unwrap();
    backend.set_latency(Duration::from_millis(100)).await;

    let marking = {
        let store = store.clone();
        tokio::spawn(async move { store.mark_conversation_read("b@x.com").await })
    };
    sleep(Duration::from_millis(30)).await;
    assert_eq!(store.unread_count("b@x.com").await, 0);

    // The server has not seen the batch yet
    let mut stale = delivered.clone();
    stale.read = false;
    store.on_periodic_fetch(vec![stale]).await;
    assert!(store.get_conversation("b@x.com").await[0].read);

    assert_eq!(marking.await.unwrap().unwrap(), 1);
    assert!(store.get_conversation("b@x.com").await[0].read);
    assert_eq!(store.unread_count("b@x.com").await, 0);
}
