/// WireWave console client - drives a store against the in-memory backend
use colored::*;
use std::env;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use wirewave_core::contacts::{self, SortMode};
use wirewave_core::memory_backend::{FailMode, MemoryBackend};
use wirewave_core::realtime::spawn_reconnecting_pump;
use wirewave_core::{
    spawn_poller, Config, ConnectionState, ConversationStore, ServerId, StoreEvent, SyncError,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let config = Config::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    let poll_interval = config.poll_interval;

    let backend = Arc::new(MemoryBackend::new(config.local_user_id.clone()));
    let store = ConversationStore::new(config, backend.clone(), backend.clone())?;

    info!("Starting WireWave client");
    info!("   User: {}", store.local_user_id());

    let pump = spawn_reconnecting_pump(store.clone(), backend.clone());
    let poller = spawn_poller(store.clone(), poll_interval);
    let notifier = tokio::spawn(print_events(store.subscribe()));

    print_help();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut last_failure: Option<SyncError> = None;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();

        match command {
            "send" => {
                let Some((peer, text)) = rest.split_once(' ') else {
                    println!("Usage: send <peer> <message>");
                    continue;
                };
                let peer = match contacts::validate_contact_email(peer, store.local_user_id()) {
                    Ok(peer) => peer,
                    Err(e) => {
                        println!("{} {}", "✗".red().bold(), e);
                        continue;
                    }
                };
                match store.send(&peer, text).await {
                    Ok(msg) => println!("{} sent {}", "✓".green(), msg.id),
                    Err(e) => {
                        println!("{} send failed: {}", "✗".red().bold(), e);
                        if matches!(e, SyncError::SendFailed { .. }) {
                            last_failure = Some(e);
                        }
                    }
                }
            }
            "retry" => match last_failure.take() {
                Some(failed) => match store.retry(&failed).await {
                    Ok(msg) => println!("{} sent {}", "✓".green(), msg.id),
                    Err(e) => {
                        println!("{} retry failed: {}", "✗".red().bold(), e);
                        last_failure = Some(e);
                    }
                },
                None => println!("{}", "nothing to retry".yellow()),
            },
            "list" => {
                for summary in store.list_contacts(rest, SortMode::LastMessage).await {
                    let preview = contacts::conversation_preview(
                        &summary.last_message,
                        store.local_user_id(),
                        contacts::DEFAULT_PREVIEW_LEN,
                    );
                    println!(
                        "[{}] {:<24} {:>3} unread{}  {}",
                        summary.initials.cyan(),
                        summary.display_name,
                        summary.unread_count,
                        if summary.online { " *" } else { "" },
                        preview
                    );
                }
            }
            "show" => {
                let messages = store.get_conversation(rest).await;
                for (day, group) in contacts::group_by_date(&messages) {
                    println!("{}", format!("-- {} --", contacts::day_label(day, chrono::Local::now().date_naive())).bright_black());
                    for msg in group {
                        let who = if msg.sender_id == store.local_user_id() { "me" } else { msg.sender_id.as_str() };
                        let state = if msg.is_provisional() {
                            " (sending)"
                        } else if msg.read {
                            " (read)"
                        } else {
                            ""
                        };
                        println!("{} {}: {}{}", msg.id, who, msg.content, state);
                    }
                }
                if store.is_typing(rest).await {
                    println!("{}", format!("{} is typing...", rest).italic());
                }
            }
            "read" => match store.mark_conversation_read(rest).await {
                Ok(n) => println!("marked {} message(s) read", n),
                Err(e) => println!("{} read sync failed: {}", "✗".red().bold(), e),
            },
            "delete" => match rest.parse::<u64>() {
                Ok(id) => {
                    if let Err(e) = store.delete(ServerId(id)).await {
                        println!("{} delete failed: {}", "✗".red().bold(), e);
                    }
                }
                Err(_) => println!("Usage: delete <message_id>"),
            },
            "clear" => match store.clear(rest).await {
                Ok(n) => println!("removed {} message(s)", n),
                Err(e) => println!("{} clear failed: {}", "✗".red().bold(), e),
            },
            "deliver" => {
                let Some((from, text)) = rest.split_once(' ') else {
                    println!("Usage: deliver <from> <message>");
                    continue;
                };
                backend.deliver(from, text).await;
            }
            "typing" => store.on_typing(rest).await,
            "notify" => match store.notify_typing(rest).await {
                Ok(true) => println!("{} typing notice sent to {}", "✓".green(), rest),
                Ok(false) => println!("{}", "not connected, notice skipped".yellow()),
                Err(e) => println!("{} typing notice failed: {}", "✗".red().bold(), e),
            },
            "drop" => {
                if backend.disconnect_push().await {
                    println!("realtime link dropped");
                }
            }
            "offline" => {
                let offline = rest != "off";
                backend.set_offline(offline).await;
                println!("backend {}", if offline { "offline" } else { "online" });
            }
            "fail" => backend.fail_next_send(FailMode::Server).await,
            "refresh" => match store.refresh().await {
                Ok(outcome) => println!(
                    "{} new, {} updated, {} suppressed",
                    outcome.inserted, outcome.updated, outcome.suppressed
                ),
                Err(e) => println!("{} refresh failed: {}", "✗".red().bold(), e),
            },
            "unread" => println!("{} unread", store.total_unread().await),
            "help" => print_help(),
            "quit" | "exit" => break,
            other => warn!("Unknown command: {}", other),
        }
    }

    poller.abort();
    pump.abort();
    notifier.abort();
    info!("Bye");
    Ok(())
}

async fn print_events(mut events: tokio::sync::broadcast::Receiver<StoreEvent>) {
    use tokio::sync::broadcast::error::RecvError;
    loop {
        match events.recv().await {
            Ok(StoreEvent::TypingChanged { peer_id, typing: true }) => {
                println!("{}", format!("{} is typing...", peer_id).italic())
            }
            Ok(StoreEvent::SendFailed { peer_id, reason, .. }) => {
                println!("{} message to {} not delivered: {}", "!".red().bold(), peer_id, reason)
            }
            Ok(StoreEvent::ReadSyncFailed { ids, .. }) => {
                println!("{} {} read receipt(s) rolled back", "!".yellow().bold(), ids.len())
            }
            Ok(StoreEvent::PresenceChanged { peer_id, online }) => {
                println!("{} is {}", peer_id, if online { "online".green() } else { "offline".bright_black() })
            }
            Ok(StoreEvent::ConnectionChanged { connection }) => match connection {
                ConnectionState::Connected => println!("{}", "realtime connected".green()),
                ConnectionState::Disconnected => println!("{}", "realtime disconnected".bright_black()),
                ConnectionState::Reconnecting { attempt } => {
                    println!("{}", format!("reconnecting (attempt {})...", attempt).yellow())
                }
                ConnectionState::PollingOnly => {
                    println!("{}", "realtime unavailable, polling only".yellow())
                }
            },
            Ok(_) => {}
            Err(RecvError::Lagged(n)) => warn!("Missed {} store event(s)", n),
            Err(RecvError::Closed) => break,
        }
    }
}

fn print_help() {
    println!("{}", "⚡ WireWave".bright_cyan().bold());
    println!();
    println!("{}", "Commands:".bright_white().bold());
    println!("  send <peer> <message>      Send a message");
    println!("  retry                      Re-send the last failed message");
    println!("  list [query]               List conversations");
    println!("  show <peer>                Show a conversation");
    println!("  read <peer>                Mark a conversation read");
    println!("  delete <id>                Delete a message");
    println!("  clear <peer>               Clear a conversation");
    println!("  deliver <from> <message>   Simulate an incoming message");
    println!("  typing <peer>              Simulate a typing event");
    println!("  notify <peer>              Tell a peer we are typing");
    println!("  drop                       Drop the realtime link");
    println!("  offline [off]              Take the backend offline (or back)");
    println!("  fail                       Fail the next send on the server");
    println!("  refresh                    Fetch and reconcile now");
    println!("  unread                     Total unread count");
    println!("  quit");
}
