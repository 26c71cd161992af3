/// Contact derivation: summaries, display names, previews, search and sorting
///
/// There is no contact endpoint on the backend; contacts are whoever the
/// local user has exchanged messages with.
use crate::error::{Result, SyncError};
use crate::message::Message;
use crate::message_log::MessageLog;
use crate::messenger_types::{ConversationSummary, Profile};
use crate::typing::TypingPresenceTracker;
use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

pub const DEFAULT_PREVIEW_LEN: usize = 50;

/// Ordering for the contact list
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortMode {
    #[default]
    LastMessage,
    Name,
    Unread,
    Online,
}

/// Rebuild every conversation summary from the log.
///
/// Sorted by last message time, most recent first; conversations with no
/// entries are omitted.
pub fn derive_summaries(
    log: &MessageLog,
    local_user_id: &str,
    profiles: &HashMap<String, Profile>,
    presence: &TypingPresenceTracker,
) -> Vec<ConversationSummary> {
    let mut out: Vec<ConversationSummary> = log
        .conversations()
        .filter_map(|(key, msgs)| {
            let peer_id = key.peer_of(local_user_id)?;
            let last = msgs.last()?;
            let unread_count = msgs
                .iter()
                .filter(|m| m.receiver_id == local_user_id && m.sender_id == peer_id && !m.read)
                .count();
            let profile = profiles.get(peer_id).cloned();
            let display_name = profile
                .as_ref()
                .and_then(|p| p.name.clone())
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| display_name(peer_id));
            Some(ConversationSummary {
                peer_id: peer_id.to_string(),
                initials: initials(&display_name),
                display_name,
                last_message: last.clone(),
                last_message_at: last.sent_at,
                unread_count,
                online: presence.is_online(peer_id),
                profile,
            })
        })
        .collect();
    sort_summaries(&mut out, SortMode::LastMessage);
    out
}

/// "john.doe_smith@x.com" -> "John Doe Smith"
pub fn display_name(email: &str) -> String {
    let local_part = email.split('@').next().unwrap_or_default();
    if local_part.is_empty() {
        return "Unknown".to_string();
    }
    local_part
        .split(&['.', '_', ' '][..])
        .filter(|w| !w.is_empty())
        .map(title_case)
        .collect::<Vec<_>>()
        .join(" ")
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

/// Avatar initials from a display name: "John Doe" -> "JD", "Alice" -> "AL"
pub fn initials(name: &str) -> String {
    let words: Vec<&str> = name.split_whitespace().collect();
    let raw: String = match words.as_slice() {
        [] => "U".to_string(),
        [single] => single.chars().take(2).collect(),
        [first, second, ..] => first.chars().take(1).chain(second.chars().take(1)).collect(),
    };
    raw.to_uppercase()
}

/// Last-message snippet for the contact list
pub fn conversation_preview(last: &Message, local_user_id: &str, max_len: usize) -> String {
    let prefix = if last.sender_id == local_user_id { "You: " } else { "" };
    let content = if last.content.chars().count() > max_len {
        let cut: String = last.content.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", cut)
    } else {
        last.content.clone()
    };
    format!("{}{}", prefix, content)
}

/// Case-insensitive match on name, id or last message text
pub fn search<'a>(summaries: &'a [ConversationSummary], query: &str) -> Vec<&'a ConversationSummary> {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return summaries.iter().collect();
    }
    summaries
        .iter()
        .filter(|s| {
            s.display_name.to_lowercase().contains(&needle)
                || s.peer_id.to_lowercase().contains(&needle)
                || s.last_message.content.to_lowercase().contains(&needle)
        })
        .collect()
}

pub fn sort_summaries(summaries: &mut [ConversationSummary], mode: SortMode) {
    let by_recency = |a: &ConversationSummary, b: &ConversationSummary| {
        b.last_message_at
            .cmp(&a.last_message_at)
            .then_with(|| a.peer_id.cmp(&b.peer_id))
    };
    summaries.sort_by(|a, b| match mode {
        SortMode::LastMessage => by_recency(a, b),
        SortMode::Name => a
            .display_name
            .to_lowercase()
            .cmp(&b.display_name.to_lowercase())
            .then_with(|| a.peer_id.cmp(&b.peer_id)),
        SortMode::Unread => b
            .unread_count
            .cmp(&a.unread_count)
            .then_with(|| by_recency(a, b)),
        SortMode::Online => match (a.online, b.online) {
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            _ => by_recency(a, b),
        },
    });
}

/// Check an address typed in to start a new conversation
pub fn validate_contact_email(email: &str, local_user_id: &str) -> Result<String> {
    let email = email.trim();
    if email.is_empty() {
        return Err(SyncError::Validation("Email is required".to_string()));
    }
    if !looks_like_email(email) {
        return Err(SyncError::Validation(
            "Please enter a valid email address".to_string(),
        ));
    }
    if email.eq_ignore_ascii_case(local_user_id) {
        return Err(SyncError::Validation("You cannot message yourself".to_string()));
    }
    Ok(email.to_string())
}

fn looks_like_email(s: &str) -> bool {
    if s.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((user, domain)) = s.split_once('@') else {
        return false;
    };
    if user.is_empty() || domain.contains('@') {
        return false;
    }
    domain
        .char_indices()
        .any(|(i, c)| c == '.' && i > 0 && i + 1 < domain.len())
}

/// Split an ordered conversation into calendar days (local time)
pub fn group_by_date(messages: &[Message]) -> Vec<(NaiveDate, Vec<&Message>)> {
    let mut groups: Vec<(NaiveDate, Vec<&Message>)> = Vec::new();
    for msg in messages {
        let day = msg.sent_at.with_timezone(&Local).date_naive();
        match groups.last_mut() {
            Some((d, bucket)) if *d == day => bucket.push(msg),
            _ => groups.push((day, vec![msg])),
        }
    }
    groups
}

/// "Today", "Yesterday", a weekday name within the last week, else a full date
pub fn day_label(day: NaiveDate, today: NaiveDate) -> String {
    match (today - day).num_days() {
        0 => "Today".to_string(),
        1 => "Yesterday".to_string(),
        2..=6 => day.format("%A").to_string(),
        _ => day.format("%B %-d, %Y").to_string(),
    }
}
