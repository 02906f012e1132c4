use parley_core::event::{Event, EventPayload};

/// Turns a bus event into a line for the terminal. Events the user does
/// not need to see yield `None`.
pub fn render(event: &Event, self_id: &str) -> Option<String> {
    match &event.payload {
        EventPayload::ConnectionEstablished { .. } => Some("* connected".to_string()),
        EventPayload::ConnectionLost { reason, will_retry } => Some(if *will_retry {
            format!("* connection lost ({reason}), retrying")
        } else {
            format!("* disconnected ({reason})")
        }),
        EventPayload::ConnectionReconnecting { attempt } => {
            Some(format!("* reconnect attempt {} failed", attempt))
        }
        EventPayload::SessionEnded => Some("* logged out".to_string()),
        EventPayload::ErrorOccurred {
            component, message, ..
        } => Some(format!("! {component}: {message}")),
        EventPayload::PresenceUpdated { online } if online.is_empty() => {
            Some("* nobody else is online".to_string())
        }
        EventPayload::PresenceUpdated { online } => {
            let names: Vec<String> = online
                .iter()
                .map(|entry| format!("{} ({})", entry.user_name, entry.user_id))
                .collect();
            Some(format!("* online: {}", names.join(", ")))
        }
        EventPayload::ConversationLoaded { peer_id, messages } => {
            Some(format!("* {messages} messages with {peer_id}"))
        }
        EventPayload::MessageAppended { message, .. } => {
            let author = if message.sender_id == self_id {
                "you"
            } else {
                message.sender_id.as_str()
            };
            Some(format!(
                "[{}] {author}: {}",
                message.created_at.format("%H:%M"),
                message.content
            ))
        }
        EventPayload::UnreadChanged { peer_id, count } if *count > 0 => {
            Some(format!("* {count} unread from {peer_id}"))
        }
        EventPayload::UnreadLoaded { counts } if !counts.is_empty() => {
            let summary: Vec<String> = counts
                .iter()
                .map(|(peer_id, count)| format!("{peer_id}: {count}"))
                .collect();
            Some(format!("* unread {}", summary.join(", ")))
        }
        EventPayload::PeerSelected { peer_id } => Some(format!("* talking to {peer_id}")),
        EventPayload::MessageReconciled { .. }
        | EventPayload::MessageRead { .. }
        | EventPayload::UnreadChanged { .. }
        | EventPayload::UnreadLoaded { .. } => None,
    }
}
