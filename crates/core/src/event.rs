use chrono::{DateTime, Utc};
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::EventBusError;
use crate::types::{Message, MessageId, PresenceEntry, UnreadSnapshot};

/// Hierarchical channel name validation and parsing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Channel(String);

impl Channel {
    /// Create a new channel, validating its format.
    pub fn new(name: impl Into<String>) -> crate::Result<Self> {
        let name = name.into();
        if Self::is_valid(&name) {
            Ok(Self(name))
        } else {
            Err(crate::ParleyError::Internal(format!(
                "Invalid channel name: {}",
                name
            )))
        }
    }

    /// Check if a channel name is valid.
    pub fn is_valid(name: &str) -> bool {
        if name.is_empty() || name.starts_with('.') || name.ends_with('.') || name.contains("..") {
            return false;
        }

        // Lowercase words separated by dots; underscores allowed inside words
        if name
            .chars()
            .any(|c| !matches!(c, 'a'..='z' | '0'..='9' | '.' | '_'))
        {
            return false;
        }

        matches!(
            name.split('.').next(),
            Some("system") | Some("sync") | Some("ui")
        )
    }

    /// Get the domain of the channel.
    pub fn domain(&self) -> &str {
        self.0.split('.').next().unwrap_or("")
    }

    /// Get the full channel name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.0
    }
}

/// The envelope wrapping everything published to the view layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Hierarchical channel name (e.g., "sync.unread.changed")
    pub channel: Channel,

    /// When the event was created (UTC)
    pub timestamp: DateTime<Utc>,

    /// Unique identifier for this event
    pub id: Uuid,

    /// Component that emitted this event
    pub source: EventSource,

    /// The typed event payload
    pub payload: EventPayload,
}

impl Event {
    pub fn new(channel: Channel, source: EventSource, payload: EventPayload) -> Self {
        Self {
            channel,
            timestamp: Utc::now(),
            id: Uuid::new_v4(),
            source,
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "camelCase")]
pub enum EventSource {
    /// Named engine component
    System(String),
    /// The event channel connection
    Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum EventPayload {
    // ── System events ──────────────────────────────────────────────
    ConnectionEstablished {
        user_id: String,
        generation: u64,
    },
    ConnectionLost {
        reason: String,
        will_retry: bool,
    },
    ConnectionReconnecting {
        attempt: u32,
    },
    SessionEnded,
    ErrorOccurred {
        component: String,
        message: String,
        recoverable: bool,
    },

    // ── Sync events ────────────────────────────────────────────────
    PresenceUpdated {
        online: Vec<PresenceEntry>,
    },
    ConversationLoaded {
        peer_id: String,
        messages: usize,
    },
    MessageAppended {
        peer_id: String,
        message: Message,
    },
    MessageReconciled {
        peer_id: String,
        temporary_id: MessageId,
        id: MessageId,
    },
    MessageRead {
        message_id: String,
    },
    UnreadChanged {
        peer_id: String,
        count: u32,
    },
    UnreadLoaded {
        counts: UnreadSnapshot,
    },

    // ── UI events ──────────────────────────────────────────────────
    PeerSelected {
        peer_id: String,
    },
}

pub trait EventBus: Send + Sync + 'static {
    fn publish(&self, event: Event) -> Result<(), EventBusError>;
    fn subscribe(&self, pattern: &str) -> Result<EventSubscription, EventBusError>;
}

#[derive(Clone)]
pub struct BroadcastEventBus {
    system_sender: broadcast::Sender<Event>,
    sync_sender: broadcast::Sender<Event>,
    ui_sender: broadcast::Sender<Event>,
}

impl BroadcastEventBus {
    pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

    pub fn new(channel_capacity: usize) -> Self {
        let capacity = channel_capacity.max(1);
        let (system_sender, _) = broadcast::channel(capacity);
        let (sync_sender, _) = broadcast::channel(capacity);
        let (ui_sender, _) = broadcast::channel(capacity);

        Self {
            system_sender,
            sync_sender,
            ui_sender,
        }
    }

    fn sender_for_domain(&self, domain: &str) -> Option<&broadcast::Sender<Event>> {
        match domain {
            "system" => Some(&self.system_sender),
            "sync" => Some(&self.sync_sender),
            "ui" => Some(&self.ui_sender),
            _ => None,
        }
    }

    fn receivers_for_pattern(&self, pattern: &str) -> Result<DomainReceivers, EventBusError> {
        let first_segment = pattern.split('.').next().unwrap_or_default();

        if first_segment.is_empty() {
            return Err(EventBusError::InvalidPattern(pattern.to_string()));
        }

        if has_glob_meta(first_segment) {
            return Ok(DomainReceivers {
                system: Some(self.system_sender.subscribe()),
                sync: Some(self.sync_sender.subscribe()),
                ui: Some(self.ui_sender.subscribe()),
            });
        }

        let mut receivers = DomainReceivers::default();
        match first_segment {
            "system" => receivers.system = Some(self.system_sender.subscribe()),
            "sync" => receivers.sync = Some(self.sync_sender.subscribe()),
            "ui" => receivers.ui = Some(self.ui_sender.subscribe()),
            _ => return Err(EventBusError::InvalidPattern(pattern.to_string())),
        }
        Ok(receivers)
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CHANNEL_CAPACITY)
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, event: Event) -> Result<(), EventBusError> {
        let sender = self
            .sender_for_domain(event.channel.domain())
            .ok_or_else(|| EventBusError::InvalidChannel(event.channel.to_string()))?;

        // No subscribers is not an error.
        let _ = sender.send(event);
        Ok(())
    }

    fn subscribe(&self, pattern: &str) -> Result<EventSubscription, EventBusError> {
        let matcher = Glob::new(pattern)
            .map_err(|_| EventBusError::InvalidPattern(pattern.to_string()))?
            .compile_matcher();
        let receivers = self.receivers_for_pattern(pattern)?;

        Ok(EventSubscription { matcher, receivers })
    }
}

#[derive(Default)]
struct DomainReceivers {
    system: Option<broadcast::Receiver<Event>>,
    sync: Option<broadcast::Receiver<Event>>,
    ui: Option<broadcast::Receiver<Event>>,
}

pub struct EventSubscription {
    matcher: GlobMatcher,
    receivers: DomainReceivers,
}

impl EventSubscription {
    pub async fn recv(&mut self) -> Result<Event, EventBusError> {
        loop {
            let received = tokio::select! {
                result = recv_from_domain(self.receivers.system.as_mut()) => result,
                result = recv_from_domain(self.receivers.sync.as_mut()) => result,
                result = recv_from_domain(self.receivers.ui.as_mut()) => result,
            };

            match received {
                Ok(event) if self.matcher.is_match(event.channel.as_str()) => return Ok(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(EventBusError::ChannelClosed);
                }
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    return Err(EventBusError::Lagged(count));
                }
            }
        }
    }

    /// Returns the next already-published matching event without waiting.
    pub fn try_recv(&mut self) -> Option<Event> {
        for receiver in [
            self.receivers.system.as_mut(),
            self.receivers.sync.as_mut(),
            self.receivers.ui.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            while let Ok(event) = receiver.try_recv() {
                if self.matcher.is_match(event.channel.as_str()) {
                    return Some(event);
                }
            }
        }
        None
    }
}

async fn recv_from_domain(
    receiver: Option<&mut broadcast::Receiver<Event>>,
) -> Result<Event, broadcast::error::RecvError> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

fn has_glob_meta(segment: &str) -> bool {
    segment.contains(['*', '?', '[', ']', '{', '}', '!'])
}

/// Publishes `payload` on `channel_name`, logging instead of failing.
pub fn publish_or_log(
    event_bus: &dyn EventBus,
    channel_name: &str,
    source: EventSource,
    payload: EventPayload,
) {
    let channel = match Channel::new(channel_name) {
        Ok(channel) => channel,
        Err(error) => {
            tracing::warn!(channel = channel_name, error = %error, "refusing to publish");
            return;
        }
    };

    if let Err(error) = event_bus.publish(Event::new(channel, source, payload)) {
        tracing::warn!(channel = channel_name, error = %error, "event publish failed");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn test_channel_validation() {
        assert!(Channel::is_valid("system.connection.established"));
        assert!(Channel::is_valid("sync.unread.changed"));
        assert!(Channel::is_valid("ui.peer.selected"));
        assert!(Channel::is_valid("sync.message.appended_live"));

        assert!(!Channel::is_valid("mail.message.received"));
        assert!(!Channel::is_valid("system..double.dot"));
        assert!(!Channel::is_valid(".starts.with.dot"));
        assert!(!Channel::is_valid("ends.with.dot."));
        assert!(!Channel::is_valid("UpperCase"));
        assert!(!Channel::is_valid("with-hyphen"));
        assert!(!Channel::is_valid(""));
    }

    #[test]
    fn test_channel_domain() {
        let c = Channel::new("sync.presence.updated").unwrap();
        assert_eq!(c.domain(), "sync");
    }

    #[tokio::test]
    async fn subscription_filters_by_glob() {
        let bus = BroadcastEventBus::new(16);
        let mut unread = bus.subscribe("sync.unread.*").unwrap();

        publish_or_log(
            &bus,
            "sync.presence.updated",
            EventSource::System("test".into()),
            EventPayload::PresenceUpdated { online: vec![] },
        );
        publish_or_log(
            &bus,
            "sync.unread.changed",
            EventSource::System("test".into()),
            EventPayload::UnreadChanged {
                peer_id: "bob".into(),
                count: 2,
            },
        );

        let event = tokio::time::timeout(Duration::from_millis(100), unread.recv())
            .await
            .expect("timed out")
            .expect("should receive event");
        assert_matches!(
            event.payload,
            EventPayload::UnreadChanged { ref peer_id, count: 2 } if peer_id == "bob"
        );
    }

    #[tokio::test]
    async fn wildcard_domain_receives_everything() {
        let bus = BroadcastEventBus::new(16);
        let mut all = bus.subscribe("*.**").unwrap();

        publish_or_log(
            &bus,
            "ui.peer.selected",
            EventSource::System("sync".into()),
            EventPayload::PeerSelected {
                peer_id: "u2".into(),
            },
        );

        let event = all.try_recv().expect("event should be buffered");
        assert_eq!(event.channel.as_str(), "ui.peer.selected");
    }

    #[test]
    fn unknown_domain_pattern_is_rejected() {
        let bus = BroadcastEventBus::default();
        assert_matches!(
            bus.subscribe("plugin.**").err(),
            Some(EventBusError::InvalidPattern(_))
        );
        assert_matches!(bus.subscribe("").err(), Some(EventBusError::InvalidPattern(_)));
    }
}
