use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unread counts keyed by peer user id.
pub type UnreadSnapshot = BTreeMap<String, u32>;

/// The logged-in identity, threaded explicitly through the sync engine.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
    pub user_name: String,
    pub auth_token: String,
}

impl Session {
    pub fn new(
        user_id: impl Into<String>,
        user_name: impl Into<String>,
        auth_token: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
            auth_token: auth_token.into(),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("user_name", &self.user_name)
            .field("auth_token", &"<redacted>")
            .finish()
    }
}

/// An online peer as announced by the `users_online` snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub user_id: String,
    pub user_name: String,
}

impl PresenceEntry {
    pub fn new(user_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum MessageId {
    /// Client-generated, unique within the running session.
    Temporary(u64),
    /// Issued by the server.
    Server(String),
}

impl MessageId {
    pub fn server(id: impl Into<String>) -> Self {
        Self::Server(id.into())
    }

    pub fn as_server(&self) -> Option<&str> {
        match self {
            Self::Server(id) => Some(id),
            Self::Temporary(_) => None,
        }
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Temporary(n) => write!(f, "tmp-{n}"),
            Self::Server(id) => f.write_str(id),
        }
    }
}

/// Lifecycle of a message. Ordered so that a state may only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeliveryState {
    Pending,
    Acknowledged,
    Read,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
    pub delivery_state: DeliveryState,
}

impl Message {
    /// Moves the delivery state forward. Returns `false` when `state` would
    /// not advance it.
    pub fn advance_to(&mut self, state: DeliveryState) -> bool {
        if state <= self.delivery_state {
            return false;
        }
        self.delivery_state = state;
        if state == DeliveryState::Read {
            self.is_read = true;
        }
        true
    }
}

/// Message layout used by the server on the channel and the REST API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    #[serde(rename = "_id")]
    pub id: String,
    pub sender: String,
    pub receiver: String,
    pub content: String,
    #[serde(default)]
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

impl From<WireMessage> for Message {
    fn from(wire: WireMessage) -> Self {
        let delivery_state = if wire.is_read {
            DeliveryState::Read
        } else {
            DeliveryState::Acknowledged
        };
        Self {
            id: MessageId::Server(wire.id),
            sender_id: wire.sender,
            receiver_id: wire.receiver,
            content: wire.content,
            created_at: wire.created_at,
            is_read: wire.is_read,
            delivery_state,
        }
    }
}

/// Something that can apply an authoritative read confirmation.
pub trait ReadStateSink {
    /// Marks the message read. Returns `true` if anything changed.
    fn mark_read(&mut self, message_id: &str) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(id: &str, is_read: bool) -> WireMessage {
        WireMessage {
            id: id.to_string(),
            sender: "bob".to_string(),
            receiver: "alice".to_string(),
            content: "hello".to_string(),
            is_read,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn delivery_state_never_regresses() {
        let mut message = Message::from(wire("m1", false));
        assert_eq!(message.delivery_state, DeliveryState::Acknowledged);

        assert!(message.advance_to(DeliveryState::Read));
        assert!(message.is_read);
        assert!(!message.advance_to(DeliveryState::Acknowledged));
        assert!(!message.advance_to(DeliveryState::Pending));
        assert_eq!(message.delivery_state, DeliveryState::Read);
    }

    #[test]
    fn wire_message_maps_read_flag_to_delivery_state() {
        let read = Message::from(wire("m1", true));
        assert_eq!(read.delivery_state, DeliveryState::Read);
        assert_eq!(read.id, MessageId::server("m1"));
    }

    #[test]
    fn wire_message_parses_server_layout() {
        let json = r#"{
            "_id": "65f0c2",
            "sender": "u1",
            "receiver": "u2",
            "content": "hey",
            "isRead": false,
            "createdAt": "2024-03-12T10:15:30.000Z",
            "__v": 0
        }"#;
        let parsed: WireMessage = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.id, "65f0c2");
        assert_eq!(parsed.sender, "u1");
        assert!(!parsed.is_read);
    }

    #[test]
    fn missing_read_flag_defaults_to_unread() {
        let json = r#"{"_id":"a","sender":"u1","receiver":"u2","content":"x","createdAt":"2024-03-12T10:15:30Z"}"#;
        let parsed: WireMessage = serde_json::from_str(json).unwrap();
        assert!(!parsed.is_read);
    }

    #[test]
    fn temporary_ids_render_with_prefix() {
        assert_eq!(MessageId::Temporary(7).to_string(), "tmp-7");
        assert_eq!(MessageId::server("abc").to_string(), "abc");
        assert!(MessageId::Temporary(1).as_server().is_none());
    }

    #[test]
    fn session_debug_redacts_token() {
        let session = Session::new("u1", "Alice", "secret-token");
        let rendered = format!("{session:?}");
        assert!(!rendered.contains("secret-token"));
        assert!(rendered.contains("Alice"));
    }
}
