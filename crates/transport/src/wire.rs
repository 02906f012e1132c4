//! Socket.IO v5 packets carried in Engine.IO v4 text frames.
//!
//! Only the default namespace is used. A frame is one Engine.IO packet; the
//! `4` (message) packet wraps a Socket.IO packet such as
//! `42["new_message",{...}]`.

use serde::Deserialize;
use serde_json::{Value, json};

use parley_core::{PresenceEntry, WireMessage};

use crate::error::WireError;

pub const EVENT_USER_CONNECTED: &str = "user_connected";
pub const EVENT_USERS_ONLINE: &str = "users_online";
pub const EVENT_PRIVATE_MESSAGE: &str = "private_message";
pub const EVENT_NEW_MESSAGE: &str = "new_message";
pub const EVENT_MARK_AS_READ: &str = "mark_as_read";
pub const EVENT_MESSAGE_READ: &str = "message_read";
pub const EVENT_CONNECT_ERROR: &str = "connect_error";

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Engine.IO handshake with session parameters.
    Open(Value),
    Close,
    Ping,
    Pong,
    Noop,
    /// Namespace connect; the server's answer carries a payload.
    Connect(Option<Value>),
    Disconnect,
    Event { name: String, data: Value },
    ConnectError(Value),
}

pub fn decode(frame: &str) -> Result<Packet, WireError> {
    let mut chars = frame.chars();
    let kind = chars.next().ok_or(WireError::Empty)?;
    let rest = chars.as_str();

    match kind {
        '0' => Ok(Packet::Open(parse_optional(rest)?.unwrap_or(Value::Null))),
        '1' => Ok(Packet::Close),
        // Upgrade pings carry a payload that is ignored on a direct WebSocket.
        '2' => Ok(Packet::Ping),
        '3' => Ok(Packet::Pong),
        '6' => Ok(Packet::Noop),
        '4' => decode_socket_packet(rest),
        other => Err(WireError::UnknownPacket(other)),
    }
}

fn decode_socket_packet(body: &str) -> Result<Packet, WireError> {
    let mut chars = body.chars();
    let kind = chars.next().ok_or(WireError::Empty)?;
    let rest = strip_namespace(chars.as_str());

    match kind {
        '0' => Ok(Packet::Connect(parse_optional(rest)?)),
        '1' => Ok(Packet::Disconnect),
        '2' => decode_event(rest),
        '4' => Ok(Packet::ConnectError(
            parse_optional(rest)?.unwrap_or(Value::Null),
        )),
        other => Err(WireError::UnknownPacket(other)),
    }
}

fn strip_namespace(rest: &str) -> &str {
    if rest.starts_with('/') {
        match rest.find(',') {
            Some(pos) => &rest[pos + 1..],
            None => "",
        }
    } else {
        rest
    }
}

fn decode_event(rest: &str) -> Result<Packet, WireError> {
    // An ack id may sit between the packet type and the payload.
    let payload = rest.trim_start_matches(|c: char| c.is_ascii_digit());
    let values: Vec<Value> = serde_json::from_str(payload)?;
    let mut values = values.into_iter();

    let name = match values.next() {
        Some(Value::String(name)) => name,
        Some(other) => {
            return Err(WireError::Malformed(format!(
                "event name must be a string, got {other}"
            )));
        }
        None => return Err(WireError::Malformed("event without a name".into())),
    };
    let data = values.next().unwrap_or(Value::Null);

    Ok(Packet::Event { name, data })
}

fn parse_optional(rest: &str) -> Result<Option<Value>, WireError> {
    if rest.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(rest)?))
}

pub fn encode(packet: &Packet) -> String {
    match packet {
        Packet::Open(info) => format!("0{info}"),
        Packet::Close => "1".to_string(),
        Packet::Ping => "2".to_string(),
        Packet::Pong => "3".to_string(),
        Packet::Noop => "6".to_string(),
        Packet::Connect(None) => "40".to_string(),
        Packet::Connect(Some(auth)) => format!("40{auth}"),
        Packet::Disconnect => "41".to_string(),
        Packet::Event { name, data } => {
            let body = if data.is_null() {
                json!([name])
            } else {
                json!([name, data])
            };
            format!("42{body}")
        }
        Packet::ConnectError(data) => format!("44{data}"),
    }
}

/// Events the server pushes to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// Full replacement of the online set.
    UsersOnline(Vec<PresenceEntry>),
    NewMessage {
        message: WireMessage,
        sender: String,
    },
    MessageRead {
        message_id: String,
    },
    ConnectError {
        reason: String,
    },
}

#[derive(Deserialize)]
struct NewMessagePayload {
    message: WireMessage,
    sender: String,
}

impl InboundEvent {
    pub fn from_event(name: &str, data: Value) -> Result<Self, WireError> {
        match name {
            EVENT_USERS_ONLINE => Ok(Self::UsersOnline(serde_json::from_value(data)?)),
            EVENT_NEW_MESSAGE => {
                let payload: NewMessagePayload = serde_json::from_value(data)?;
                Ok(Self::NewMessage {
                    message: payload.message,
                    sender: payload.sender,
                })
            }
            EVENT_MESSAGE_READ => match data {
                Value::String(message_id) if !message_id.is_empty() => {
                    Ok(Self::MessageRead { message_id })
                }
                other => Err(WireError::Malformed(format!(
                    "message_read expects a message id, got {other}"
                ))),
            },
            EVENT_CONNECT_ERROR => Ok(Self::ConnectError {
                reason: describe_error(&data),
            }),
            other => Err(WireError::UnknownEvent(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::UsersOnline(_) => EVENT_USERS_ONLINE,
            Self::NewMessage { .. } => EVENT_NEW_MESSAGE,
            Self::MessageRead { .. } => EVENT_MESSAGE_READ,
            Self::ConnectError { .. } => EVENT_CONNECT_ERROR,
        }
    }
}

/// Events the client emits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundEvent {
    UserConnected {
        user_id: String,
        user_name: String,
    },
    PrivateMessage {
        sender_id: String,
        receiver_id: String,
        content: String,
    },
    MarkAsRead {
        message_id: String,
    },
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::UserConnected { .. } => EVENT_USER_CONNECTED,
            Self::PrivateMessage { .. } => EVENT_PRIVATE_MESSAGE,
            Self::MarkAsRead { .. } => EVENT_MARK_AS_READ,
        }
    }

    pub fn to_packet(&self) -> Packet {
        let data = match self {
            Self::UserConnected { user_id, user_name } => {
                json!({ "userId": user_id, "userName": user_name })
            }
            Self::PrivateMessage {
                sender_id,
                receiver_id,
                content,
            } => json!({
                "senderId": sender_id,
                "receiverId": receiver_id,
                "content": content,
            }),
            Self::MarkAsRead { message_id } => json!(message_id),
        };
        Packet::Event {
            name: self.name().to_string(),
            data,
        }
    }

    pub fn encode(&self) -> String {
        encode(&self.to_packet())
    }
}

/// Human-readable reason from a connect error payload.
pub fn describe_error(data: &Value) -> String {
    match data {
        Value::String(message) => message.clone(),
        Value::Object(fields) => fields
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| data.to_string()),
        Value::Null => "unspecified".to_string(),
        other => other.to_string(),
    }
}
