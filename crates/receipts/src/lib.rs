//! Decides which messages to acknowledge as read and applies the server's
//! read confirmations.
//!
//! Acks are fire-and-forget. A message only becomes `read` locally when the
//! server confirms it with `message_read`.

use std::collections::HashSet;

use tracing::{debug, trace};

use parley_core::{DeliveryState, Message, ReadStateSink};

pub struct ReadReceiptCoordinator {
    self_id: String,
    /// Ids acked or confirmed during the current connection.
    acked: HashSet<String>,
}

impl ReadReceiptCoordinator {
    pub fn new(self_id: impl Into<String>) -> Self {
        Self {
            self_id: self_id.into(),
            acked: HashSet::new(),
        }
    }

    /// Returns the id to ack for a message that just arrived, if its sender
    /// is the open conversation.
    pub fn ack_for_inbound(&mut self, message: &Message, active_peer: Option<&str>) -> Option<String> {
        let peer_id = active_peer?;
        self.claim(message, peer_id)
    }

    /// Ids to ack for a freshly loaded conversation with `peer_id`: unread
    /// messages the peer sent us that have not been acked yet.
    pub fn acks_for_history(&mut self, peer_id: &str, messages: &[Message]) -> Vec<String> {
        let acks: Vec<String> = messages
            .iter()
            .filter_map(|message| self.claim(message, peer_id))
            .collect();
        if !acks.is_empty() {
            debug!(peer_id, count = acks.len(), "acking unread history");
        }
        acks
    }

    /// Applies an authoritative `message_read`. Unknown or already read ids
    /// are ignored.
    pub fn on_read_confirmation<S>(&mut self, message_id: &str, sink: &mut S) -> bool
    where
        S: ReadStateSink + ?Sized,
    {
        self.acked.insert(message_id.to_string());
        let changed = sink.mark_read(message_id);
        trace!(message_id, changed, "read confirmation applied");
        changed
    }

    pub fn is_acked(&self, message_id: &str) -> bool {
        self.acked.contains(message_id)
    }

    /// Forgets what was acked; the next connection may need to ack again.
    pub fn reset(&mut self) {
        self.acked.clear();
    }

    fn claim(&mut self, message: &Message, peer_id: &str) -> Option<String> {
        let id = message.id.as_server()?;
        let eligible = message.sender_id == peer_id
            && message.receiver_id == self.self_id
            && message.delivery_state < DeliveryState::Read;
        if eligible && self.acked.insert(id.to_string()) {
            Some(id.to_string())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use parley_core::MessageId;

    use super::*;

    const ME: &str = "u1";
    const BOB: &str = "u2";

    fn message(id: MessageId, sender: &str, receiver: &str, state: DeliveryState) -> Message {
        Message {
            id,
            sender_id: sender.to_string(),
            receiver_id: receiver.to_string(),
            content: "hey".to_string(),
            created_at: Utc::now(),
            is_read: state == DeliveryState::Read,
            delivery_state: state,
        }
    }

    fn from_bob(id: &str) -> Message {
        message(MessageId::server(id), BOB, ME, DeliveryState::Acknowledged)
    }

    #[derive(Default)]
    struct RecordingSink {
        read: Vec<String>,
    }

    impl ReadStateSink for RecordingSink {
        fn mark_read(&mut self, message_id: &str) -> bool {
            if self.read.iter().any(|id| id == message_id) {
                return false;
            }
            self.read.push(message_id.to_string());
            true
        }
    }

    #[test]
    fn inbound_from_active_peer_is_acked_once() {
        let mut receipts = ReadReceiptCoordinator::new(ME);
        let incoming = from_bob("m1");

        assert_eq!(receipts.ack_for_inbound(&incoming, Some(BOB)), Some("m1".to_string()));
        assert_eq!(receipts.ack_for_inbound(&incoming, Some(BOB)), None);
    }

    #[test]
    fn inbound_from_other_peer_is_not_acked() {
        let mut receipts = ReadReceiptCoordinator::new(ME);
        assert_eq!(receipts.ack_for_inbound(&from_bob("m1"), Some("u3")), None);
        assert_eq!(receipts.ack_for_inbound(&from_bob("m1"), None), None);
        assert!(!receipts.is_acked("m1"));
    }

    #[test]
    fn history_acks_only_unread_messages_from_peer() {
        let mut receipts = ReadReceiptCoordinator::new(ME);
        let history = vec![
            from_bob("m1"),
            message(MessageId::server("m2"), ME, BOB, DeliveryState::Acknowledged),
            message(MessageId::server("m3"), BOB, ME, DeliveryState::Read),
            message(MessageId::Temporary(4), BOB, ME, DeliveryState::Pending),
            from_bob("m5"),
        ];

        assert_eq!(receipts.acks_for_history(BOB, &history), ["m1", "m5"]);
        assert!(receipts.acks_for_history(BOB, &history).is_empty());
    }

    #[test]
    fn confirmation_is_applied_and_idempotent() {
        let mut receipts = ReadReceiptCoordinator::new(ME);
        let mut sink = RecordingSink::default();

        assert!(receipts.on_read_confirmation("m1", &mut sink));
        assert!(!receipts.on_read_confirmation("m1", &mut sink));
        assert_eq!(sink.read, ["m1"]);
    }

    #[test]
    fn confirmed_messages_are_never_acked() {
        let mut receipts = ReadReceiptCoordinator::new(ME);
        let mut sink = RecordingSink::default();
        receipts.on_read_confirmation("m1", &mut sink);

        assert_eq!(receipts.ack_for_inbound(&from_bob("m1"), Some(BOB)), None);
    }

    #[test]
    fn reset_allows_acking_again() {
        let mut receipts = ReadReceiptCoordinator::new(ME);
        let history = vec![from_bob("m1")];
        receipts.acks_for_history(BOB, &history);

        receipts.reset();

        assert_eq!(receipts.acks_for_history(BOB, &history), ["m1"]);
    }
}
