use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, trace};

use parley_core::{DeliveryState, Message, MessageId, ReadStateSink};

pub const DEFAULT_RECONCILE_WINDOW: Duration = Duration::from_secs(120);

/// What `receive_inbound` did with an authoritative message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    /// Stored as a new entry.
    Appended,
    /// Took over an optimistic entry, which now carries `id`.
    Reconciled {
        temporary_id: MessageId,
        id: MessageId,
    },
    /// Already stored; only the delivery state was merged.
    Duplicate,
}

/// Per-peer message logs ordered by `created_at`, ties in insertion order.
pub struct MessageStore {
    conversations: HashMap<String, Vec<Message>>,
    reconcile_window: TimeDelta,
    next_temporary: u64,
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new(DEFAULT_RECONCILE_WINDOW)
    }
}

impl MessageStore {
    pub fn new(reconcile_window: Duration) -> Self {
        Self {
            conversations: HashMap::new(),
            reconcile_window: TimeDelta::from_std(reconcile_window).unwrap_or(TimeDelta::MAX),
            next_temporary: 0,
        }
    }

    /// Replaces the log for `peer_id` with `history`.
    ///
    /// The fetched set is de-duplicated by id and sorted. Entries already in
    /// the log are folded in rather than thrown away: known ids keep the
    /// further of the two delivery states, optimistic entries echoed by the
    /// history give way to the authoritative copy, and anything else (unmatched
    /// optimistic sends, messages received after the snapshot was taken) is
    /// retained in order.
    pub fn load_history(&mut self, peer_id: &str, history: Vec<Message>) -> &[Message] {
        let mut fetched = dedupe_by_id(history);
        fetched.sort_by_key(|message| message.created_at);

        let previous = self.conversations.remove(peer_id).unwrap_or_default();
        let mut claimed: Vec<bool> = {
            let known: HashSet<&str> = previous
                .iter()
                .filter_map(|message| message.id.as_server())
                .collect();
            fetched
                .iter()
                .map(|message| message.id.as_server().is_some_and(|id| known.contains(id)))
                .collect()
        };

        let mut retained = Vec::new();
        for message in previous {
            match message.id.as_server() {
                Some(id) => match fetched.iter_mut().find(|f| f.id.as_server() == Some(id)) {
                    Some(authoritative) => {
                        authoritative.advance_to(message.delivery_state);
                    }
                    None => retained.push(message),
                },
                None => {
                    let echo = fetched.iter().enumerate().position(|(index, candidate)| {
                        !claimed[index] && is_echo(&message, candidate, self.reconcile_window)
                    });
                    match echo {
                        Some(index) => {
                            claimed[index] = true;
                            debug!(
                                peer_id,
                                temporary_id = %message.id,
                                id = %fetched[index].id,
                                "optimistic message confirmed by history"
                            );
                        }
                        None => retained.push(message),
                    }
                }
            }
        }

        let retained_count = retained.len();
        for message in retained {
            insert_ordered(&mut fetched, message);
        }

        debug!(
            peer_id,
            messages = fetched.len(),
            retained = retained_count,
            "conversation history loaded"
        );
        self.conversations.insert(peer_id.to_string(), fetched);
        self.conversation(peer_id)
    }

    /// Creates a pending message with a fresh temporary id and appends it to
    /// the conversation with `receiver_id`.
    pub fn append_optimistic(
        &mut self,
        sender_id: &str,
        receiver_id: &str,
        content: &str,
    ) -> Message {
        self.append_optimistic_at(sender_id, receiver_id, content, Utc::now())
    }

    fn append_optimistic_at(
        &mut self,
        sender_id: &str,
        receiver_id: &str,
        content: &str,
        created_at: DateTime<Utc>,
    ) -> Message {
        self.next_temporary += 1;
        let message = Message {
            id: MessageId::Temporary(self.next_temporary),
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            content: content.to_string(),
            created_at,
            is_read: false,
            delivery_state: DeliveryState::Pending,
        };

        trace!(peer_id = receiver_id, id = %message.id, "optimistic message appended");
        let conversation = self.conversations.entry(receiver_id.to_string()).or_default();
        insert_ordered(conversation, message.clone());
        message
    }

    /// Stores an authoritative message in the conversation with `peer_id`.
    pub fn receive_inbound(&mut self, message: Message, peer_id: &str) -> InboundOutcome {
        let window = self.reconcile_window;
        let conversation = self.conversations.entry(peer_id.to_string()).or_default();

        if let Some(server_id) = message.id.as_server() {
            if let Some(existing) = conversation
                .iter_mut()
                .find(|stored| stored.id.as_server() == Some(server_id))
            {
                existing.advance_to(message.delivery_state);
                trace!(peer_id, id = server_id, "duplicate message merged");
                return InboundOutcome::Duplicate;
            }
        }

        if let Some(existing) = conversation
            .iter_mut()
            .find(|stored| is_echo(stored, &message, window))
        {
            let id = message.id.clone();
            let temporary_id = std::mem::replace(&mut existing.id, message.id);
            existing.advance_to(message.delivery_state);
            debug!(peer_id, %temporary_id, %id, "optimistic message reconciled");
            return InboundOutcome::Reconciled { temporary_id, id };
        }

        insert_ordered(conversation, message);
        InboundOutcome::Appended
    }

    /// Marks every copy of `message_id` read. Returns `false` when the id is
    /// unknown or already read.
    pub fn mark_read(&mut self, message_id: &str) -> bool {
        let mut changed = false;
        for message in self.conversations.values_mut().flatten() {
            if message.id.as_server() == Some(message_id) {
                changed |= message.advance_to(DeliveryState::Read);
            }
        }
        changed
    }

    pub fn conversation(&self, peer_id: &str) -> &[Message] {
        self.conversations
            .get(peer_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn find(&self, id: &MessageId) -> Option<&Message> {
        self.conversations
            .values()
            .flatten()
            .find(|message| &message.id == id)
    }

    pub fn clear(&mut self) {
        self.conversations.clear();
    }
}

impl ReadStateSink for MessageStore {
    fn mark_read(&mut self, message_id: &str) -> bool {
        MessageStore::mark_read(self, message_id)
    }
}

/// Whether `authoritative` is the server's copy of the optimistic entry.
fn is_echo(optimistic: &Message, authoritative: &Message, window: TimeDelta) -> bool {
    optimistic.id.is_temporary()
        && !authoritative.id.is_temporary()
        && optimistic.sender_id == authoritative.sender_id
        && optimistic.receiver_id == authoritative.receiver_id
        && optimistic.content == authoritative.content
        && (authoritative.created_at - optimistic.created_at).abs() <= window
}

fn insert_ordered(conversation: &mut Vec<Message>, message: Message) {
    let index = conversation.partition_point(|stored| stored.created_at <= message.created_at);
    conversation.insert(index, message);
}

/// Keeps the first occurrence of each id, folding later copies' delivery
/// state into it.
fn dedupe_by_id(messages: Vec<Message>) -> Vec<Message> {
    let mut positions: HashMap<MessageId, usize> = HashMap::with_capacity(messages.len());
    let mut unique: Vec<Message> = Vec::with_capacity(messages.len());

    for message in messages {
        match positions.get(&message.id) {
            Some(&index) => {
                unique[index].advance_to(message.delivery_state);
            }
            None => {
                positions.insert(message.id.clone(), unique.len());
                unique.push(message);
            }
        }
    }
    unique
}
