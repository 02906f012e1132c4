use tracing::{debug, trace};

use parley_core::UnreadSnapshot;

/// Unread counts per peer. The active peer always reads as zero.
#[derive(Debug, Default, Clone)]
pub struct UnreadCounter {
    counts: UnreadSnapshot,
}

impl UnreadCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one message from `sender_id` unless it is the open
    /// conversation. Returns the sender's count afterwards.
    pub fn on_inbound_message(&mut self, sender_id: &str, active_peer: Option<&str>) -> u32 {
        if active_peer == Some(sender_id) {
            return 0;
        }
        let count = self.counts.entry(sender_id.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        trace!(peer_id = sender_id, count = *count, "unread incremented");
        *count
    }

    pub fn on_activate(&mut self, peer_id: &str) {
        if self.counts.remove(peer_id).is_some() {
            trace!(peer_id, "unread reset");
        }
    }

    /// Replaces every count with the server's snapshot.
    pub fn bulk_load<I>(&mut self, counts: I, active_peer: Option<&str>)
    where
        I: IntoIterator<Item = (String, u32)>,
    {
        self.counts = counts.into_iter().filter(|(_, count)| *count > 0).collect();
        if let Some(peer_id) = active_peer {
            self.counts.remove(peer_id);
        }
        debug!(peers = self.counts.len(), total = self.total(), "unread counts loaded");
    }

    pub fn count(&self, peer_id: &str) -> u32 {
        self.counts.get(peer_id).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u32 {
        self.counts.values().fold(0, |sum, count| sum.saturating_add(*count))
    }

    /// Peers with at least one unread message.
    pub fn snapshot(&self) -> UnreadSnapshot {
        self.counts.clone()
    }

    pub fn clear(&mut self) {
        self.counts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(pairs: &[(&str, u32)]) -> Vec<(String, u32)> {
        pairs
            .iter()
            .map(|(peer, count)| (peer.to_string(), *count))
            .collect()
    }

    #[test]
    fn counts_messages_since_last_activation() {
        let mut unread = UnreadCounter::new();
        unread.on_inbound_message("c", Some("b"));
        unread.on_inbound_message("c", Some("b"));
        assert_eq!(unread.count("c"), 2);

        unread.on_activate("c");
        assert_eq!(unread.count("c"), 0);

        assert_eq!(unread.on_inbound_message("c", Some("b")), 1);
    }

    #[test]
    fn active_peer_is_never_counted() {
        let mut unread = UnreadCounter::new();
        assert_eq!(unread.on_inbound_message("b", Some("b")), 0);
        assert_eq!(unread.count("b"), 0);
        assert!(unread.snapshot().is_empty());
    }

    #[test]
    fn no_active_peer_counts_everything() {
        let mut unread = UnreadCounter::new();
        unread.on_inbound_message("b", None);
        unread.on_inbound_message("c", None);
        assert_eq!(unread.total(), 2);
    }

    #[test]
    fn bulk_load_replaces_the_whole_map() {
        let mut unread = UnreadCounter::new();
        unread.on_inbound_message("stale", None);

        unread.bulk_load(counts(&[("b", 3), ("c", 1), ("d", 0)]), None);

        assert_eq!(unread.count("stale"), 0);
        assert_eq!(unread.count("b"), 3);
        assert_eq!(unread.total(), 4);
        assert_eq!(
            unread.snapshot().into_iter().collect::<Vec<_>>(),
            counts(&[("b", 3), ("c", 1)])
        );
    }

    #[test]
    fn bulk_load_keeps_active_peer_at_zero() {
        let mut unread = UnreadCounter::new();
        unread.bulk_load(counts(&[("b", 3), ("c", 1)]), Some("b"));

        assert_eq!(unread.count("b"), 0);
        assert_eq!(unread.count("c"), 1);
    }

    #[test]
    fn clear_resets_counts() {
        let mut unread = UnreadCounter::new();
        unread.on_inbound_message("b", None);
        unread.clear();
        assert_eq!(unread.total(), 0);
    }
}
