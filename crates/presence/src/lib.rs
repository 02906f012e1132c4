use std::collections::HashSet;

use tracing::debug;

use parley_core::PresenceEntry;

/// The set of online peers, rebuilt wholesale from every `users_online`
/// snapshot. Never contains the local user.
#[derive(Debug, Clone)]
pub struct PresenceTracker {
    self_id: String,
    online: Vec<PresenceEntry>,
}

impl PresenceTracker {
    pub fn new(self_id: impl Into<String>) -> Self {
        Self {
            self_id: self_id.into(),
            online: Vec::new(),
        }
    }

    /// Replaces the online set with `snapshot`, preserving its order.
    /// Entries for the local user are skipped and repeated user ids keep
    /// their first occurrence.
    pub fn replace(&mut self, snapshot: Vec<PresenceEntry>) {
        let mut seen = HashSet::with_capacity(snapshot.len());
        let received = snapshot.len();

        self.online = snapshot
            .into_iter()
            .filter(|entry| entry.user_id != self.self_id)
            .filter(|entry| seen.insert(entry.user_id.clone()))
            .collect();

        debug!(received, online = self.online.len(), "presence snapshot applied");
    }

    pub fn list_online(&self) -> &[PresenceEntry] {
        &self.online
    }

    /// Online peers whose display name contains `query`, ignoring case.
    pub fn filter(&self, query: &str) -> Vec<PresenceEntry> {
        let query = query.trim().to_lowercase();
        self.online
            .iter()
            .filter(|entry| query.is_empty() || entry.user_name.to_lowercase().contains(&query))
            .cloned()
            .collect()
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.online.iter().any(|entry| entry.user_id == user_id)
    }

    pub fn clear(&mut self) {
        if !self.online.is_empty() {
            debug!(dropped = self.online.len(), "presence cleared");
        }
        self.online.clear();
    }
}
