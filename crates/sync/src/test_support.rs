//! An in-memory `ChatApi` with scriptable responses and latency.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use parley_api::{ApiError, ChatApi};
use parley_core::{Message, Session, UnreadSnapshot};

#[derive(Default)]
struct FakeState {
    history: HashMap<String, Vec<Message>>,
    history_delay: HashMap<String, Duration>,
    failing_history: HashSet<String>,
    unread: UnreadSnapshot,
    unread_fails: bool,
    history_calls: Vec<String>,
    unread_calls: u32,
}

#[derive(Clone, Default)]
pub struct FakeChatApi {
    state: Arc<Mutex<FakeState>>,
}

impl FakeChatApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake api state poisoned")
    }

    pub fn set_history(&self, peer_id: &str, messages: Vec<Message>) {
        self.state().history.insert(peer_id.to_string(), messages);
    }

    /// Makes history fetches for `peer_id` take `delay` to complete.
    pub fn delay_history(&self, peer_id: &str, delay: Duration) {
        self.state().history_delay.insert(peer_id.to_string(), delay);
    }

    pub fn fail_history(&self, peer_id: &str) {
        self.state().failing_history.insert(peer_id.to_string());
    }

    pub fn set_unread(&self, counts: &[(&str, u32)]) {
        self.state().unread = counts
            .iter()
            .map(|(peer_id, count)| (peer_id.to_string(), *count))
            .collect();
    }

    pub fn fail_unread(&self, fail: bool) {
        self.state().unread_fails = fail;
    }

    /// Peers whose history was requested, in order.
    pub fn history_calls(&self) -> Vec<String> {
        self.state().history_calls.clone()
    }

    pub fn unread_calls(&self) -> u32 {
        self.state().unread_calls
    }
}

impl ChatApi for FakeChatApi {
    async fn fetch_history(
        &self,
        _session: &Session,
        peer_id: &str,
    ) -> Result<Vec<Message>, ApiError> {
        let (delay, outcome) = {
            let mut state = self.state();
            state.history_calls.push(peer_id.to_string());
            let outcome = if state.failing_history.contains(peer_id) {
                Err(ApiError::Status {
                    endpoint: format!("/api/messages/{peer_id}"),
                    status: 500,
                })
            } else {
                Ok(state.history.get(peer_id).cloned().unwrap_or_default())
            };
            (state.history_delay.get(peer_id).copied(), outcome)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        outcome
    }

    async fn fetch_unread_counts(&self, _session: &Session) -> Result<UnreadSnapshot, ApiError> {
        let mut state = self.state();
        state.unread_calls += 1;
        if state.unread_fails {
            return Err(ApiError::Status {
                endpoint: "/api/unread-count".to_string(),
                status: 503,
            });
        }
        Ok(state.unread.clone())
    }
}
