//! A scripted in-memory transport for exercising the connection lifecycle.
//!
//! Script state is thread-local, so each `#[tokio::test]` on the default
//! current-thread runtime sees its own script.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::time::Duration;

use crate::error::ConnectionError;
use crate::transport::{ChannelTransport, ConnectionConfig};
use crate::wire::{OutboundEvent, Packet, decode};

#[derive(Default)]
struct Script {
    connect_outcomes: VecDeque<Result<(), ConnectionError>>,
    inbound: VecDeque<Result<String, ConnectionError>>,
    sent: Vec<String>,
    connect_calls: u32,
    close_calls: u32,
    close_delay: Option<Duration>,
    fail_sends: bool,
}

thread_local! {
    static SCRIPT: RefCell<Script> = RefCell::new(Script::default());
}

fn with_script<R>(f: impl FnOnce(&mut Script) -> R) -> R {
    SCRIPT.with(|script| f(&mut script.borrow_mut()))
}

/// Clears all scripted outcomes and recorded calls.
pub fn reset() {
    with_script(|script| *script = Script::default());
}

/// Queues the outcome of the next `connect`. Unscripted connects succeed.
pub fn push_connect_outcome(outcome: Result<(), ConnectionError>) {
    with_script(|script| script.connect_outcomes.push_back(outcome));
}

pub fn push_inbound_frame(frame: impl Into<String>) {
    with_script(|script| script.inbound.push_back(Ok(frame.into())));
}

pub fn push_inbound_event(name: &str, data: serde_json::Value) {
    push_inbound_frame(crate::wire::encode(&Packet::Event {
        name: name.to_string(),
        data,
    }));
}

/// Queues a transport failure, as if the socket dropped.
pub fn push_inbound_error(error: ConnectionError) {
    with_script(|script| script.inbound.push_back(Err(error)));
}

pub fn fail_sends(fail: bool) {
    with_script(|script| script.fail_sends = fail);
}

pub fn connect_calls() -> u32 {
    with_script(|script| script.connect_calls)
}

pub fn close_calls() -> u32 {
    with_script(|script| script.close_calls)
}

pub fn sent_frames() -> Vec<String> {
    with_script(|script| script.sent.clone())
}

/// Makes every later `close` take `delay` to finish.
pub fn delay_close(delay: Duration) {
    with_script(|script| script.close_delay = Some(delay));
}

/// Names of the outbound events sent so far, in order.
pub fn sent_event_names() -> Vec<String> {
    sent_frames()
        .iter()
        .filter_map(|frame| match decode(frame) {
            Ok(Packet::Event { name, .. }) => Some(name),
            _ => None,
        })
        .collect()
}

pub fn count_sent(event: &OutboundEvent) -> usize {
    let encoded = event.encode();
    sent_frames()
        .iter()
        .filter(|frame| **frame == encoded)
        .count()
}

/// Payloads of every `mark_as_read` sent so far.
pub fn sent_read_acks() -> Vec<String> {
    sent_frames()
        .iter()
        .filter_map(|frame| match decode(frame) {
            Ok(Packet::Event { name, data }) if name == "mark_as_read" => {
                data.as_str().map(str::to_string)
            }
            _ => None,
        })
        .collect()
}

pub struct ScriptedTransport;

impl ChannelTransport for ScriptedTransport {
    async fn connect(_config: &ConnectionConfig) -> Result<Self, ConnectionError> {
        with_script(|script| {
            script.connect_calls += 1;
            script.connect_outcomes.pop_front().unwrap_or(Ok(()))
        })?;
        Ok(Self)
    }

    async fn send(&mut self, frame: &str) -> Result<(), ConnectionError> {
        with_script(|script| {
            if script.fail_sends {
                return Err(ConnectionError::Transport("scripted send failure".into()));
            }
            script.sent.push(frame.to_string());
            Ok(())
        })
    }

    async fn recv(&mut self) -> Result<String, ConnectionError> {
        match with_script(|script| script.inbound.pop_front()) {
            Some(frame) => frame,
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        let delay = with_script(|script| {
            script.close_calls += 1;
            script.close_delay
        });
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}
