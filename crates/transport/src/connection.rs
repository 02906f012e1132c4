use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use parley_core::Session;
use parley_core::event::{EventBus, EventPayload, EventSource, publish_or_log};

use crate::{
    error::ConnectionError,
    transport::{ChannelTransport, ConnectionConfig, WebSocketTransport},
    wire::{self, InboundEvent, OutboundEvent, Packet},
};

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// `attempt` is the number of failed attempts so far.
    Reconnecting { attempt: u32 },
}

/// Who we announce ourselves as in the `user_connected` handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub user_name: String,
}

impl From<&Session> for Identity {
    fn from(session: &Session) -> Self {
        Self {
            user_id: session.user_id.clone(),
            user_name: session.user_name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Inbound(InboundEvent),
    /// The channel dropped; a reconnection attempt is scheduled.
    Lost { reason: String },
    /// A scheduled reconnection completed its handshake.
    Reconnected { generation: u64 },
    /// Scheduled reconnection stopped; the manager is `Disconnected`.
    GaveUp { reason: String },
}

pub struct ConnectionManager<T = WebSocketTransport>
where
    T: ChannelTransport,
{
    state: ConnectionState,
    config: ConnectionConfig,
    transport: Option<T>,
    /// A dropped transport still waiting to be closed.
    retired: Option<T>,
    identity: Option<Identity>,
    generation: u64,
    failed_attempts: u32,
    retry_at: Option<Instant>,
    event_bus: Option<Arc<dyn EventBus>>,
}

impl<T> ConnectionManager<T>
where
    T: ChannelTransport,
{
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            config,
            transport: None,
            retired: None,
            identity: None,
            generation: 0,
            failed_attempts: 0,
            retry_at: None,
            event_bus: None,
        }
    }

    pub fn with_event_bus(config: ConnectionConfig, event_bus: Arc<dyn EventBus>) -> Self {
        Self {
            event_bus: Some(event_bus),
            ..Self::new(config)
        }
    }

    /// Opens the channel and announces `identity`, retrying transport
    /// failures with a fixed delay up to the configured attempt bound.
    pub async fn connect(&mut self, identity: Identity) -> Result<(), ConnectionError> {
        if matches!(self.state, ConnectionState::Connected) && self.identity.as_ref() == Some(&identity) {
            return Ok(());
        }

        self.release_transport().await;
        self.identity = Some(identity.clone());
        self.retry_at = None;

        let mut attempt = 0_u32;
        loop {
            attempt += 1;
            self.state = ConnectionState::Connecting;
            debug!(attempt, max_attempts = self.max_attempts(), "connecting channel");

            let error = match self.attempt(&identity).await {
                Ok(()) => return Ok(()),
                Err(error) => error,
            };
            if let Some(error) = self.attempt_failed(attempt, error) {
                return Err(error);
            }
            tokio::time::sleep(self.config.retry_delay).await;
        }
    }

    /// Reconnects with the identity of the last `connect`.
    pub async fn reconnect(&mut self) -> Result<(), ConnectionError> {
        let identity = self.identity.clone().ok_or(ConnectionError::NotConnected)?;
        self.release_transport().await;
        self.state = ConnectionState::Reconnecting { attempt: 0 };
        self.connect(identity).await
    }

    /// Always succeeds; safe to call in any state.
    pub async fn disconnect(&mut self) {
        self.release_transport().await;
        self.identity = None;
        self.retry_at = None;
        self.failed_attempts = 0;

        if !matches!(self.state, ConnectionState::Disconnected) {
            info!("channel disconnected");
            self.emit_connection_lost("user requested disconnect".to_string(), false);
        }
        self.state = ConnectionState::Disconnected;
    }

    pub async fn emit(&mut self, event: &OutboundEvent) -> Result<(), ConnectionError> {
        let transport = match (&self.state, self.transport.as_mut()) {
            (ConnectionState::Connected, Some(transport)) => transport,
            _ => return Err(ConnectionError::NotConnected),
        };
        debug!(event = event.name(), "emitting channel event");
        transport.send(&event.encode()).await
    }

    /// Waits for the next connection event. Heartbeats are answered here and
    /// malformed or unknown frames are dropped. After a loss this also drives
    /// the scheduled reconnection attempts. Never resolves while there is
    /// neither a live transport nor a scheduled attempt.
    ///
    /// Cancel safe: dropping this future from a `select!` never loses a
    /// reported loss or a scheduled attempt.
    pub async fn next_event(&mut self) -> ConnectionEvent {
        loop {
            if self.transport.is_none() {
                match self.resume().await {
                    Some(event) => return event,
                    None => continue,
                }
            }
            let Some(transport) = self.transport.as_mut() else {
                continue;
            };

            let received = match transport.liveness_timeout() {
                Some(limit) => match tokio::time::timeout(limit, transport.recv()).await {
                    Ok(result) => result,
                    Err(_) => Err(ConnectionError::Timeout),
                },
                None => transport.recv().await,
            };
            let frame = match received {
                Ok(frame) => frame,
                Err(error) => return self.mark_lost(error.to_string()),
            };

            match wire::decode(&frame) {
                Ok(Packet::Ping) => {
                    if let Err(error) = transport.send(&wire::encode(&Packet::Pong)).await {
                        return self.mark_lost(error.to_string());
                    }
                }
                Ok(Packet::Event { name, data }) => match InboundEvent::from_event(&name, data) {
                    Ok(InboundEvent::ConnectError { reason }) => {
                        return self.mark_lost(reason);
                    }
                    Ok(event) => return ConnectionEvent::Inbound(event),
                    Err(error) => debug!(event = %name, %error, "dropping inbound event"),
                },
                Ok(Packet::ConnectError(data)) => {
                    return self.mark_lost(wire::describe_error(&data));
                }
                Ok(Packet::Close) | Ok(Packet::Disconnect) => {
                    return self.mark_lost("server closed the channel".to_string());
                }
                Ok(Packet::Open(_) | Packet::Connect(_) | Packet::Pong | Packet::Noop) => {}
                Err(error) => debug!(%error, "dropping malformed frame"),
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.clone()
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, ConnectionState::Connected) && self.transport.is_some()
    }

    /// Incremented on every successful connection.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    async fn attempt(&mut self, identity: &Identity) -> Result<(), ConnectionError> {
        let transport = T::connect(&self.config).await?;
        self.complete_handshake(transport, identity).await
    }

    /// Records a failed attempt and schedules the next one. Returns the error
    /// to surface once no attempt remains.
    fn attempt_failed(&mut self, attempt: u32, error: ConnectionError) -> Option<ConnectionError> {
        let will_retry = error.is_retryable() && attempt < self.max_attempts();
        warn!(attempt, error = %error, will_retry, "channel connection attempt failed");
        self.emit_connection_lost(error.to_string(), will_retry);
        self.failed_attempts = attempt;

        if will_retry {
            self.state = ConnectionState::Reconnecting { attempt };
            self.retry_at = Some(Instant::now() + self.config.retry_delay);
            self.emit_connection_reconnecting(attempt);
            return None;
        }

        self.state = ConnectionState::Disconnected;
        self.retry_at = None;
        let error = if error.is_retryable() {
            ConnectionError::RetriesExhausted {
                attempts: attempt,
                last_error: error.to_string(),
            }
        } else {
            error
        };
        self.emit_connection_error(&error);
        Some(error)
    }

    /// Runs the scheduled reconnection attempt once it is due. `None` means
    /// the attempt failed and another one is scheduled.
    async fn resume(&mut self) -> Option<ConnectionEvent> {
        let (Some(due), Some(identity)) = (self.retry_at, self.identity.clone()) else {
            return std::future::pending().await;
        };
        tokio::time::sleep_until(due).await;
        self.release_transport().await;

        let attempt = self.failed_attempts + 1;
        self.state = ConnectionState::Connecting;
        debug!(attempt, max_attempts = self.max_attempts(), "reconnecting channel");

        match self.attempt(&identity).await {
            Ok(()) => Some(ConnectionEvent::Reconnected {
                generation: self.generation,
            }),
            Err(error) => self
                .attempt_failed(attempt, error)
                .map(|error| ConnectionEvent::GaveUp {
                    reason: error.to_string(),
                }),
        }
    }

    async fn complete_handshake(
        &mut self,
        mut transport: T,
        identity: &Identity,
    ) -> Result<(), ConnectionError> {
        let handshake = OutboundEvent::UserConnected {
            user_id: identity.user_id.clone(),
            user_name: identity.user_name.clone(),
        };
        if let Err(error) = transport.send(&handshake.encode()).await {
            let _ = transport.close().await;
            return Err(error);
        }

        self.transport = Some(transport);
        self.state = ConnectionState::Connected;
        self.generation += 1;
        self.failed_attempts = 0;
        self.retry_at = None;
        info!(
            user_id = %identity.user_id,
            generation = self.generation,
            "channel connected"
        );
        self.emit_connection_established(&identity.user_id);
        Ok(())
    }

    /// The dead transport is parked and closed by the next attempt or
    /// `disconnect`.
    fn mark_lost(&mut self, reason: String) -> ConnectionEvent {
        warn!(reason = %reason, "channel lost");
        if let Some(transport) = self.transport.take() {
            self.retired = Some(transport);
        }
        self.state = ConnectionState::Reconnecting { attempt: 0 };
        self.failed_attempts = 0;
        self.retry_at = Some(Instant::now());
        self.emit_connection_lost(reason.clone(), true);
        ConnectionEvent::Lost { reason }
    }

    async fn release_transport(&mut self) {
        for mut transport in [self.retired.take(), self.transport.take()]
            .into_iter()
            .flatten()
        {
            if let Err(error) = transport.close().await {
                debug!(%error, "error while closing channel transport");
            }
        }
    }

    fn emit_connection_established(&self, user_id: &str) {
        self.emit_event(
            "system.connection.established",
            EventPayload::ConnectionEstablished {
                user_id: user_id.to_string(),
                generation: self.generation,
            },
        );
    }

    fn emit_connection_lost(&self, reason: String, will_retry: bool) {
        self.emit_event(
            "system.connection.lost",
            EventPayload::ConnectionLost { reason, will_retry },
        );
    }

    fn emit_connection_reconnecting(&self, attempt: u32) {
        self.emit_event(
            "system.connection.reconnecting",
            EventPayload::ConnectionReconnecting { attempt },
        );
    }

    fn emit_connection_error(&self, error: &ConnectionError) {
        self.emit_event(
            "system.error.occurred",
            EventPayload::ErrorOccurred {
                component: "connection".to_string(),
                message: error.to_string(),
                recoverable: error.is_retryable(),
            },
        );
    }

    fn emit_event(&self, channel_name: &str, payload: EventPayload) {
        let Some(event_bus) = &self.event_bus else {
            return;
        };
        publish_or_log(event_bus.as_ref(), channel_name, EventSource::Connection, payload);
    }
}
