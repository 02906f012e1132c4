use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use parley_api::{ApiError, ChatApi};
use parley_core::config::Config;
use parley_core::event::{EventBus, EventPayload, EventSource, publish_or_log};
use parley_core::session::SessionStore;
use parley_core::{Message, PresenceEntry, Session, UnreadSnapshot};
use parley_messaging::{InboundOutcome, MessageStore};
use parley_presence::PresenceTracker;
use parley_receipts::ReadReceiptCoordinator;
use parley_transport::{
    ChannelTransport, ConnectionConfig, ConnectionEvent, ConnectionManager, ConnectionState,
    Identity, InboundEvent, OutboundEvent, WebSocketTransport,
};
use parley_unread::UnreadCounter;

use crate::error::SyncError;

/// User actions fed to [`SyncEngine::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect,
    Reconnect,
    SelectPeer(String),
    SendMessage(String),
    Logout,
}

/// A consistent view of everything the UI renders.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSnapshot {
    pub user: Option<PresenceEntry>,
    pub active_peer: Option<String>,
    pub connection: ConnectionState,
    pub online: Vec<PresenceEntry>,
    pub conversation: Vec<Message>,
    pub unread: UnreadSnapshot,
}

enum Completion {
    History {
        ticket: u64,
        peer_id: String,
        result: Result<Vec<Message>, ApiError>,
    },
    UnreadCounts {
        generation: u64,
        result: Result<UnreadSnapshot, ApiError>,
    },
}

/// Owns the session and active peer, and routes user actions, channel
/// events and fetch completions to the components on a single task.
pub struct SyncEngine<A, T = WebSocketTransport>
where
    A: ChatApi,
    T: ChannelTransport,
{
    session: Option<Session>,
    active_peer: Option<String>,
    connection: ConnectionManager<T>,
    presence: PresenceTracker,
    messages: MessageStore,
    unread: UnreadCounter,
    receipts: ReadReceiptCoordinator,
    api: Arc<A>,
    session_store: Option<Arc<dyn SessionStore>>,
    event_bus: Arc<dyn EventBus>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    history_ticket: u64,
    in_flight: usize,
}

impl<A, T> SyncEngine<A, T>
where
    A: ChatApi,
    T: ChannelTransport,
{
    pub fn new(session: Session, config: &Config, api: A, event_bus: Arc<dyn EventBus>) -> Self {
        let connection = ConnectionManager::with_event_bus(
            ConnectionConfig::from_settings(config.server.url.clone(), &config.connection),
            Arc::clone(&event_bus),
        );
        let reconcile_window = Duration::from_secs(config.sync.reconcile_window_seconds);
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();

        Self {
            presence: PresenceTracker::new(session.user_id.clone()),
            receipts: ReadReceiptCoordinator::new(session.user_id.clone()),
            session: Some(session),
            active_peer: None,
            connection,
            messages: MessageStore::new(reconcile_window),
            unread: UnreadCounter::new(),
            api: Arc::new(api),
            session_store: None,
            event_bus,
            completions_tx,
            completions_rx,
            history_ticket: 0,
            in_flight: 0,
        }
    }

    /// Clears `store` on logout.
    pub fn with_session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.session_store = Some(store);
        self
    }

    // ── User operations ────────────────────────────────────────────

    pub async fn connect(&mut self) -> Result<(), SyncError> {
        let identity = Identity::from(self.require_session()?);
        self.connection.connect(identity).await?;
        self.on_connected();
        Ok(())
    }

    /// Drops the current channel, if any, and connects again.
    pub async fn reconnect(&mut self) -> Result<(), SyncError> {
        let identity = Identity::from(self.require_session()?);
        if self.connection.identity().is_some() {
            self.connection.reconnect().await?;
        } else {
            self.connection.connect(identity).await?;
        }
        self.on_connected();
        Ok(())
    }

    /// Opens the conversation with `peer_id`. Its unread count is zero when
    /// this returns; the history arrives later through the event loop.
    pub async fn select_peer(&mut self, peer_id: &str) -> Result<(), SyncError> {
        self.require_session()?;
        info!(peer_id, "peer selected");

        self.active_peer = Some(peer_id.to_string());
        self.unread.on_activate(peer_id);
        self.publish(
            "ui.peer.selected",
            EventPayload::PeerSelected {
                peer_id: peer_id.to_string(),
            },
        );
        self.publish_unread(peer_id);

        let visible = self
            .receipts
            .acks_for_history(peer_id, self.messages.conversation(peer_id));
        self.emit_acks(visible).await;

        self.spawn_history_fetch(peer_id);
        Ok(())
    }

    /// Appends an optimistic message to the open conversation and sends it.
    /// A failed send leaves the message pending and is reported on the bus.
    pub async fn send_message(&mut self, content: &str) -> Result<Message, SyncError> {
        let sender_id = self.require_session()?.user_id.clone();
        if content.trim().is_empty() {
            return Err(SyncError::EmptyMessage);
        }
        let peer_id = self.active_peer.clone().ok_or(SyncError::NoActivePeer)?;

        let message = self.messages.append_optimistic(&sender_id, &peer_id, content);
        self.publish(
            "sync.message.appended",
            EventPayload::MessageAppended {
                peer_id: peer_id.clone(),
                message: message.clone(),
            },
        );

        let outbound = OutboundEvent::PrivateMessage {
            sender_id,
            receiver_id: peer_id.clone(),
            content: content.to_string(),
        };
        if let Err(error) = self.connection.emit(&outbound).await {
            warn!(peer_id = %peer_id, id = %message.id, %error, "message left pending");
            self.publish_error("sync", error.to_string(), true);
        }
        Ok(message)
    }

    /// Disconnects and forgets the session. Safe without a session.
    pub async fn logout(&mut self) -> Result<(), SyncError> {
        self.connection.disconnect().await;

        let had_session = self.session.take().is_some();
        self.active_peer = None;
        self.presence.clear();
        self.messages.clear();
        self.unread.clear();
        self.receipts.reset();
        self.history_ticket += 1;

        if had_session {
            info!("logged out");
            self.publish("system.session.ended", EventPayload::SessionEnded);
        }

        if let Some(store) = &self.session_store {
            store.clear()?;
        }
        Ok(())
    }

    // ── Event loop ─────────────────────────────────────────────────

    /// Runs until `Logout` or until the command channel closes.
    pub async fn run(&mut self, mut commands: mpsc::UnboundedReceiver<Command>) -> Result<(), SyncError> {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Logout) => return self.logout().await,
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("command channel closed, sync engine stopping");
                        return Ok(());
                    }
                },
                event = self.connection.next_event() => {
                    self.handle_connection_event(event).await;
                }
                Some(completion) = self.completions_rx.recv() => {
                    self.handle_completion(completion).await;
                }
            }
        }
    }

    /// Waits for the next channel event and applies it.
    pub async fn process_next_event(&mut self) {
        let event = self.connection.next_event().await;
        self.handle_connection_event(event).await;
    }

    /// Waits for every outstanding fetch and applies its result.
    pub async fn settle(&mut self) {
        while self.in_flight > 0 {
            match self.completions_rx.recv().await {
                Some(completion) => self.handle_completion(completion).await,
                None => break,
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        let result = match command {
            Command::Connect => self.connect().await,
            Command::Reconnect => self.reconnect().await,
            Command::SelectPeer(peer_id) => self.select_peer(&peer_id).await,
            Command::SendMessage(content) => self.send_message(&content).await.map(|_| ()),
            Command::Logout => self.logout().await,
        };
        if let Err(error) = result {
            warn!(%error, "command failed");
            self.publish_error("sync", error.to_string(), !error.requires_login());
        }
    }

    async fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Inbound(event) => self.handle_inbound(event).await,
            ConnectionEvent::Lost { reason } => self.on_connection_lost(&reason),
            ConnectionEvent::Reconnected { generation } => {
                info!(generation, "channel restored");
                self.on_connected();
            }
            ConnectionEvent::GaveUp { reason } => {
                warn!(reason = %reason, "reconnection abandoned, use reconnect to try again");
            }
        }
    }

    async fn handle_inbound(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::UsersOnline(entries) => {
                self.presence.replace(entries);
                self.publish_presence();
            }
            InboundEvent::NewMessage { message, sender } => {
                self.on_new_message(Message::from(message), sender).await;
            }
            InboundEvent::MessageRead { message_id } => {
                if self
                    .receipts
                    .on_read_confirmation(&message_id, &mut self.messages)
                {
                    self.publish("sync.message.read", EventPayload::MessageRead { message_id });
                }
            }
            InboundEvent::ConnectError { reason } => {
                debug!(reason = %reason, "connect_error surfaced as inbound event");
            }
        }
    }

    async fn on_new_message(&mut self, message: Message, sender: String) {
        let Some(self_id) = self.session.as_ref().map(|session| session.user_id.clone()) else {
            return;
        };
        let from_peer = sender != self_id;
        let peer_id = if from_peer {
            sender
        } else {
            message.receiver_id.clone()
        };

        let stored = message.clone();
        match self.messages.receive_inbound(message, &peer_id) {
            InboundOutcome::Appended => {
                self.publish(
                    "sync.message.appended",
                    EventPayload::MessageAppended {
                        peer_id: peer_id.clone(),
                        message: stored.clone(),
                    },
                );
            }
            InboundOutcome::Reconciled { temporary_id, id } => {
                self.publish(
                    "sync.message.reconciled",
                    EventPayload::MessageReconciled {
                        peer_id,
                        temporary_id,
                        id,
                    },
                );
                return;
            }
            InboundOutcome::Duplicate => return,
        }

        if !from_peer {
            return;
        }

        let active_peer = self.active_peer.clone();
        match self.receipts.ack_for_inbound(&stored, active_peer.as_deref()) {
            Some(id) => self.emit_acks(vec![id]).await,
            None => {
                if self.unread.on_inbound_message(&peer_id, active_peer.as_deref()) > 0 {
                    self.publish_unread(&peer_id);
                }
            }
        }
    }

    async fn handle_completion(&mut self, completion: Completion) {
        self.in_flight = self.in_flight.saturating_sub(1);
        if self.session.is_none() {
            debug!("discarding fetch result after logout");
            return;
        }

        match completion {
            Completion::History {
                ticket,
                peer_id,
                result,
            } => {
                let current = ticket == self.history_ticket
                    && self.active_peer.as_deref() == Some(peer_id.as_str());
                if !current {
                    debug!(peer_id = %peer_id, ticket, "discarding stale history");
                    return;
                }

                match result {
                    Ok(history) => {
                        let loaded = self.messages.load_history(&peer_id, history);
                        let count = loaded.len();
                        let acks = self.receipts.acks_for_history(&peer_id, loaded);
                        self.unread.on_activate(&peer_id);
                        self.publish(
                            "sync.conversation.loaded",
                            EventPayload::ConversationLoaded {
                                peer_id: peer_id.clone(),
                                messages: count,
                            },
                        );
                        self.emit_acks(acks).await;
                    }
                    Err(error) => {
                        warn!(peer_id = %peer_id, %error, "history fetch failed");
                        self.publish_error("api", error.to_string(), true);
                    }
                }
            }
            Completion::UnreadCounts { generation, result } => {
                if generation != self.connection.generation() {
                    debug!(generation, "discarding unread counts from earlier connection");
                    return;
                }

                match result {
                    Ok(counts) => {
                        self.unread.bulk_load(counts, self.active_peer.as_deref());
                        self.publish(
                            "sync.unread.loaded",
                            EventPayload::UnreadLoaded {
                                counts: self.unread.snapshot(),
                            },
                        );
                    }
                    Err(error) => {
                        warn!(%error, "unread count fetch failed");
                        self.publish_error("api", error.to_string(), true);
                    }
                }
            }
        }
    }

    // ── Connection lifecycle ───────────────────────────────────────

    fn on_connected(&mut self) {
        self.receipts.reset();
        self.spawn_unread_fetch();
        if let Some(peer_id) = self.active_peer.clone() {
            self.spawn_history_fetch(&peer_id);
        }
    }

    fn on_connection_lost(&mut self, reason: &str) {
        info!(reason, "connection lost, clearing presence");
        self.presence.clear();
        self.receipts.reset();
        self.publish_presence();
    }

    fn spawn_history_fetch(&mut self, peer_id: &str) {
        let Some(session) = self.session.clone() else {
            return;
        };
        self.history_ticket += 1;
        self.in_flight += 1;

        let ticket = self.history_ticket;
        let peer_id = peer_id.to_string();
        let api = Arc::clone(&self.api);
        let completions = self.completions_tx.clone();
        debug!(peer_id = %peer_id, ticket, "fetching history");

        tokio::spawn(async move {
            let result = api.fetch_history(&session, &peer_id).await;
            let _ = completions.send(Completion::History {
                ticket,
                peer_id,
                result,
            });
        });
    }

    fn spawn_unread_fetch(&mut self) {
        let Some(session) = self.session.clone() else {
            return;
        };
        self.in_flight += 1;

        let generation = self.connection.generation();
        let api = Arc::clone(&self.api);
        let completions = self.completions_tx.clone();

        tokio::spawn(async move {
            let result = api.fetch_unread_counts(&session).await;
            let _ = completions.send(Completion::UnreadCounts { generation, result });
        });
    }

    async fn emit_acks(&mut self, message_ids: Vec<String>) {
        for message_id in message_ids {
            let ack = OutboundEvent::MarkAsRead {
                message_id: message_id.clone(),
            };
            if let Err(error) = self.connection.emit(&ack).await {
                debug!(message_id = %message_id, %error, "read ack not sent");
            }
        }
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn snapshot(&self) -> SyncSnapshot {
        SyncSnapshot {
            user: self
                .session
                .as_ref()
                .map(|session| PresenceEntry::new(&session.user_id, &session.user_name)),
            active_peer: self.active_peer.clone(),
            connection: self.connection.state(),
            online: self.presence.list_online().to_vec(),
            conversation: self
                .active_peer
                .as_deref()
                .map(|peer_id| self.messages.conversation(peer_id).to_vec())
                .unwrap_or_default(),
            unread: self.unread.snapshot(),
        }
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn active_peer(&self) -> Option<&str> {
        self.active_peer.as_deref()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn messages(&self) -> &MessageStore {
        &self.messages
    }

    pub fn unread(&self) -> &UnreadCounter {
        &self.unread
    }

    fn require_session(&self) -> Result<&Session, SyncError> {
        self.session.as_ref().ok_or(SyncError::NotAuthenticated)
    }

    // ── Event bus ──────────────────────────────────────────────────

    fn publish(&self, channel_name: &str, payload: EventPayload) {
        publish_or_log(
            self.event_bus.as_ref(),
            channel_name,
            EventSource::System("sync".into()),
            payload,
        );
    }

    fn publish_presence(&self) {
        self.publish(
            "sync.presence.updated",
            EventPayload::PresenceUpdated {
                online: self.presence.list_online().to_vec(),
            },
        );
    }

    fn publish_unread(&self, peer_id: &str) {
        self.publish(
            "sync.unread.changed",
            EventPayload::UnreadChanged {
                peer_id: peer_id.to_string(),
                count: self.unread.count(peer_id),
            },
        );
    }

    fn publish_error(&self, component: &str, message: String, recoverable: bool) {
        self.publish(
            "system.error.occurred",
            EventPayload::ErrorOccurred {
                component: component.to_string(),
                message,
                recoverable,
            },
        );
    }
}
