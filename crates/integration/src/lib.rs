//! End-to-end scenarios that drive the sync engine against a local
//! Socket.IO channel server and a mocked REST API.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use futures::{SinkExt, StreamExt};
    use serde_json::{Value, json};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::{WebSocketStream, accept_async};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use parley_api::{ChatApi, HttpChatApi};
    use parley_core::config::Config;
    use parley_core::event::{BroadcastEventBus, EventBus, EventPayload};
    use parley_core::session::{FileSessionStore, SessionStore};
    use parley_core::{DeliveryState, MessageId, PresenceEntry, Session};
    use parley_sync::SyncEngine;
    use parley_transport::ConnectionState;
    use parley_transport::wire::{self, Packet};

    const TIMEOUT: Duration = Duration::from_secs(5);

    // ── Channel server ─────────────────────────────────────────────

    enum ToClient {
        Frame(String),
        Close,
    }

    /// One accepted client socket, seen from the server side.
    struct ServerConnection {
        from_client: mpsc::UnboundedReceiver<String>,
        to_client: mpsc::UnboundedSender<ToClient>,
    }

    impl ServerConnection {
        async fn next_frame(&mut self) -> String {
            timeout(TIMEOUT, self.from_client.recv())
                .await
                .expect("timed out waiting for a client frame")
                .expect("client socket closed")
        }

        /// Next Socket.IO event from the client, skipping control packets.
        async fn next_event(&mut self) -> (String, Value) {
            loop {
                let frame = self.next_frame().await;
                if let Ok(Packet::Event { name, data }) = wire::decode(&frame) {
                    return (name, data);
                }
            }
        }

        fn emit(&self, name: &str, data: Value) {
            let frame = wire::encode(&Packet::Event {
                name: name.to_string(),
                data,
            });
            self.to_client
                .send(ToClient::Frame(frame))
                .expect("server connection gone");
        }

        fn drop_connection(&self) {
            self.to_client
                .send(ToClient::Close)
                .expect("server connection gone");
        }
    }

    struct ChannelServer {
        url: String,
        connections: mpsc::UnboundedReceiver<ServerConnection>,
    }

    impl ChannelServer {
        async fn start() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let url = format!("http://{}", listener.local_addr().unwrap());
            let (connections_tx, connections) = mpsc::unbounded_channel();

            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let Ok(socket) = accept_async(stream).await else {
                        continue;
                    };
                    let (from_tx, from_client) = mpsc::unbounded_channel();
                    let (to_client, to_rx) = mpsc::unbounded_channel();
                    if connections_tx
                        .send(ServerConnection {
                            from_client,
                            to_client,
                        })
                        .is_err()
                    {
                        break;
                    }
                    tokio::spawn(serve(socket, from_tx, to_rx));
                }
            });

            Self { url, connections }
        }

        async fn accept(&mut self) -> ServerConnection {
            timeout(TIMEOUT, self.connections.recv())
                .await
                .expect("timed out waiting for a client")
                .expect("listener stopped")
        }
    }

    /// Speaks just enough Engine.IO to open a session and accept the
    /// default namespace, then relays frames both ways.
    async fn serve(
        mut socket: WebSocketStream<TcpStream>,
        from_client: mpsc::UnboundedSender<String>,
        mut to_client: mpsc::UnboundedReceiver<ToClient>,
    ) {
        let open = json!({
            "sid": "engine-1",
            "upgrades": [],
            "pingInterval": 25000,
            "pingTimeout": 20000,
        });
        if socket.send(WsMessage::text(format!("0{open}"))).await.is_err() {
            return;
        }

        loop {
            tokio::select! {
                incoming = socket.next() => match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        let text = text.as_str().to_owned();
                        if text == "40" {
                            let accepted = r#"40{"sid":"socket-1"}"#.to_string();
                            if socket.send(WsMessage::text(accepted)).await.is_err() {
                                return;
                            }
                        }
                        let _ = from_client.send(text);
                    }
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => return,
                    Some(Ok(_)) => {}
                },
                outgoing = to_client.recv() => match outgoing {
                    Some(ToClient::Frame(frame)) => {
                        if socket.send(WsMessage::text(frame)).await.is_err() {
                            return;
                        }
                    }
                    Some(ToClient::Close) | None => {
                        let _ = socket.close(None).await;
                        return;
                    }
                },
            }
        }
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn alice() -> Session {
        Session::new("u1", "Alice", "token-1")
    }

    fn config(channel_url: &str, api_url: &str) -> Config {
        let mut config = Config::default();
        config.server.url = channel_url.to_string();
        config.server.api_url = Some(api_url.to_string());
        config.connection.retry_delay_ms = 10;
        config.connection.connect_timeout_seconds = 5;
        config
    }

    fn wire_message(id: &str, sender: &str, receiver: &str, content: &str, is_read: bool) -> Value {
        json!({
            "_id": id,
            "sender": sender,
            "receiver": receiver,
            "content": content,
            "isRead": is_read,
            "createdAt": "2024-03-12T09:00:00Z",
        })
    }

    async fn mount_unread(server: &MockServer, body: Value) {
        Mock::given(method("GET"))
            .and(path("/api/unread-count/u1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(server)
            .await;
    }

    async fn mount_history(server: &MockServer, peer_id: &str, body: Value) {
        Mock::given(method("GET"))
            .and(path(format!("/api/messages/u1/{peer_id}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(server)
            .await;
    }

    async fn requests_to(server: &MockServer, endpoint: &str) -> usize {
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|request| request.url.path() == endpoint)
            .count()
    }

    async fn next_event(engine: &mut SyncEngine<HttpChatApi>) {
        timeout(TIMEOUT, engine.process_next_event())
            .await
            .expect("timed out waiting for a channel event");
    }

    // ── 1. A full session over the real websocket transport ────────

    #[tokio::test]
    async fn session_flows_over_websocket_and_http() {
        let mut channel = ChannelServer::start().await;
        let http = MockServer::start().await;
        mount_unread(&http, json!([{ "_id": "u3", "count": 2 }])).await;
        mount_history(
            &http,
            "u2",
            json!([wire_message("m1", "u2", "u1", "morning", false)]),
        )
        .await;

        let bus: Arc<dyn EventBus> = Arc::new(BroadcastEventBus::default());
        let mut events = bus.subscribe("sync.**").unwrap();
        let api = HttpChatApi::new(&http.uri()).unwrap();
        let mut engine: SyncEngine<HttpChatApi> =
            SyncEngine::new(alice(), &config(&channel.url, &http.uri()), api, bus);

        engine.connect().await.unwrap();
        let mut server = channel.accept().await;
        assert_eq!(engine.connection_state(), ConnectionState::Connected);

        let (name, data) = server.next_event().await;
        assert_eq!(name, "user_connected");
        assert_eq!(data, json!({ "userId": "u1", "userName": "Alice" }));

        engine.settle().await;
        assert_eq!(engine.unread().count("u3"), 2);

        server.emit(
            "users_online",
            json!([
                { "userId": "u1", "userName": "Alice" },
                { "userId": "u2", "userName": "Bob" },
            ]),
        );
        next_event(&mut engine).await;
        assert_eq!(
            engine.presence().list_online(),
            &[PresenceEntry::new("u2", "Bob")]
        );

        engine.select_peer("u2").await.unwrap();
        engine.settle().await;
        assert_eq!(engine.messages().conversation("u2").len(), 1);

        let (name, data) = server.next_event().await;
        assert_eq!(name, "mark_as_read");
        assert_eq!(data, json!("m1"));

        let sent = engine.send_message("hi").await.unwrap();
        assert!(sent.id.is_temporary());
        let (name, data) = server.next_event().await;
        assert_eq!(name, "private_message");
        assert_eq!(
            data,
            json!({ "senderId": "u1", "receiverId": "u2", "content": "hi" })
        );

        server.emit("message_read", json!("m1"));
        next_event(&mut engine).await;
        let m1 = engine
            .messages()
            .find(&MessageId::server("m1"))
            .expect("history message stored");
        assert_eq!(m1.delivery_state, DeliveryState::Read);

        engine.logout().await.unwrap();
        assert_eq!(engine.connection_state(), ConnectionState::Disconnected);
        assert_eq!(server.next_frame().await, "41");

        let mut saw_conversation = false;
        while let Some(event) = events.try_recv() {
            if let EventPayload::ConversationLoaded { peer_id, messages } = event.payload {
                assert_eq!(peer_id, "u2");
                assert_eq!(messages, 1);
                saw_conversation = true;
            }
        }
        assert!(saw_conversation);
    }

    // ── 2. Reconciling our own echo ────────────────────────────────

    #[tokio::test]
    async fn own_echo_replaces_the_optimistic_message() {
        let mut channel = ChannelServer::start().await;
        let http = MockServer::start().await;
        mount_unread(&http, json!([])).await;
        mount_history(&http, "u2", json!([])).await;

        let api = HttpChatApi::new(&http.uri()).unwrap();
        let mut engine: SyncEngine<HttpChatApi> = SyncEngine::new(
            alice(),
            &config(&channel.url, &http.uri()),
            api,
            Arc::new(BroadcastEventBus::default()),
        );
        engine.connect().await.unwrap();
        let mut server = channel.accept().await;
        server.next_event().await;

        engine.select_peer("u2").await.unwrap();
        engine.settle().await;
        let sent = engine.send_message("hi").await.unwrap();
        server.next_event().await;

        let now = chrono::Utc::now().to_rfc3339();
        server.emit(
            "new_message",
            json!({
                "message": {
                    "_id": "m9",
                    "sender": "u1",
                    "receiver": "u2",
                    "content": "hi",
                    "isRead": false,
                    "createdAt": now,
                },
                "sender": "u1",
            }),
        );
        next_event(&mut engine).await;

        let conversation = engine.messages().conversation("u2");
        assert_eq!(conversation.len(), 1);
        assert_eq!(conversation[0].id, MessageId::server("m9"));
        assert!(engine.messages().find(&sent.id).is_none());
        assert_eq!(engine.unread().count("u2"), 0);
    }

    // ── 3. Dropped socket recovers on a fresh connection ───────────

    #[tokio::test]
    async fn dropped_socket_reconnects_and_reloads_unread() {
        let mut channel = ChannelServer::start().await;
        let http = MockServer::start().await;
        mount_unread(&http, json!([{ "_id": "u2", "count": 1 }])).await;

        let api = HttpChatApi::new(&http.uri()).unwrap();
        let mut engine: SyncEngine<HttpChatApi> = SyncEngine::new(
            alice(),
            &config(&channel.url, &http.uri()),
            api,
            Arc::new(BroadcastEventBus::default()),
        );
        engine.connect().await.unwrap();
        let mut first = channel.accept().await;
        first.next_event().await;
        engine.settle().await;

        first.emit(
            "users_online",
            json!([{ "userId": "u2", "userName": "Bob" }]),
        );
        next_event(&mut engine).await;
        assert_eq!(engine.presence().list_online().len(), 1);

        first.drop_connection();
        next_event(&mut engine).await;
        assert!(engine.presence().list_online().is_empty());

        next_event(&mut engine).await;
        let mut second = channel.accept().await;
        let (name, _) = second.next_event().await;
        assert_eq!(name, "user_connected");
        assert_eq!(engine.connection_state(), ConnectionState::Connected);
        assert!(engine.presence().list_online().is_empty());

        engine.settle().await;
        assert_eq!(engine.unread().count("u2"), 1);
        assert_eq!(requests_to(&http, "/api/unread-count/u1").await, 2);
    }

    // ── 4. Session persistence across login and logout ─────────────

    #[tokio::test]
    async fn login_persists_session_until_logout() {
        let http = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": 1,
                "token": "token-1",
                "user": { "_id": "u1", "name": "Alice" },
            })))
            .mount(&http)
            .await;
        mount_unread(&http, json!([])).await;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileSessionStore::new(dir.path().join("session.json")));

        let api = HttpChatApi::new(&http.uri()).unwrap();
        let session = api.login("alice@example.com", "secret").await.unwrap();
        assert_eq!(session, alice());
        store.save(&session).unwrap();

        let restored = store.load().unwrap().expect("session saved");
        assert_eq!(restored, alice());
        assert_eq!(
            api.fetch_unread_counts(&restored).await.unwrap(),
            Default::default()
        );

        let mut engine: SyncEngine<HttpChatApi> = SyncEngine::new(
            restored,
            &config("http://127.0.0.1:9", &http.uri()),
            api,
            Arc::new(BroadcastEventBus::default()),
        )
        .with_session_store(store.clone());
        engine.logout().await.unwrap();

        assert!(engine.session().is_none());
        assert!(store.load().unwrap().is_none());
        assert!(!dir.path().join("session.json").exists());
    }
}
