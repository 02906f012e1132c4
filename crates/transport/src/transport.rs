use std::future::Future;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, trace};

use parley_core::config::ConnectionSettings;

use crate::error::ConnectionError;
use crate::wire::{self, Packet};

const SOCKET_IO_PATH: &str = "/socket.io/?EIO=4&transport=websocket";

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    /// Base http(s) or ws(s) URL of the channel server.
    pub url: String,
    /// Total attempts per connect/reconnect before giving up.
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub connect_timeout: Duration,
}

impl ConnectionConfig {
    pub fn from_settings(url: impl Into<String>, settings: &ConnectionSettings) -> Self {
        Self {
            url: url.into(),
            max_attempts: settings.max_attempts,
            retry_delay: settings.retry_delay(),
            connect_timeout: settings.connect_timeout(),
        }
    }
}

/// A bidirectional text-frame pipe to the channel server.
pub trait ChannelTransport: Sized + Send {
    fn connect(
        config: &ConnectionConfig,
    ) -> impl Future<Output = Result<Self, ConnectionError>> + Send;

    fn send(&mut self, frame: &str) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    /// Next text frame; an error means the connection is gone.
    fn recv(&mut self) -> impl Future<Output = Result<String, ConnectionError>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    /// Longest silence after which the peer is considered dead.
    fn liveness_timeout(&self) -> Option<Duration> {
        None
    }
}

pub struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    liveness: Option<Duration>,
}

impl WebSocketTransport {
    async fn open(config: &ConnectionConfig) -> Result<Self, ConnectionError> {
        let url = socket_url(&config.url)?;
        debug!(url = %url, "opening channel websocket");

        let (stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|error| ConnectionError::ConnectFailed(error.to_string()))?;
        let mut transport = Self {
            stream,
            liveness: None,
        };

        let open = transport.recv().await?;
        let info = match wire::decode(&open) {
            Ok(Packet::Open(info)) => info,
            Ok(other) => {
                return Err(ConnectionError::Transport(format!(
                    "expected open packet, got {other:?}"
                )));
            }
            Err(error) => return Err(ConnectionError::Transport(error.to_string())),
        };
        transport.liveness = liveness_from_open(&info);

        transport.send(&wire::encode(&Packet::Connect(None))).await?;

        loop {
            let frame = transport.recv().await?;
            match wire::decode(&frame) {
                Ok(Packet::Connect(_)) => break,
                Ok(Packet::ConnectError(data)) => {
                    return Err(ConnectionError::Rejected(wire::describe_error(&data)));
                }
                Ok(Packet::Ping) => transport.send(&wire::encode(&Packet::Pong)).await?,
                Ok(other) => trace!(?other, "ignoring packet during namespace connect"),
                Err(error) => trace!(%error, "ignoring undecodable frame during connect"),
            }
        }

        debug!("channel namespace connected");
        Ok(transport)
    }
}

impl ChannelTransport for WebSocketTransport {
    async fn connect(config: &ConnectionConfig) -> Result<Self, ConnectionError> {
        tokio::time::timeout(config.connect_timeout, Self::open(config))
            .await
            .map_err(|_| ConnectionError::Timeout)?
    }

    async fn send(&mut self, frame: &str) -> Result<(), ConnectionError> {
        self.stream
            .send(WsMessage::text(frame.to_owned()))
            .await
            .map_err(|error| ConnectionError::Transport(error.to_string()))
    }

    async fn recv(&mut self) -> Result<String, ConnectionError> {
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Text(text))) => return Ok(text.as_str().to_owned()),
                Some(Ok(WsMessage::Close(frame))) => {
                    let reason = frame
                        .map(|frame| frame.reason.as_str().to_owned())
                        .unwrap_or_else(|| "closed by server".to_string());
                    return Err(ConnectionError::Closed(reason));
                }
                // Binary frames are not used; websocket ping/pong is answered by tungstenite.
                Some(Ok(_)) => continue,
                Some(Err(error)) => return Err(ConnectionError::Transport(error.to_string())),
                None => return Err(ConnectionError::Closed("stream ended".to_string())),
            }
        }
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        let _ = self.send(&wire::encode(&Packet::Disconnect)).await;
        self.stream
            .close(None)
            .await
            .map_err(|error| ConnectionError::Transport(error.to_string()))
    }

    fn liveness_timeout(&self) -> Option<Duration> {
        self.liveness
    }
}

/// Rewrites a server base URL into the Engine.IO websocket endpoint.
pub fn socket_url(base: &str) -> Result<String, ConnectionError> {
    let base = base.trim().trim_end_matches('/');
    let rewritten = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if base.starts_with("ws://") || base.starts_with("wss://") {
        base.to_string()
    } else {
        return Err(ConnectionError::InvalidUrl(base.to_string()));
    };
    Ok(format!("{rewritten}{SOCKET_IO_PATH}"))
}

fn liveness_from_open(info: &Value) -> Option<Duration> {
    let interval = info.get("pingInterval")?.as_u64()?;
    let timeout = info.get("pingTimeout")?.as_u64()?;
    Some(Duration::from_millis(interval.saturating_add(timeout)))
}
