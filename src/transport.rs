//! WebSocket transport: URL construction, TLS selection, the receive loop,
//! and the exponential-backoff reconnect supervisor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{
    connect_async_tls_with_config, native_tls, Connector, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::error::{HiveError, Result};

const INITIAL_RETRY: Duration = Duration::from_secs(5);
const MAX_RETRY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Open,
    Handshaking,
    Ready,
    Reconnecting,
    Closed,
}

/// Observer invoked by the reader task for every inbound frame and lifecycle
/// transition. Implemented by the dispatcher; kept as a trait here so the
/// transport doesn't depend on the dispatcher's types.
pub trait FrameSink: Send + Sync + 'static {
    fn on_frame(&self, data: Vec<u8>, binary: bool);
    fn on_open(&self) {}
    fn on_close(&self) {}
    fn on_error(&self, _err: &HiveError) {}
    fn on_reconnecting(&self, _delay: Duration) {}
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub useragent: String,
    pub access_key: String,
    pub allow_self_signed: bool,
}

impl TransportConfig {
    /// `ws[s]://<host>:<port>?authorization=base64(useragent:access_key)`.
    pub fn build_url(&self) -> Result<Url> {
        let scheme = if self.use_tls { "wss" } else { "ws" };
        let token = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", self.useragent, self.access_key));
        let raw = format!("{scheme}://{}:{}?authorization={token}", self.host, self.port);
        Url::parse(&raw).map_err(|e| HiveError::InvalidUrl(e.to_string()))
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = futures::stream::SplitSink<WsStream, WsMessage>;

/// A single WebSocket connection plus the reconnect supervisor that
/// replaces it on failure.
pub struct Transport {
    config: TransportConfig,
    state: Arc<RwLock<TransportState>>,
    sink: Arc<AsyncMutex<Option<WsSink>>>,
    retry_delay: AtomicU64,
    started: std::sync::atomic::AtomicBool,
}

impl Transport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            state: Arc::new(RwLock::new(TransportState::Disconnected)),
            sink: Arc::new(AsyncMutex::new(None)),
            retry_delay: AtomicU64::new(INITIAL_RETRY.as_secs()),
            started: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> TransportState {
        *self.state.read()
    }

    fn set_state(&self, new_state: TransportState) {
        *self.state.write() = new_state;
    }

    /// Opens the connection and spawns the reader/reconnect loop. Returns
    /// once the first connection attempt has been dispatched; callers learn
    /// of `open`/`ready` through the `FrameSink`.
    pub async fn start(self: &Arc<Self>, sink: Arc<dyn FrameSink>) -> Result<()> {
        self.started.store(true, Ordering::SeqCst);
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_forever(sink).await });
        Ok(())
    }

    async fn run_forever(self: Arc<Self>, sink: Arc<dyn FrameSink>) {
        loop {
            self.set_state(TransportState::Connecting);
            match self.connect_once().await {
                Ok(stream) => {
                    self.retry_delay.store(INITIAL_RETRY.as_secs(), Ordering::SeqCst);
                    self.set_state(TransportState::Open);
                    sink.on_open();
                    self.read_loop(stream, &sink).await;
                }
                Err(e) => {
                    error!(error = %e, "websocket connect failed");
                    sink.on_error(&e);
                }
            }

            if self.state() == TransportState::Closed {
                return;
            }

            let delay = Duration::from_secs(self.retry_delay.load(Ordering::SeqCst));
            self.set_state(TransportState::Reconnecting);
            sink.on_reconnecting(delay);
            info!(delay_secs = delay.as_secs(), "reconnecting");
            tokio::time::sleep(delay).await;

            let next = (self.retry_delay.load(Ordering::SeqCst) * 2).min(MAX_RETRY.as_secs());
            self.retry_delay.store(next, Ordering::SeqCst);
        }
    }

    async fn connect_once(&self) -> Result<WsStream> {
        let url = self.config.build_url()?;
        let connector = if self.config.allow_self_signed {
            let tls = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .build()
                .map_err(|e| HiveError::InvalidUrl(e.to_string()))?;
            Some(Connector::NativeTls(tls))
        } else {
            None
        };

        let (stream, response) =
            connect_async_tls_with_config(url.as_str(), None, false, connector).await?;
        debug!(status = %response.status(), "websocket handshake complete");
        Ok(stream)
    }

    async fn read_loop(&self, stream: WsStream, sink: &Arc<dyn FrameSink>) {
        let (write, mut read) = stream.split();
        *self.sink.lock().await = Some(write);
        self.set_state(TransportState::Handshaking);

        while let Some(msg) = read.next().await {
            match msg {
                Ok(WsMessage::Text(text)) => sink.on_frame(text.into_bytes(), false),
                Ok(WsMessage::Binary(data)) => sink.on_frame(data, true),
                Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => {}
                Ok(WsMessage::Close(_)) => {
                    warn!("peer closed websocket");
                    break;
                }
                Ok(WsMessage::Frame(_)) => {}
                Err(e) => {
                    error!(error = %e, "websocket read error");
                    sink.on_error(&HiveError::from(e));
                    break;
                }
            }
        }

        *self.sink.lock().await = None;
        if self.state() != TransportState::Closed {
            self.set_state(TransportState::Disconnected);
        }
        sink.on_close();
    }

    /// Mark the connection `ready` once the handshake (first `HELLO`) has
    /// completed.
    pub fn mark_ready(&self) {
        self.set_state(TransportState::Ready);
    }

    pub async fn send(&self, data: Vec<u8>, binary: bool) -> Result<()> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(HiveError::NotStarted);
        }
        let mut guard = self.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            return Err(HiveError::TransportClosed("no active connection".into()));
        };
        let message = if binary { WsMessage::Binary(data) } else { WsMessage::Text(String::from_utf8_lossy(&data).into_owned()) };
        sink.send(message).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.set_state(TransportState::Closed);
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.send(WsMessage::Close(None)).await;
            let _ = sink.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_url_encodes_authorization() {
        let config = TransportConfig {
            host: "hive.example.com".into(),
            port: 5678,
            use_tls: true,
            useragent: "test-client".into(),
            access_key: "secret".into(),
            allow_self_signed: false,
        };
        let url = config.build_url().unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.host_str(), Some("hive.example.com"));
        assert_eq!(url.port(), Some(5678));
        let token = base64::engine::general_purpose::STANDARD.encode("test-client:secret");
        assert!(url.query().unwrap().contains(&token));
    }

    #[test]
    fn plain_scheme_when_tls_disabled() {
        let config = TransportConfig {
            host: "localhost".into(),
            port: 1,
            use_tls: false,
            useragent: "a".into(),
            access_key: "b".into(),
            allow_self_signed: false,
        };
        assert_eq!(config.build_url().unwrap().scheme(), "ws");
    }
}
