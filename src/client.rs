//! The public client: wires Transport + Dispatcher + SlaveProtocol +
//! Identity together and exposes the supervisor API callers use.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::codec;
use crate::config::ClientConfig;
use crate::crypto::SessionKey;
use crate::dispatcher::Dispatcher;
use crate::envelope::{BusMessage, Envelope, HiveMessageType, Payload};
use crate::error::{HiveError, Result};
use crate::identity::NodeIdentity;
use crate::protocol::{LocalBus, NoopBus, SlaveProtocol};
use crate::transport::{FrameSink, Transport, TransportConfig};

const CONNECTED_WAIT_PRIMARY: Duration = Duration::from_secs(10);

struct DispatchSink {
    dispatcher: Dispatcher,
    session_key: Option<SessionKey>,
}

impl FrameSink for DispatchSink {
    fn on_frame(&self, data: Vec<u8>, binary: bool) {
        // Unencrypted binary-framed traffic decodes directly; it never goes
        // through the ciphertext-JSON detection below (the encrypted wire
        // form is always JSON, per §6.2).
        if binary && self.session_key.is_none() {
            match crate::binary::decode_envelope(&data) {
                Ok(envelope) => self.dispatcher.dispatch_envelope(&envelope),
                Err(e) => warn!(error = %e, "failed to decode binary frame; dropping"),
            }
            return;
        }

        let text = match std::str::from_utf8(&data) {
            Ok(t) => t,
            Err(_) => {
                warn!("received non-UTF8 frame on text path; dropping");
                return;
            }
        };

        let plaintext = match (&self.session_key, looks_encrypted(text)) {
            (Some(key), true) => match crate::crypto::decrypt_json(key, text) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(error = %e, "decryption failed; dropping frame");
                    return;
                }
            },
            (Some(_), false) => {
                warn!("message was unencrypted");
                text.as_bytes().to_vec()
            }
            (None, _) => text.as_bytes().to_vec(),
        };

        let result = if binary {
            crate::binary::decode_envelope(&plaintext)
        } else {
            std::str::from_utf8(&plaintext)
                .map_err(|_| HiveError::DecodeError("decrypted payload was not valid UTF-8".into()))
                .and_then(codec::parse_envelope)
        };

        match result {
            Ok(envelope) => self.dispatcher.dispatch_envelope(&envelope),
            Err(e) => warn!(error = %e, "failed to decode envelope; dropping frame"),
        }
    }
}

fn looks_encrypted(text: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|v| v.as_object().map(|o| o.contains_key("ciphertext")))
        .unwrap_or(false)
}

/// Assembles the transport, dispatcher, and slave protocol, and exposes the
/// public API a caller uses to join a hive.
pub struct HiveClient {
    transport: Arc<Transport>,
    dispatcher: Dispatcher,
    protocol: Arc<SlaveProtocol>,
    session_key: Option<SessionKey>,
}

impl HiveClient {
    pub fn new(config: &ClientConfig, identity: &NodeIdentity, bus: Option<Arc<dyn LocalBus>>) -> Self {
        let session_key = identity
            .password()
            .or(config.password.as_deref())
            .map(SessionKey::from_password);

        let transport_config = TransportConfig {
            host: config.transport.host.clone(),
            port: config.transport.port,
            use_tls: config.transport.use_tls,
            useragent: config.transport.useragent.clone(),
            access_key: config.access_key.clone(),
            allow_self_signed: config.transport.allow_self_signed,
        };

        let dispatcher = Dispatcher::new();
        let bus = bus.unwrap_or_else(|| Arc::new(NoopBus));
        let protocol = SlaveProtocol::new(config.transport.useragent.clone(), config.protocol.share_bus, bus);

        Self {
            transport: Arc::new(Transport::new(transport_config)),
            dispatcher,
            protocol,
            session_key,
        }
    }

    /// Opens the connection, binds the slave protocol, and blocks until the
    /// first `HELLO` is processed (or `handshake_deadline` elapses).
    pub async fn connect(&self, handshake_deadline: Duration) -> Result<()> {
        self.protocol.bind(&self.dispatcher);

        let sink: Arc<dyn FrameSink> = Arc::new(DispatchSink {
            dispatcher: self.dispatcher.clone(),
            session_key: self.session_key.clone(),
        });
        self.transport.start(sink).await?;

        let hello = self
            .dispatcher
            .wait_for_envelope("HELLO", handshake_deadline)
            .await;
        if hello.is_none() {
            return Err(HiveError::HandshakeTimeout(handshake_deadline));
        }
        self.transport.mark_ready();
        info!("hive handshake complete");
        Ok(())
    }

    pub async fn close(&self) {
        self.transport.close().await;
    }

    /// Send an envelope as JSON, auto-injecting `BUS` context and blocking
    /// up to 10s, then indefinitely, for the transport to become ready.
    pub async fn emit(&self, envelope: Envelope) -> Result<()> {
        self.emit_framed(envelope, false).await
    }

    /// Like [`emit`](Self::emit), but encodes through the compact binary
    /// framer (§4.3) instead of JSON — the caller's choice per §4.5.
    pub async fn emit_binary(&self, envelope: Envelope) -> Result<()> {
        self.emit_framed(envelope, true).await
    }

    async fn emit_framed(&self, mut envelope: Envelope, binary: bool) -> Result<()> {
        if let Payload::Bus(bus_msg) = &mut envelope.payload {
            self.protocol.inject_context(bus_msg);
        }

        self.wait_connected().await?;

        if binary {
            let frame = crate::binary::encode_envelope(&envelope, false)?;
            match &self.session_key {
                Some(key) => {
                    let wire = crate::crypto::encrypt_json(key, &frame)?;
                    self.transport.send(wire.into_bytes(), false).await
                }
                None => self.transport.send(frame, true).await,
            }
        } else {
            let text = codec::serialize_envelope(&envelope)?;
            let wire = match &self.session_key {
                Some(key) => crate::crypto::encrypt_json(key, text.as_bytes())?,
                None => text,
            };
            self.transport.send(wire.into_bytes(), false).await
        }
    }

    pub async fn emit_bus(&self, msg: BusMessage) -> Result<()> {
        self.emit(Envelope::from_bus(msg)).await
    }

    async fn wait_connected(&self) -> Result<()> {
        use crate::transport::TransportState;

        if self.transport.state() == TransportState::Ready {
            return Ok(());
        }

        let deadline = tokio::time::sleep(CONNECTED_WAIT_PRIMARY);
        tokio::pin!(deadline);
        loop {
            if self.transport.state() == TransportState::Ready {
                return Ok(());
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                _ = &mut deadline => break,
            }
        }

        warn!("hivemind connection not ready after 10s, waiting indefinitely");
        loop {
            if self.transport.state() == TransportState::Ready {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub fn on(&self, name: &str, handler: impl Fn(&Envelope) + Send + Sync + 'static) {
        self.dispatcher.on(name, handler);
    }

    pub fn once(&self, name: &str, handler: impl Fn(&Envelope) + Send + Sync + 'static) {
        self.dispatcher.once(name, handler);
    }

    pub async fn wait_for_envelope(&self, kind: HiveMessageType, timeout: Duration) -> Option<Envelope> {
        self.dispatcher.wait_for_envelope(&kind.to_string(), timeout).await
    }

    pub async fn wait_for_nested(
        &self,
        kind: HiveMessageType,
        payload_type: &str,
        timeout: Duration,
    ) -> Option<Envelope> {
        self.dispatcher
            .wait_for_nested(&kind.to_string(), payload_type, timeout)
            .await
    }

    pub async fn wait_for_response(
        &self,
        envelope: Envelope,
        reply_kind: Option<HiveMessageType>,
        timeout: Duration,
    ) -> Result<Option<Envelope>> {
        let reply_kind = reply_kind.unwrap_or(envelope.msg_type);
        self.emit(envelope).await?;
        Ok(self.wait_for_envelope(reply_kind, timeout).await)
    }

    pub async fn wait_for_nested_response(
        &self,
        envelope: Envelope,
        payload_type: &str,
        reply_kind: Option<HiveMessageType>,
        timeout: Duration,
    ) -> Result<Option<Envelope>> {
        let reply_kind = reply_kind.unwrap_or(envelope.msg_type);
        self.emit(envelope).await?;
        Ok(self.wait_for_nested(reply_kind, payload_type, timeout).await)
    }
}
