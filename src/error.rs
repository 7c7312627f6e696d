use thiserror::Error;

/// Crate-wide error type. Unifies the abstract error kinds of the protocol
/// design: transport lifecycle, encryption, decoding, protocol violations,
/// and handshake timeouts.
#[derive(Error, Debug)]
pub enum HiveError {
    #[error("transport closed: {0}")]
    TransportClosed(String),

    #[error("you must start the transport before emitting messages")]
    NotStarted,

    #[error("encryption error: {0}")]
    EncryptionKey(String),

    #[error("DecryptionKeyError: {0}")]
    DecryptionKey(String),

    #[error("decode error: {0}")]
    DecodeError(String),

    #[error("encode error: {0}")]
    EncodeError(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(std::time::Duration),

    #[error("handler error: {0}")]
    HandlerError(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("config error: {0}")]
    ConfigError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("toml serialize error: {0}")]
    TomlSerError(#[from] toml::ser::Error),

    #[error("toml deserialize error: {0}")]
    TomlDeError(#[from] toml::de::Error),

    #[error("websocket error: {0}")]
    WebSocketError(#[from] tokio_tungstenite::tungstenite::Error),
}

pub type Result<T> = std::result::Result<T, HiveError>;
