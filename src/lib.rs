//! Crate root.
//!
//! A client library bridging a local voice-assistant message bus to a
//! hierarchical mesh of peer assistants ("the hive") over WebSocket:
//! framing, envelope parsing, end-to-end encryption, a compact binary wire
//! encoding, reconnection, and the slave side of the hive routing protocol.

pub mod binary;
pub mod client;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod transport;

pub use client::HiveClient;
pub use config::ClientConfig;
pub use envelope::{BusMessage, Envelope, HiveMessageType, Payload};
pub use error::{HiveError, Result};
pub use identity::NodeIdentity;
