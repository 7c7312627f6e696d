//! The hive envelope: the tagged wire message every other component builds on.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The full tag set a hive envelope can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HiveMessageType {
    Handshake,
    Bus,
    SharedBus,
    Broadcast,
    Propagate,
    Escalate,
    Hello,
    Query,
    Cascade,
    Ping,
    Rendezvous,
    #[serde(rename = "THIRDPRTY")]
    ThirdParty,
    Binary,
    Registry,
}

impl HiveMessageType {
    /// Type id used by the compact binary framer (5-bit field).
    pub const fn binary_id(self) -> u8 {
        match self {
            HiveMessageType::Handshake => 0,
            HiveMessageType::Bus => 1,
            HiveMessageType::SharedBus => 2,
            HiveMessageType::Broadcast => 3,
            HiveMessageType::Propagate => 4,
            HiveMessageType::Escalate => 5,
            HiveMessageType::Hello => 6,
            HiveMessageType::Query => 7,
            HiveMessageType::Cascade => 8,
            HiveMessageType::Ping => 9,
            HiveMessageType::Rendezvous => 10,
            HiveMessageType::ThirdParty => 11,
            HiveMessageType::Binary => 12,
            HiveMessageType::Registry => 13,
        }
    }

    /// Inverse of [`binary_id`](Self::binary_id). Unknown ids fall back to
    /// `ThirdParty`, per the forward-compatibility rule in the wire spec.
    pub const fn from_binary_id(id: u8) -> Self {
        match id {
            0 => HiveMessageType::Handshake,
            1 => HiveMessageType::Bus,
            2 => HiveMessageType::SharedBus,
            3 => HiveMessageType::Broadcast,
            4 => HiveMessageType::Propagate,
            5 => HiveMessageType::Escalate,
            6 => HiveMessageType::Hello,
            7 => HiveMessageType::Query,
            8 => HiveMessageType::Cascade,
            9 => HiveMessageType::Ping,
            10 => HiveMessageType::Rendezvous,
            12 => HiveMessageType::Binary,
            13 => HiveMessageType::Registry,
            _ => HiveMessageType::ThirdParty,
        }
    }
}

impl fmt::Display for HiveMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_else(|| format!("{:?}", self));
        write!(f, "{}", s)
    }
}

/// Reserved routing keys inside [`BusMessage::context`].
pub mod context_keys {
    pub const SOURCE: &str = "source";
    pub const DESTINATION: &str = "destination";
    pub const PLATFORM: &str = "platform";
    pub const NODE_ID: &str = "node_id";
    pub const PEER: &str = "peer";
}

/// The inner payload carried by `BUS` / `SHARED_BUS` envelopes: the
/// intra-assistant bus message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    pub msg_type: String,
    #[serde(default)]
    pub data: BTreeMap<String, Value>,
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
}

impl BusMessage {
    pub fn new(msg_type: impl Into<String>) -> Self {
        Self {
            msg_type: msg_type.into(),
            data: BTreeMap::new(),
            context: BTreeMap::new(),
        }
    }

    pub fn with_data(mut self, data: BTreeMap<String, Value>) -> Self {
        self.data = data;
        self
    }

    pub fn with_context(mut self, context: BTreeMap<String, Value>) -> Self {
        self.context = context;
        self
    }

    pub fn context_str(&self, key: &str) -> Option<&str> {
        self.context.get(key).and_then(Value::as_str)
    }

    /// `context.destination` may be a single peer id or a list of them.
    pub fn destinations(&self) -> Vec<String> {
        match self.context.get(context_keys::DESTINATION) {
            Some(Value::String(s)) => vec![s.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// The `HELLO` payload: an announcement from a hive peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloInfo {
    pub node_id: String,
    #[serde(default)]
    pub peer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<String>,
}

/// Pseudo-extension describing what a `BINARY` envelope's raw bytes mean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum BinarySubtype {
    Undefined = 0,
    RawAudio = 1,
    NumpyArray = 2,
    File = 3,
}

impl BinarySubtype {
    pub const fn from_u8(v: u8) -> Self {
        match v {
            1 => BinarySubtype::RawAudio,
            2 => BinarySubtype::NumpyArray,
            3 => BinarySubtype::File,
            _ => BinarySubtype::Undefined,
        }
    }
}

/// A schema-decoded `REGISTRY` action, see [`crate::binary::registry`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub action: String,
    pub uid: u8,
    pub data: BTreeMap<String, Value>,
}

/// The tagged payload carried by an envelope. Which variant is legal depends
/// on `msg_type`; construction helpers on [`Envelope`] enforce the common
/// pairings, but arbitrary JSON is always accepted as a fallback.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Bus(BusMessage),
    Nested(Box<Envelope>),
    Hello(HelloInfo),
    Action(ActionRecord),
    Binary(#[serde(with = "serde_bytes")] Vec<u8>),
    Json(Value),
}

impl Payload {
    /// Interpret a raw JSON value as a payload, given the envelope's
    /// `msg_type`. Unlike a plain `#[serde(untagged)]` derive, this is not
    /// ambiguous: the tag picks the shape, so a `BUS` envelope whose payload
    /// happens to look like a `HelloInfo` is still parsed as a `BusMessage`.
    pub(crate) fn from_tagged_value(
        msg_type: HiveMessageType,
        value: Value,
    ) -> std::result::Result<Self, serde_json::Error> {
        use HiveMessageType::*;
        match msg_type {
            Bus | SharedBus => Ok(Payload::Bus(serde_json::from_value(value)?)),
            Broadcast | Propagate | Escalate => {
                // Either a nested envelope or a bare bus message.
                if let Ok(nested) = serde_json::from_value::<Envelope>(value.clone()) {
                    Ok(Payload::Nested(Box::new(nested)))
                } else {
                    Ok(Payload::Bus(serde_json::from_value(value)?))
                }
            }
            Hello => Ok(Payload::Hello(serde_json::from_value(value)?)),
            Registry => Ok(Payload::Action(serde_json::from_value(value)?)),
            Binary => {
                let bytes = match value {
                    Value::Array(items) => items
                        .into_iter()
                        .map(|v| v.as_u64().map(|n| n as u8))
                        .collect::<Option<Vec<u8>>>()
                        .ok_or_else(|| serde::de::Error::custom("invalid BINARY payload bytes"))?,
                    Value::String(s) => s.into_bytes(),
                    other => {
                        return Err(serde::de::Error::custom(format!(
                            "unsupported BINARY payload shape: {other}"
                        )))
                    }
                };
                Ok(Payload::Binary(bytes))
            }
            Handshake | Query | Cascade | Ping | Rendezvous | ThirdParty => {
                Ok(Payload::Json(value))
            }
        }
    }
}

impl Payload {
    pub fn as_bus(&self) -> Option<&BusMessage> {
        match self {
            Payload::Bus(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_nested(&self) -> Option<&Envelope> {
        match self {
            Payload::Nested(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_hello(&self) -> Option<&HelloInfo> {
        match self {
            Payload::Hello(h) => Some(h),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Payload::Binary(b) => Some(b),
            _ => None,
        }
    }

    /// The nested `msg_type` string, used by the dispatcher's nested-payload
    /// waiters. Only `Bus` and `Json` objects with a `msg_type` field carry
    /// one.
    pub fn nested_msg_type(&self) -> Option<&str> {
        match self {
            Payload::Bus(b) => Some(b.msg_type.as_str()),
            Payload::Json(Value::Object(map)) => {
                map.get("msg_type").and_then(Value::as_str)
            }
            _ => None,
        }
    }
}

/// The hive message envelope. Self-contained: every field needed to
/// dispatch it is present after parsing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    pub msg_type: HiveMessageType,
    pub payload: Payload,
    #[serde(default)]
    pub route: Vec<String>,
    #[serde(default)]
    pub source_peer: Option<String>,
    #[serde(default)]
    pub meta: BTreeMap<String, Value>,
}

/// Mirrors [`Envelope`]'s wire shape but leaves `payload` as raw JSON, so it
/// can be reinterpreted once `msg_type` is known.
#[derive(Deserialize)]
struct EnvelopeRaw {
    msg_type: HiveMessageType,
    #[serde(default = "Value::default")]
    payload: Value,
    #[serde(default)]
    route: Vec<String>,
    #[serde(default)]
    source_peer: Option<String>,
    #[serde(default)]
    meta: BTreeMap<String, Value>,
}

impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = EnvelopeRaw::deserialize(deserializer)?;
        let payload = Payload::from_tagged_value(raw.msg_type, raw.payload)
            .map_err(serde::de::Error::custom)?;
        Ok(Envelope {
            msg_type: raw.msg_type,
            payload,
            route: raw.route,
            source_peer: raw.source_peer,
            meta: raw.meta,
        })
    }
}

impl Envelope {
    pub fn new(msg_type: HiveMessageType, payload: Payload) -> Self {
        Self {
            msg_type,
            payload,
            route: Vec::new(),
            source_peer: None,
            meta: BTreeMap::new(),
        }
    }

    pub fn with_source_peer(mut self, peer: impl Into<String>) -> Self {
        self.source_peer = Some(peer.into());
        self
    }

    pub fn with_meta(mut self, meta: BTreeMap<String, Value>) -> Self {
        self.meta = meta;
        self
    }

    /// Wrap a [`BusMessage`] into a `BUS` envelope — the common conversion
    /// used everywhere a caller hands over a raw bus message.
    pub fn from_bus(msg: BusMessage) -> Self {
        Self::new(HiveMessageType::Bus, Payload::Bus(msg))
    }

    pub fn is_binary(&self) -> bool {
        matches!(self.msg_type, HiveMessageType::Binary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_id_roundtrip() {
        for t in [
            HiveMessageType::Handshake,
            HiveMessageType::Bus,
            HiveMessageType::SharedBus,
            HiveMessageType::Broadcast,
            HiveMessageType::Propagate,
            HiveMessageType::Escalate,
            HiveMessageType::Hello,
            HiveMessageType::Query,
            HiveMessageType::Cascade,
            HiveMessageType::Ping,
            HiveMessageType::Rendezvous,
            HiveMessageType::ThirdParty,
            HiveMessageType::Binary,
            HiveMessageType::Registry,
        ] {
            assert_eq!(HiveMessageType::from_binary_id(t.binary_id()), t);
        }
    }

    #[test]
    fn unknown_binary_id_is_thirdparty() {
        assert_eq!(HiveMessageType::from_binary_id(31), HiveMessageType::ThirdParty);
    }

    #[test]
    fn bus_message_destinations_accepts_single_or_list() {
        let mut single = BusMessage::new("speak");
        single
            .context
            .insert(context_keys::DESTINATION.into(), Value::String("peerA".into()));
        assert_eq!(single.destinations(), vec!["peerA".to_string()]);

        let mut list = BusMessage::new("speak");
        list.context.insert(
            context_keys::DESTINATION.into(),
            Value::Array(vec![Value::String("peerA".into()), Value::String("peerB".into())]),
        );
        assert_eq!(
            list.destinations(),
            vec!["peerA".to_string(), "peerB".to_string()]
        );
    }

    #[test]
    fn from_bus_wraps_as_bus_envelope() {
        let msg = BusMessage::new("speak");
        let env = Envelope::from_bus(msg.clone());
        assert_eq!(env.msg_type, HiveMessageType::Bus);
        assert_eq!(env.payload.as_bus(), Some(&msg));
    }
}
