//! Wire-level framing for an [`Envelope`]: JSON (de)serialization and the
//! optional zlib compression pass applied before encryption.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::envelope::Envelope;
use crate::error::{HiveError, Result};

/// Render an envelope as the JSON text placed on the wire (or handed to the
/// encryption layer).
pub fn serialize_envelope(envelope: &Envelope) -> Result<String> {
    Ok(serde_json::to_string(envelope)?)
}

/// Parse wire JSON back into an envelope.
pub fn parse_envelope(text: &str) -> Result<Envelope> {
    Ok(serde_json::from_str(text)?)
}

/// DEFLATE-compress (zlib framing, matching `zlib.compress`) arbitrary bytes.
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Inverse of [`compress`]. `data` may also be a hex string of the
/// compressed bytes, mirroring `decompress_string`'s "assume hex" fallback
/// for text transports that can't carry raw binary.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let raw = match std::str::from_utf8(data).ok().and_then(|s| hex::decode(s).ok()) {
        Some(decoded) => decoded,
        None => data.to_vec(),
    };
    let mut decoder = ZlibDecoder::new(&raw[..]);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| HiveError::DecodeError(e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use rstest::rstest;

    use super::*;
    use crate::envelope::{ActionRecord, BusMessage, Envelope, HelloInfo, HiveMessageType, Payload};

    /// Builds an envelope pairing `msg_type` with whatever payload shape
    /// that tag legally carries, so every variant can be driven through the
    /// same round-trip assertion.
    fn sample_envelope(msg_type: HiveMessageType) -> Envelope {
        use HiveMessageType::*;
        let payload = match msg_type {
            Bus | SharedBus | Broadcast | Propagate | Escalate => {
                Payload::Bus(BusMessage::new("speak"))
            }
            Hello => Payload::Hello(HelloInfo {
                node_id: "node-1".into(),
                peer: "peer-1".into(),
                pubkey: None,
            }),
            Binary => Payload::Binary(vec![1, 2, 3]),
            Registry => Payload::Action(ActionRecord {
                action: "execute_tts".into(),
                uid: 0,
                data: BTreeMap::new(),
            }),
            Handshake | Query | Cascade | Ping | Rendezvous | ThirdParty => {
                Payload::Json(serde_json::json!({"ok": true}))
            }
        };
        Envelope::new(msg_type, payload)
    }

    #[rstest]
    #[case(HiveMessageType::Handshake)]
    #[case(HiveMessageType::Bus)]
    #[case(HiveMessageType::SharedBus)]
    #[case(HiveMessageType::Broadcast)]
    #[case(HiveMessageType::Propagate)]
    #[case(HiveMessageType::Escalate)]
    #[case(HiveMessageType::Hello)]
    #[case(HiveMessageType::Query)]
    #[case(HiveMessageType::Cascade)]
    #[case(HiveMessageType::Ping)]
    #[case(HiveMessageType::Rendezvous)]
    #[case(HiveMessageType::ThirdParty)]
    #[case(HiveMessageType::Binary)]
    #[case(HiveMessageType::Registry)]
    fn envelope_roundtrips_through_json(#[case] msg_type: HiveMessageType) {
        let env = sample_envelope(msg_type);
        let text = serialize_envelope(&env).unwrap();
        let back = parse_envelope(&text).unwrap();
        assert_eq!(env, back);
    }

    #[test]
    fn compress_roundtrips() {
        let text = b"The Mycroft project is open-source voice assistant software.";
        let compressed = compress(text).unwrap();
        assert!(compressed.len() < text.len() * 2);
        let back = decompress(&compressed).unwrap();
        assert_eq!(back, text);
    }

    #[test]
    fn decompress_accepts_hex_input() {
        let text = b"hex-carried payload";
        let compressed = compress(text).unwrap();
        let hexed = hex::encode(&compressed);
        let back = decompress(hexed.as_bytes()).unwrap();
        assert_eq!(back, text);
    }
}
