//! Compact bit-packed framing for envelopes sent over the binary websocket
//! channel: a 5-bit message type, a compression flag, a length-prefixed meta
//! blob, an optional binary-subtype nibble, and the payload bytes.

pub mod registry;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec;
use crate::envelope::{BinarySubtype, Envelope, HiveMessageType, Payload};
use crate::error::{HiveError, Result};

/// Appends individual bits MSB-first into a byte buffer, the way
/// `bitstring.BitArray.append("uint:N=...")` does.
pub(crate) struct BitWriter {
    bytes: Vec<u8>,
    bit_len: usize,
}

impl BitWriter {
    pub(crate) fn new() -> Self {
        Self { bytes: Vec::new(), bit_len: 0 }
    }

    pub(crate) fn push_bit(&mut self, bit: bool) {
        let byte_idx = self.bit_len / 8;
        if byte_idx == self.bytes.len() {
            self.bytes.push(0);
        }
        if bit {
            self.bytes[byte_idx] |= 1 << (7 - (self.bit_len % 8));
        }
        self.bit_len += 1;
    }

    pub(crate) fn push_uint(&mut self, value: u64, nbits: u32) {
        for i in (0..nbits).rev() {
            self.push_bit((value >> i) & 1 == 1);
        }
    }

    pub(crate) fn push_bytes(&mut self, bytes: &[u8]) {
        for b in bytes {
            self.push_uint(*b as u64, 8);
        }
    }

    pub(crate) fn bit_len(&self) -> usize {
        self.bit_len
    }

    pub(crate) fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

/// Reads individual bits MSB-first out of a byte buffer.
pub(crate) struct BitReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub(crate) fn read_bit(&mut self) -> Result<bool> {
        let byte_idx = self.pos / 8;
        let byte = *self
            .bytes
            .get(byte_idx)
            .ok_or_else(|| HiveError::DecodeError("bitstream exhausted".into()))?;
        let bit = (byte >> (7 - (self.pos % 8))) & 1 == 1;
        self.pos += 1;
        Ok(bit)
    }

    pub(crate) fn read_uint(&mut self, nbits: u32) -> Result<u64> {
        let mut v = 0u64;
        for _ in 0..nbits {
            v = (v << 1) | (self.read_bit()? as u64);
        }
        Ok(v)
    }

    pub(crate) fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        (0..n).map(|_| self.read_uint(8).map(|b| b as u8)).collect()
    }

    pub(crate) fn remaining_bits(&self) -> usize {
        self.bytes.len() * 8 - self.pos
    }

    pub(crate) fn read_remaining_bytes(&mut self) -> Result<Vec<u8>> {
        let n = self.remaining_bits() / 8;
        self.read_bytes(n)
    }
}

/// A decoded binary frame, before its meta/payload bytes are reinterpreted
/// as JSON or raw bytes by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    pub msg_type: HiveMessageType,
    pub compressed: bool,
    pub meta: Vec<u8>,
    pub binary_subtype: Option<BinarySubtype>,
    pub payload: Vec<u8>,
}

/// Pack a frame: `meta` and `payload` are raw bytes, already JSON-encoded by
/// the caller if that's what they represent; compression is applied here
/// when `compressed` is set.
pub fn encode_frame(
    msg_type: HiveMessageType,
    payload: &[u8],
    compressed: bool,
    meta: &[u8],
    binary_subtype: BinarySubtype,
) -> Result<Vec<u8>> {
    let mut w = BitWriter::new();
    w.push_uint(msg_type.binary_id() as u64, 5);
    w.push_uint(compressed as u64, 1);

    let meta_bytes = if compressed { codec::compress(meta)? } else { meta.to_vec() };
    if meta_bytes.len() > u8::MAX as usize {
        return Err(HiveError::EncodeError("meta exceeds 255 bytes".into()));
    }
    w.push_uint(meta_bytes.len() as u64, 8);
    w.push_bytes(&meta_bytes);

    if matches!(msg_type, HiveMessageType::Binary) {
        w.push_uint(binary_subtype as u64, 4);
    }

    let payload_bytes = if compressed { codec::compress(payload)? } else { payload.to_vec() };
    w.push_bytes(&payload_bytes);

    Ok(w.finish())
}

/// Unpack a frame produced by [`encode_frame`].
pub fn decode_frame(bytes: &[u8]) -> Result<DecodedFrame> {
    let mut r = BitReader::new(bytes);
    let msg_type = HiveMessageType::from_binary_id(r.read_uint(5)? as u8);
    let compressed = r.read_uint(1)? == 1;

    let meta_len = r.read_uint(8)? as usize;
    let meta_raw = r.read_bytes(meta_len)?;
    let meta = if compressed { codec::decompress(&meta_raw)? } else { meta_raw };

    let binary_subtype = if matches!(msg_type, HiveMessageType::Binary) {
        Some(BinarySubtype::from_u8(r.read_uint(4)? as u8))
    } else {
        None
    };

    let payload_raw = r.read_remaining_bytes()?;
    let payload = if compressed { codec::decompress(&payload_raw)? } else { payload_raw };

    Ok(DecodedFrame {
        msg_type,
        compressed,
        meta,
        binary_subtype,
        payload,
    })
}

/// The envelope fields carried inside a frame's `meta` blob: `msg_type` is
/// already the frame's type id, so only `route`/`source_peer`/`meta` need a
/// home here.
#[derive(Debug, Default, Serialize, Deserialize)]
struct FrameMeta {
    #[serde(default)]
    route: Vec<String>,
    #[serde(default)]
    source_peer: Option<String>,
    #[serde(default)]
    meta: BTreeMap<String, Value>,
}

/// Encode a full [`Envelope`] as a binary frame (C3/§4.3, §6.3): the
/// alternative to [`codec::serialize_envelope`] that receivers must also
/// accept.
pub fn encode_envelope(envelope: &Envelope, compressed: bool) -> Result<Vec<u8>> {
    let frame_meta = FrameMeta {
        route: envelope.route.clone(),
        source_peer: envelope.source_peer.clone(),
        meta: envelope.meta.clone(),
    };
    let meta_bytes = serde_json::to_vec(&frame_meta)?;

    let (wire_type, payload_bytes, subtype) = match &envelope.payload {
        Payload::Action(action) => (
            HiveMessageType::Registry,
            registry::encode_action(&action.action, &action.data)?,
            BinarySubtype::Undefined,
        ),
        Payload::Binary(bytes) => {
            let subtype = envelope
                .meta
                .get("bin_type")
                .and_then(Value::as_u64)
                .map(|v| BinarySubtype::from_u8(v as u8))
                .unwrap_or(BinarySubtype::Undefined);
            (HiveMessageType::Binary, bytes.clone(), subtype)
        }
        other => (
            envelope.msg_type,
            serde_json::to_vec(other)?,
            BinarySubtype::Undefined,
        ),
    };

    encode_frame(wire_type, &payload_bytes, compressed, &meta_bytes, subtype)
}

/// Decode a binary frame back into an [`Envelope`]. A `BINARY` frame is
/// always tagged `BINARY` on decode ("error correction" rule, §4.3); the
/// subtype is always written back to `meta.bin_type`, even when the
/// original envelope never set it (the one documented exception to the
/// round-trip law).
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope> {
    let frame = decode_frame(bytes)?;
    let frame_meta: FrameMeta = if frame.meta.is_empty() {
        FrameMeta::default()
    } else {
        serde_json::from_slice(&frame.meta)?
    };

    let (msg_type, payload, mut meta) = match frame.msg_type {
        HiveMessageType::Registry => {
            let action = registry::decode_action(&frame.payload)?;
            (HiveMessageType::Registry, Payload::Action(action), frame_meta.meta)
        }
        HiveMessageType::Binary => (
            HiveMessageType::Binary,
            Payload::Binary(frame.payload.clone()),
            frame_meta.meta,
        ),
        other => {
            let value: Value = serde_json::from_slice(&frame.payload)?;
            let payload = Payload::from_tagged_value(other, value)
                .map_err(|e| HiveError::DecodeError(e.to_string()))?;
            (other, payload, frame_meta.meta)
        }
    };

    if matches!(msg_type, HiveMessageType::Binary) {
        let subtype = frame.binary_subtype.unwrap_or(BinarySubtype::Undefined);
        meta.insert("bin_type".to_string(), Value::from(subtype as u8));
    }

    Ok(Envelope {
        msg_type,
        payload,
        route: frame_meta.route,
        source_peer: frame_meta.source_peer,
        meta,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrips_uncompressed() {
        let payload = br#"{"msg_type":"speak","data":{"utterance":"hello"}}"#;
        let frame = encode_frame(
            HiveMessageType::Bus,
            payload,
            false,
            b"{}",
            BinarySubtype::Undefined,
        )
        .unwrap();
        let decoded = decode_frame(&frame).unwrap();
        assert_eq!(decoded.msg_type, HiveMessageType::Bus);
        assert!(!decoded.compressed);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn frame_roundtrips_compressed() {
        let payload = "The Mycroft project is open-source voice assistant software.".repeat(4);
        let frame = encode_frame(
            HiveMessageType::Broadcast,
            payload.as_bytes(),
            true,
            b"{}",
            BinarySubtype::Undefined,
        )
        .unwrap();
        assert!(frame.len() < payload.len());
        let decoded = decode_frame(&frame).unwrap();
        assert_eq!(decoded.msg_type, HiveMessageType::Broadcast);
        assert_eq!(decoded.payload, payload.as_bytes());
    }

    #[test]
    fn binary_frame_carries_subtype() {
        let raw_audio = vec![1u8, 2, 3, 4, 5];
        let frame = encode_frame(
            HiveMessageType::Binary,
            &raw_audio,
            false,
            b"{}",
            BinarySubtype::RawAudio,
        )
        .unwrap();
        let decoded = decode_frame(&frame).unwrap();
        assert_eq!(decoded.msg_type, HiveMessageType::Binary);
        assert_eq!(decoded.binary_subtype, Some(BinarySubtype::RawAudio));
        assert_eq!(decoded.payload, raw_audio);
    }
}
