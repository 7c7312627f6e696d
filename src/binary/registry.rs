//! The `REGISTRY`/`Action` schema codec: a fixed catalogue of known actions,
//! each with a small bit-packed field schema, so a peer can send a command
//! without round-tripping full JSON.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use serde_json::Value;

use crate::envelope::ActionRecord;
use crate::error::{HiveError, Result};

use super::{BitReader, BitWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Bool,
    Str { len_bits: u32 },
}

#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: &'static str,
    pub field_type: FieldType,
    pub default: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct ActionSchema {
    pub uid: u8,
    pub fields: &'static [FieldSpec],
}

fn registry() -> &'static BTreeMap<&'static str, ActionSchema> {
    static REGISTRY: OnceLock<BTreeMap<&'static str, ActionSchema>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        static EXECUTE_TTS_FIELDS: &[FieldSpec] = &[
            FieldSpec {
                name: "utterance",
                field_type: FieldType::Str { len_bits: 16 },
                default: None,
            },
            FieldSpec {
                name: "expect_response",
                field_type: FieldType::Bool,
                default: Some(Value::Bool(false)),
            },
            FieldSpec {
                name: "lang",
                field_type: FieldType::Str { len_bits: 8 },
                default: Some(Value::String("auto".to_string())),
            },
        ];
        let mut m = BTreeMap::new();
        m.insert(
            "execute_tts",
            ActionSchema { uid: 0, fields: EXECUTE_TTS_FIELDS },
        );
        m
    })
}

fn schema_by_uid(uid: u8) -> Option<(&'static str, &'static ActionSchema)> {
    registry().iter().find(|(_, s)| s.uid == uid).map(|(name, s)| (*name, s))
}

/// Encode a known action by name into its bit-packed wire form.
pub fn encode_action(action: &str, payload: &BTreeMap<String, Value>) -> Result<Vec<u8>> {
    let schema = registry()
        .get(action)
        .ok_or_else(|| HiveError::EncodeError(format!("unknown action: {action}")))?;

    let mut w = BitWriter::new();
    w.push_uint(schema.uid as u64, 6);

    for field in schema.fields {
        let value = payload.get(field.name).or(field.default.as_ref());
        let Some(value) = value else { continue };
        match field.field_type {
            FieldType::Bool => {
                let b = value.as_bool().unwrap_or(false);
                w.push_uint(b as u64, 1);
            }
            FieldType::Str { len_bits } => {
                let s = value
                    .as_str()
                    .ok_or_else(|| HiveError::EncodeError(format!("field {} is not a string", field.name)))?;
                let bytes = s.as_bytes();
                if bytes.len() as u64 >= 1u64 << len_bits {
                    return Err(HiveError::EncodeError(format!(
                        "field {} exceeds {}-bit length prefix",
                        field.name, len_bits
                    )));
                }
                w.push_uint(bytes.len() as u64, len_bits);
                w.push_bytes(bytes);
            }
        }
    }

    Ok(w.finish())
}

/// Decode a bit-packed action back into an [`ActionRecord`].
pub fn decode_action(bytes: &[u8]) -> Result<ActionRecord> {
    let mut r = BitReader::new(bytes);
    let uid = r.read_uint(6)? as u8;
    let (name, schema) = schema_by_uid(uid)
        .ok_or_else(|| HiveError::DecodeError(format!("unknown action uid: {uid}")))?;

    let mut data = BTreeMap::new();
    for field in schema.fields {
        let value = match field.field_type {
            FieldType::Bool => Value::Bool(r.read_uint(1)? == 1),
            FieldType::Str { len_bits } => {
                let len = r.read_uint(len_bits)? as usize;
                let bytes = r.read_bytes(len)?;
                let s = String::from_utf8(bytes)
                    .map_err(|e| HiveError::DecodeError(format!("invalid utf-8 in field {}: {e}", field.name)))?;
                Value::String(s)
            }
        };
        data.insert(field.name.to_string(), value);
    }

    Ok(ActionRecord { action: name.to_string(), uid, data })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execute_tts_roundtrips() {
        let mut payload = BTreeMap::new();
        payload.insert("utterance".to_string(), Value::String("hello world".to_string()));
        payload.insert("lang".to_string(), Value::String("en-us".to_string()));

        let encoded = encode_action("execute_tts", &payload).unwrap();
        let decoded = decode_action(&encoded).unwrap();

        assert_eq!(decoded.action, "execute_tts");
        assert_eq!(decoded.uid, 0);
        assert_eq!(decoded.data.get("utterance").unwrap().as_str(), Some("hello world"));
        assert_eq!(decoded.data.get("lang").unwrap().as_str(), Some("en-us"));
        assert_eq!(decoded.data.get("expect_response").unwrap().as_bool(), Some(false));
    }

    #[test]
    fn unknown_action_rejected() {
        let payload = BTreeMap::new();
        assert!(encode_action("does_not_exist", &payload).is_err());
    }
}
