//! AES-128-GCM encryption for envelopes in transit, plus the password-derived
//! session key used when an explicit key isn't configured.
//!
//! Wire form is a JSON object `{"ciphertext", "tag", "nonce"}`, each a hex
//! string. A legacy form with no `tag` field is accepted on decrypt only:
//! the last 16 bytes of what's labelled `ciphertext` are reinterpreted as
//! the GCM tag, matching how browser WebCrypto emits AES-GCM output.

use aes_gcm::aead::{Aead, KeyInit, Payload as AeadPayload};
use aes_gcm::{Aes128Gcm, Key, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::error::{HiveError, Result};

const KEY_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Serialize, Deserialize)]
struct EncryptedEnvelope {
    ciphertext: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tag: Option<String>,
    nonce: String,
}

/// A session key held only as bytes, zeroized on drop.
#[derive(Clone)]
pub struct SessionKey([u8; KEY_LEN]);

impl SessionKey {
    /// Truncate (or accept as-is) an arbitrary secret to the 16 bytes AES-128
    /// needs. Keys longer than 16 bytes are truncated, matching the
    /// reference client's `key[0:16]` rule; shorter keys are invalid.
    pub fn from_secret(secret: &[u8]) -> Result<Self> {
        if secret.len() < KEY_LEN {
            return Err(HiveError::EncryptionKey(format!(
                "key must be at least {KEY_LEN} bytes, got {}",
                secret.len()
            )));
        }
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(&secret[..KEY_LEN]);
        Ok(SessionKey(bytes))
    }

    /// Derive a session key from a node identity password: `SHA-256(password)[..16]`.
    pub fn from_password(password: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(password.as_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(&digest[..KEY_LEN]);
        SessionKey(bytes)
    }

    fn as_aead_key(&self) -> &Key<Aes128Gcm> {
        Key::<Aes128Gcm>::from_slice(&self.0)
    }
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Encrypt `plaintext` and render the `{ciphertext, tag, nonce}` JSON form.
pub fn encrypt_json(key: &SessionKey, plaintext: &[u8]) -> Result<String> {
    let cipher = Aes128Gcm::new(key.as_aead_key());
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let sealed = cipher
        .encrypt(nonce, AeadPayload::from(plaintext))
        .map_err(|_| HiveError::EncryptionKey("AES-GCM encryption failed".into()))?;
    let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

    let wire = EncryptedEnvelope {
        ciphertext: hex::encode(ciphertext),
        tag: Some(hex::encode(tag)),
        nonce: hex::encode(nonce_bytes),
    };
    Ok(serde_json::to_string(&wire)?)
}

/// Decrypt the `{ciphertext, tag, nonce}` (or legacy tag-less) JSON form.
pub fn decrypt_json(key: &SessionKey, data: &str) -> Result<Vec<u8>> {
    let wire: EncryptedEnvelope = serde_json::from_str(data)?;
    let ciphertext_raw = hex::decode(&wire.ciphertext)
        .map_err(|e| HiveError::DecryptionKey(format!("invalid ciphertext hex: {e}")))?;
    let nonce_raw = hex::decode(&wire.nonce)
        .map_err(|e| HiveError::DecryptionKey(format!("invalid nonce hex: {e}")))?;
    if nonce_raw.len() != NONCE_LEN {
        return Err(HiveError::DecryptionKey(format!(
            "nonce must be {NONCE_LEN} bytes, got {}",
            nonce_raw.len()
        )));
    }

    let (ciphertext, tag) = match &wire.tag {
        Some(tag_hex) => {
            let tag = hex::decode(tag_hex)
                .map_err(|e| HiveError::DecryptionKey(format!("invalid tag hex: {e}")))?;
            (ciphertext_raw, tag)
        }
        None => {
            // legacy web-crypto form: tag is the trailing 16 bytes of ciphertext
            if ciphertext_raw.len() < TAG_LEN {
                return Err(HiveError::DecryptionKey(
                    "ciphertext too short to carry a trailing tag".into(),
                ));
            }
            let split = ciphertext_raw.len() - TAG_LEN;
            (ciphertext_raw[..split].to_vec(), ciphertext_raw[split..].to_vec())
        }
    };

    let mut sealed = ciphertext;
    sealed.extend_from_slice(&tag);

    let cipher = Aes128Gcm::new(key.as_aead_key());
    let nonce = Nonce::from_slice(&nonce_raw);
    cipher
        .decrypt(nonce, sealed.as_slice())
        .map_err(|_| HiveError::DecryptionKey("AES-GCM authentication failed".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_json_form() {
        let key = SessionKey::from_password("correct horse battery staple");
        let plaintext = b"{\"msg_type\":\"speak\"}";
        let wire = encrypt_json(&key, plaintext).unwrap();
        let decrypted = decrypt_json(&key, &wire).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn rejects_wrong_key() {
        let key = SessionKey::from_password("password-a");
        let wrong = SessionKey::from_password("password-b");
        let wire = encrypt_json(&key, b"secret payload").unwrap();
        assert!(decrypt_json(&wrong, &wire).is_err());
    }

    #[test]
    fn accepts_legacy_tagless_form() {
        let key = SessionKey::from_password("legacy-key");
        let plaintext = b"legacy payload";
        let cipher = Aes128Gcm::new(key.as_aead_key());
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let sealed = cipher.encrypt(nonce, AeadPayload::from(plaintext.as_slice())).unwrap();

        let legacy = EncryptedEnvelope {
            ciphertext: hex::encode(&sealed),
            tag: None,
            nonce: hex::encode(nonce_bytes),
        };
        let wire = serde_json::to_string(&legacy).unwrap();
        let decrypted = decrypt_json(&key, &wire).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn from_secret_truncates_long_keys() {
        let long_secret = vec![7u8; 32];
        let a = SessionKey::from_secret(&long_secret).unwrap();
        let b = SessionKey::from_secret(&long_secret[..KEY_LEN]).unwrap();
        assert_eq!(a.0, b.0);
    }
}
