//! Authenticated encryption of chunk payloads
//!
//! Wire form: base64 of `nonce || ciphertext || tag`, AES-256-GCM under the
//! SHA-256 digest of the user's key hash.

use aes_gcm::aead::{Aead, OsRng, rand_core::RngCore};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

/// Length of the random nonce prefixed to every ciphertext
pub const NONCE_LEN: usize = 12;

/// Length of the GCM authentication tag
pub const TAG_LEN: usize = 16;

#[derive(Debug, Clone, Error)]
pub enum CodecError {
    #[error("Failed to serialize chunk: {0}")]
    Serialize(String),

    #[error("Failed to encrypt chunk")]
    Encryption,

    #[error("Chunk is not valid base64: {0}")]
    InvalidEncoding(String),

    #[error("Chunk is too short ({len} bytes)")]
    InvalidLength { len: usize },

    /// Wrong key or tampered ciphertext
    #[error("Failed to decrypt chunk")]
    Decryption,

    #[error("Decrypted chunk is malformed: {0}")]
    Malformed(String),
}

/// Symmetric key for chunk encryption
#[derive(Clone)]
pub struct ChunkKey {
    cipher: Aes256Gcm,
}

impl fmt::Debug for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChunkKey(..)")
    }
}

/// Derive the chunk key from the user-held key hash. The secret never
/// leaves the client.
pub fn derive_key(secret: &str) -> ChunkKey {
    let digest = Sha256::digest(secret.as_bytes());
    let key = Key::<Aes256Gcm>::clone_from_slice(&digest);
    ChunkKey {
        cipher: Aes256Gcm::new(&key),
    }
}

/// Serialize `value` to JSON and seal it under a fresh random nonce
pub fn encrypt_chunk<T: Serialize + ?Sized>(value: &T, key: &ChunkKey) -> Result<String, CodecError> {
    let plaintext =
        serde_json::to_vec(value).map_err(|e| CodecError::Serialize(e.to_string()))?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = key
        .cipher
        .encrypt(nonce, plaintext.as_slice())
        .map_err(|_| CodecError::Encryption)?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);
    Ok(STANDARD.encode(sealed))
}

/// Open a chunk produced by [`encrypt_chunk`] and parse its JSON
pub fn decrypt_chunk<T: DeserializeOwned>(text: &str, key: &ChunkKey) -> Result<T, CodecError> {
    let sealed = STANDARD
        .decode(text)
        .map_err(|e| CodecError::InvalidEncoding(e.to_string()))?;
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(CodecError::InvalidLength { len: sealed.len() });
    }

    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
    let plaintext = key
        .cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| CodecError::Decryption)?;

    serde_json::from_slice(&plaintext).map_err(|e| CodecError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    #[test]
    fn round_trip() {
        let key = derive_key("key-hash");
        let values = [
            json!(null),
            json!([]),
            json!({"version": 1, "items": [{"type": "category", "name": "Home", "items": []}]}),
            json!("unicode: planté ✓"),
        ];
        for value in values {
            let sealed = encrypt_chunk(&value, &key).unwrap();
            let opened: Value = decrypt_chunk(&sealed, &key).unwrap();
            assert_eq!(opened, value);
        }
    }

    #[test]
    fn nonce_is_fresh_per_call() {
        let key = derive_key("key-hash");
        let a = encrypt_chunk(&json!({"a": 1}), &key).unwrap();
        let b = encrypt_chunk(&json!({"a": 1}), &key).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_is_rejected() {
        let sealed = encrypt_chunk(&json!([1, 2, 3]), &derive_key("right")).unwrap();
        let result: Result<Value, _> = decrypt_chunk(&sealed, &derive_key("wrong"));
        assert!(matches!(result, Err(CodecError::Decryption)));
    }

    #[test]
    fn tampering_is_detected() {
        let key = derive_key("key-hash");
        let sealed = encrypt_chunk(&json!({"notes": "secret"}), &key).unwrap();
        let mut bytes = STANDARD.decode(&sealed).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let tampered = STANDARD.encode(bytes);

        let result: Result<Value, _> = decrypt_chunk(&tampered, &key);
        assert!(matches!(result, Err(CodecError::Decryption)));
    }

    #[test]
    fn short_and_garbled_input() {
        let key = derive_key("key-hash");
        let short = STANDARD.encode([0u8; NONCE_LEN]);
        assert!(matches!(
            decrypt_chunk::<Value>(&short, &key),
            Err(CodecError::InvalidLength { len: NONCE_LEN })
        ));
        assert!(matches!(
            decrypt_chunk::<Value>("not base64!", &key),
            Err(CodecError::InvalidEncoding(_))
        ));
    }
}
