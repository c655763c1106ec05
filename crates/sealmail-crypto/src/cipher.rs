//! Authenticated symmetric encryption of structured values.
//!
//! Values are serialized to a canonical JSON text form, encrypted with
//! AES-256-GCM under a fresh 16-byte IV per call, and wrapped in a
//! self-describing JSON envelope. The cipher work runs on the blocking
//! thread pool.
//!
//! Keys are 256-bit hex strings, typically the `secure_data_key` half of
//! a [`crate::kdf::DerivedKeys`]. Any key of a different decoded length
//! is rejected before the cipher is ever invoked.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Key, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{Error, Result};

/// AES-256-GCM parameterized with a 16-byte nonce.
type Cipher = AesGcm<Aes256, U16>;

/// Required key length in bytes (256 bits).
pub const KEY_LEN: usize = 32;

/// IV length in bytes.
pub const IV_LEN: usize = 16;

/// Ciphertext envelope: IV and ciphertext, both base64.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CipherEnvelope {
    /// Initialization vector, base64.
    pub iv: String,
    /// Ciphertext with appended authentication tag, base64.
    pub ct: String,
}

/// Encrypts a serializable value under a 256-bit hex key.
///
/// Returns the JSON-serialized [`CipherEnvelope`].
///
/// # Errors
///
/// Returns [`Error::InvalidKeyLength`] for keys that do not decode to
/// exactly 32 bytes (checked before any cipher work), or
/// [`Error::Encrypt`] if encryption fails.
pub async fn encrypt<T: Serialize>(key: &str, data: &T) -> Result<String> {
    let key = decode_key(key)?;
    let plaintext = serde_json::to_vec(data)?;

    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    debug!(bytes = plaintext.len(), "encrypting");

    let envelope = tokio::task::spawn_blocking(move || {
        let cipher = Cipher::new(Key::<Cipher>::from_slice(&key));
        let ct = cipher
            .encrypt(Nonce::<U16>::from_slice(&iv), plaintext.as_ref())
            .map_err(|_| Error::Encrypt)?;
        Ok::<_, Error>(CipherEnvelope {
            iv: BASE64.encode(iv),
            ct: BASE64.encode(ct),
        })
    })
    .await
    .map_err(|e| Error::Worker(e.to_string()))??;

    Ok(serde_json::to_string(&envelope)?)
}

/// Decrypts a [`CipherEnvelope`] produced by [`encrypt`] and
/// deserializes the canonical text form back to a value.
///
/// # Errors
///
/// Returns [`Error::InvalidKeyLength`] for keys that do not decode to
/// exactly 32 bytes, or [`Error::Decrypt`] for any failure to recover
/// the plaintext: corrupt envelope, bad key, or authentication-tag
/// mismatch. The cause is deliberately not distinguished.
pub async fn decrypt<T: DeserializeOwned>(key: &str, ciphertext: &str) -> Result<T> {
    let key = decode_key(key)?;
    let envelope: CipherEnvelope = serde_json::from_str(ciphertext).map_err(|_| Error::Decrypt)?;
    let iv = BASE64.decode(&envelope.iv).map_err(|_| Error::Decrypt)?;
    if iv.len() != IV_LEN {
        return Err(Error::Decrypt);
    }
    let ct = BASE64.decode(&envelope.ct).map_err(|_| Error::Decrypt)?;

    let plaintext = tokio::task::spawn_blocking(move || {
        let cipher = Cipher::new(Key::<Cipher>::from_slice(&key));
        cipher
            .decrypt(Nonce::<U16>::from_slice(&iv), ct.as_ref())
            .map_err(|_| Error::Decrypt)
    })
    .await
    .map_err(|e| Error::Worker(e.to_string()))??;

    Ok(serde_json::from_slice(&plaintext)?)
}

/// Decodes and length-checks a hex key.
fn decode_key(key: &str) -> Result<[u8; KEY_LEN]> {
    let bytes = hex::decode(key)?;
    let actual = bytes.len();
    bytes.try_into().map_err(|_| Error::InvalidKeyLength {
        expected: KEY_LEN,
        actual,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn test_key() -> String {
        "2b".repeat(KEY_LEN)
    }

    #[tokio::test]
    async fn test_round_trip_string() {
        let key = test_key();
        let ct = encrypt(&key, &"hello world").await.unwrap();
        let pt: String = decrypt(&key, &ct).await.unwrap();
        assert_eq!(pt, "hello world");
    }

    #[tokio::test]
    async fn test_round_trip_structured_value() {
        let key = test_key();
        let value = serde_json::json!({"pgp": {"pubring": "a", "trustdb": [1, 2, 3]}, "n": 42});
        let ct = encrypt(&key, &value).await.unwrap();
        let pt: serde_json::Value = decrypt(&key, &ct).await.unwrap();
        assert_eq!(pt, value);
    }

    #[tokio::test]
    async fn test_short_key_rejected() {
        let key = "2b".repeat(31);
        let err = encrypt(&key, &"data").await.unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidKeyLength {
                expected: 32,
                actual: 31
            }
        ));
    }

    #[tokio::test]
    async fn test_long_key_rejected() {
        let key = "2b".repeat(33);
        let err = decrypt::<String>(&key, "{}").await.unwrap_err();
        assert!(matches!(err, Error::InvalidKeyLength { actual: 33, .. }));
    }

    #[tokio::test]
    async fn test_non_hex_key_rejected() {
        assert!(matches!(
            encrypt("zz", &"data").await.unwrap_err(),
            Error::InvalidHex(_)
        ));
    }

    #[tokio::test]
    async fn test_wrong_key_fails_closed() {
        let ct = encrypt(&test_key(), &"secret").await.unwrap();
        let other = "3c".repeat(KEY_LEN);
        assert!(matches!(
            decrypt::<String>(&other, &ct).await.unwrap_err(),
            Error::Decrypt
        ));
    }

    #[tokio::test]
    async fn test_tampered_ciphertext_fails_closed() {
        let key = test_key();
        let ct = encrypt(&key, &"secret").await.unwrap();
        let mut envelope: CipherEnvelope = serde_json::from_str(&ct).unwrap();
        let mut raw = BASE64.decode(&envelope.ct).unwrap();
        raw[0] ^= 0x01;
        envelope.ct = BASE64.encode(raw);
        let tampered = serde_json::to_string(&envelope).unwrap();
        assert!(matches!(
            decrypt::<String>(&key, &tampered).await.unwrap_err(),
            Error::Decrypt
        ));
    }

    #[tokio::test]
    async fn test_garbage_envelope_fails_closed() {
        assert!(matches!(
            decrypt::<String>(&test_key(), "not json at all").await.unwrap_err(),
            Error::Decrypt
        ));
    }

    #[tokio::test]
    async fn test_fresh_iv_per_call() {
        let key = test_key();
        let a = encrypt(&key, &"same input").await.unwrap();
        let b = encrypt(&key, &"same input").await.unwrap();
        assert_ne!(a, b);
        let ea: CipherEnvelope = serde_json::from_str(&a).unwrap();
        let eb: CipherEnvelope = serde_json::from_str(&b).unwrap();
        assert_ne!(ea.iv, eb.iv);
    }

    proptest! {
        #[test]
        fn prop_round_trip(value in "\\PC*", key_byte in 0u8..=255) {
            tokio_test::block_on(async {
                let key = hex::encode([key_byte; KEY_LEN]);
                let ct = encrypt(&key, &value).await.unwrap();
                let pt: String = decrypt(&key, &ct).await.unwrap();
                prop_assert_eq!(pt, value);
                Ok(())
            })?;
        }
    }
}
