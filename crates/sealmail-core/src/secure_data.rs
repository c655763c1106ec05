//! Per-user encrypted data store.
//!
//! Each user's secure data is a JSON object encrypted under the
//! secure-data half of a password-derived key. Storage only ever sees
//! the derivation parameters (salt, iteration count) and ciphertext;
//! the keys themselves live in a session cache and are re-derived on
//! demand from the cached credentials.

use std::collections::HashMap;
use std::sync::Arc;

use sealmail_crypto::{DerivedKeys, EntropyProvider, KdfParams};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::debug;

use crate::credentials::AuthCredentials;
use crate::error::{Error, Result};
use crate::storage::Storage;

/// Stored record layout: what actually reaches the storage collaborator.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct StoredRecord {
    /// Derivation salt, hex.
    salt: String,
    /// Iteration count that reproduces the keys.
    iterations: u32,
    /// Encrypted secure data (cipher envelope JSON).
    secure_data: String,
}

struct CachedUser {
    keys: DerivedKeys,
    data: Map<String, Value>,
}

/// The secure data service.
pub struct SecureData {
    storage: Arc<dyn Storage>,
    credentials: Arc<AuthCredentials>,
    entropy: Arc<dyn EntropyProvider>,
    /// Target duration for first-time key derivation. Tests dial this
    /// down to zero for a single-pass baseline derivation.
    strength_ms: u64,
    cache: Mutex<HashMap<String, CachedUser>>,
}

impl SecureData {
    /// Creates the service with the default derivation strength.
    #[must_use]
    pub fn new(
        storage: Arc<dyn Storage>,
        credentials: Arc<AuthCredentials>,
        entropy: Arc<dyn EntropyProvider>,
    ) -> Self {
        Self::with_strength_ms(storage, credentials, entropy, sealmail_crypto::DEFAULT_STRENGTH_MS)
    }

    /// Creates the service with an explicit derivation strength target.
    #[must_use]
    pub fn with_strength_ms(
        storage: Arc<dyn Storage>,
        credentials: Arc<AuthCredentials>,
        entropy: Arc<dyn EntropyProvider>,
        strength_ms: u64,
    ) -> Self {
        Self {
            storage,
            credentials,
            entropy,
            strength_ms,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a value from the user's secure data store, creating the
    /// store on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if credentials are missing, derivation fails, or
    /// the stored ciphertext cannot be decrypted.
    pub async fn get(&self, user_id: &str, key: &str) -> Result<Option<Value>> {
        let mut cache = self.cache.lock().await;
        let user = self.load_user(&mut cache, user_id).await?;
        Ok(user.data.get(key).cloned())
    }

    /// Sets a value in the user's secure data store and persists the
    /// re-encrypted blob.
    ///
    /// # Errors
    ///
    /// Returns an error if credentials are missing or storage fails.
    pub async fn set(&self, user_id: &str, key: &str, value: Value) -> Result<()> {
        let mut cache = self.cache.lock().await;
        let user = self.load_user(&mut cache, user_id).await?;
        user.data.insert(key.to_string(), value);

        let ciphertext =
            sealmail_crypto::encrypt(&user.keys.secure_data_key, &user.data).await?;
        let record = StoredRecord {
            salt: user.keys.salt.clone(),
            iterations: user.keys.iterations,
            secure_data: ciphertext,
        };
        self.storage
            .set(user_id, serde_json::to_value(&record)?)
            .await?;
        Ok(())
    }

    /// Drops a user's cached keys and plaintext, forcing a re-derivation
    /// on next access.
    pub async fn invalidate(&self, user_id: &str) {
        self.cache.lock().await.remove(user_id);
    }

    /// Loads (or creates) the user's store into the cache.
    async fn load_user<'a>(
        &self,
        cache: &'a mut HashMap<String, CachedUser>,
        user_id: &str,
    ) -> Result<&'a mut CachedUser> {
        if !cache.contains_key(user_id) {
            let auth = self
                .credentials
                .get(user_id)
                .ok_or_else(|| Error::NoCredentials(user_id.to_string()))?;

            let user = match self.storage.get(user_id).await? {
                Some(raw) => {
                    let record: StoredRecord = serde_json::from_value(raw)?;
                    // Re-derive deterministically with the persisted
                    // parameters.
                    let keys = sealmail_crypto::derive_key(
                        &auth.password,
                        KdfParams {
                            salt: record.salt,
                            iterations: Some(record.iterations),
                            required_strength_ms: None,
                        },
                    )
                    .await?;
                    let data = if record.secure_data.is_empty() {
                        Map::new()
                    } else {
                        sealmail_crypto::decrypt(&keys.secure_data_key, &record.secure_data)
                            .await?
                    };
                    CachedUser { keys, data }
                }
                None => {
                    debug!(user_id, "creating secure data store");
                    let keys = self.derive_new(&auth.password).await?;
                    let data = Map::new();
                    let ciphertext =
                        sealmail_crypto::encrypt(&keys.secure_data_key, &data).await?;
                    let record = StoredRecord {
                        salt: keys.salt.clone(),
                        iterations: keys.iterations,
                        secure_data: ciphertext,
                    };
                    self.storage
                        .set(user_id, serde_json::to_value(&record)?)
                        .await?;
                    CachedUser { keys, data }
                }
            };
            cache.insert(user_id.to_string(), user);
        }

        cache
            .get_mut(user_id)
            .ok_or_else(|| Error::InvalidState("secure data cache miss".into()))
    }

    async fn derive_new(&self, password: &str) -> Result<DerivedKeys> {
        let salt = self.entropy.get_random_bytes(sealmail_crypto::kdf::SALT_LEN);
        Ok(sealmail_crypto::derive_key(
            password,
            KdfParams {
                salt: hex::encode(&salt),
                iterations: None,
                required_strength_ms: Some(self.strength_ms),
            },
        )
        .await?)
    }
}

impl std::fmt::Debug for SecureData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureData")
            .field("strength_ms", &self.strength_ms)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use sealmail_crypto::OsEntropy;

    use super::*;
    use crate::storage::MemoryStorage;

    fn service() -> (SecureData, Arc<MemoryStorage>, Arc<AuthCredentials>) {
        let storage = Arc::new(MemoryStorage::new());
        let credentials = Arc::new(AuthCredentials::new());
        let secure = SecureData::with_strength_ms(
            Arc::clone(&storage) as Arc<dyn Storage>,
            Arc::clone(&credentials),
            Arc::new(OsEntropy),
            0,
        );
        (secure, storage, credentials)
    }

    #[tokio::test]
    async fn test_missing_credentials_rejected() {
        let (secure, _, _) = service();
        let err = secure.get("ghost@x", "pgp").await.unwrap_err();
        assert!(matches!(err, Error::NoCredentials(_)));
    }

    #[tokio::test]
    async fn test_create_on_first_use_persists_params_only() {
        let (secure, storage, credentials) = service();
        credentials.set("alice@x", "alice@x", "hunter2");

        assert!(secure.get("alice@x", "pgp").await.unwrap().is_none());

        let raw = storage.get("alice@x").await.unwrap().unwrap();
        let record: serde_json::Value = raw;
        assert!(record.get("salt").is_some());
        assert_eq!(
            record.get("iterations").and_then(Value::as_u64),
            Some(u64::from(sealmail_crypto::BASELINE_ITERATIONS))
        );
        // The record never carries key material, only ciphertext.
        assert!(record.get("secure_data").is_some());
        assert!(record.get("auth_key").is_none());
        assert!(record.get("secure_data_key").is_none());
    }

    #[tokio::test]
    async fn test_set_get_round_trip() {
        let (secure, _, credentials) = service();
        credentials.set("alice@x", "alice@x", "hunter2");

        secure
            .set("alice@x", "pgp", serde_json::json!({"backup": "blob"}))
            .await
            .unwrap();
        let value = secure.get("alice@x", "pgp").await.unwrap().unwrap();
        assert_eq!(value, serde_json::json!({"backup": "blob"}));
    }

    #[tokio::test]
    async fn test_survives_cache_invalidation() {
        let (secure, _, credentials) = service();
        credentials.set("alice@x", "alice@x", "hunter2");

        secure
            .set("alice@x", "pgp", serde_json::json!("persisted"))
            .await
            .unwrap();
        secure.invalidate("alice@x").await;

        // Re-derives from stored salt + iterations and decrypts.
        let value = secure.get("alice@x", "pgp").await.unwrap().unwrap();
        assert_eq!(value, serde_json::json!("persisted"));
    }

    #[tokio::test]
    async fn test_wrong_password_fails_decryption() {
        let (secure, storage, credentials) = service();
        credentials.set("alice@x", "alice@x", "hunter2");
        secure
            .set("alice@x", "pgp", serde_json::json!("secret"))
            .await
            .unwrap();
        secure.invalidate("alice@x").await;

        // Same stored record, different password.
        credentials.set("alice@x", "alice@x", "wrong-password");
        let fresh = SecureData::with_strength_ms(
            storage as Arc<dyn Storage>,
            credentials,
            Arc::new(OsEntropy),
            0,
        );
        let err = fresh.get("alice@x", "pgp").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Crypto(sealmail_crypto::Error::Decrypt)
        ));
    }
}
