//! Storage collaborator interface.
//!
//! Persistence lives outside this core: we only define the seam and an
//! in-memory implementation. Values are JSON; keys are user ids. What
//! gets stored here is derivation parameters (salt, iteration count)
//! and the engine's keyring backup blob — never derived keys.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

/// Key/value storage keyed by user identifier.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Returns the stored value for `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Stores `value` under `key`, returning the value back.
    async fn set(&self, key: &str, value: Value) -> Result<Value>;
}

/// In-memory storage, used by tests and the simulator wiring.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: Mutex<HashMap<String, Value>>,
}

impl MemoryStorage {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self
            .items
            .lock()
            .ok()
            .and_then(|items| items.get(key).cloned()))
    }

    async fn set(&self, key: &str, value: Value) -> Result<Value> {
        if let Ok(mut items) = self.items.lock() {
            items.insert(key.to_string(), value.clone());
        }
        Ok(value)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_set_round_trip() {
        let storage = MemoryStorage::new();
        assert!(storage.get("user@x").await.unwrap().is_none());

        let value = serde_json::json!({"salt": "ab", "iterations": 10000});
        let returned = storage.set("user@x", value.clone()).await.unwrap();
        assert_eq!(returned, value);
        assert_eq!(storage.get("user@x").await.unwrap(), Some(value));
    }

    #[tokio::test]
    async fn test_set_overwrites() {
        let storage = MemoryStorage::new();
        storage.set("k", serde_json::json!(1)).await.unwrap();
        storage.set("k", serde_json::json!(2)).await.unwrap();
        assert_eq!(storage.get("k").await.unwrap(), Some(serde_json::json!(2)));
    }
}
