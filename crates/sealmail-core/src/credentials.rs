//! Session-only cache of user auth credentials.
//!
//! Credentials live in memory for the duration of the session so that
//! secure-data keys can be re-derived on demand. They are never written
//! to storage.

use std::collections::HashMap;
use std::sync::Mutex;

/// A user's login credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserCredentials {
    /// Email address (doubles as the user id).
    pub email: String,
    /// Password, kept only for the session.
    pub password: String,
}

/// In-memory credentials cache.
#[derive(Debug, Default)]
pub struct AuthCredentials {
    users: Mutex<HashMap<String, UserCredentials>>,
}

impl AuthCredentials {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Caches credentials for a user.
    pub fn set(&self, user_id: &str, email: &str, password: &str) {
        if let Ok(mut users) = self.users.lock() {
            users.insert(
                user_id.to_string(),
                UserCredentials {
                    email: email.to_string(),
                    password: password.to_string(),
                },
            );
        }
    }

    /// Returns the cached credentials for a user, if any.
    #[must_use]
    pub fn get(&self, user_id: &str) -> Option<UserCredentials> {
        self.users
            .lock()
            .ok()
            .and_then(|users| users.get(user_id).cloned())
    }

    /// Drops a user's credentials (e.g. on logout).
    pub fn clear(&self, user_id: &str) {
        if let Ok(mut users) = self.users.lock() {
            users.remove(user_id);
        }
    }
}
