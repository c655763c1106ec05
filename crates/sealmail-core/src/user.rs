//! Logged-in user management.
//!
//! Ensures a user's secure data store and PGP key material exist:
//! restore the keyring backup if one is stored, otherwise generate a
//! fresh key pair and back it up. The backup strictly follows a
//! confirmed-successful generate command — a failed generation must
//! never leave a half-written keyring in storage.

use std::sync::{Arc, Mutex};

use sealmail_engine::{Gpg, GpgBackup};
use tracing::{debug, info};

use crate::credentials::AuthCredentials;
use crate::error::{Error, Result};
use crate::secure_data::SecureData;

/// Key strength used for newly generated user keys.
const DEFAULT_KEY_STRENGTH_BITS: u32 = 2048;

/// Secure-data key under which the keyring backup is stored.
const PGP_DATA_KEY: &str = "pgp";

/// Manages the current user and their secure setup.
pub struct UserMgr {
    gpg: Arc<Gpg>,
    secure_data: Arc<SecureData>,
    credentials: Arc<AuthCredentials>,
    current_user: Mutex<Option<String>>,
}

impl UserMgr {
    /// Creates a user manager.
    #[must_use]
    pub fn new(
        gpg: Arc<Gpg>,
        secure_data: Arc<SecureData>,
        credentials: Arc<AuthCredentials>,
    ) -> Self {
        Self {
            gpg,
            secure_data,
            credentials,
            current_user: Mutex::new(None),
        }
    }

    /// Sets the current user.
    pub fn set_current_user(&self, user_id: &str) {
        if let Ok(mut current) = self.current_user.lock() {
            *current = Some(user_id.to_string());
        }
    }

    /// Returns the current user, if one is logged in.
    #[must_use]
    pub fn current_user(&self) -> Option<String> {
        self.current_user.lock().ok().and_then(|c| c.clone())
    }

    /// Backs up the engine's keyring into the user's secure data store.
    ///
    /// # Errors
    ///
    /// Returns an error if no user is resolvable or storage fails.
    pub async fn backup_gpg_data(&self, user_id: Option<&str>) -> Result<()> {
        let user_id = self.resolve_user(user_id)?;
        let backup = self.gpg.backup().await?;
        self.secure_data
            .set(&user_id, PGP_DATA_KEY, serde_json::to_value(&backup)?)
            .await?;
        debug!(user = %user_id, files = backup.files.len(), "keyring backed up");
        Ok(())
    }

    /// Ensures the user's secure data store and PGP keys are set up.
    ///
    /// If a keyring backup exists it is restored into the engine.
    /// Otherwise a key pair is generated from the user's credentials and
    /// then backed up — only after the generate command has succeeded.
    ///
    /// # Errors
    ///
    /// Returns an error if no user is resolvable, credentials are
    /// missing, or any engine/storage step fails.
    pub async fn ensure_secure_setup(&self, user_id: Option<&str>) -> Result<()> {
        let user_id = self.resolve_user(user_id)?;

        match self.secure_data.get(&user_id, PGP_DATA_KEY).await? {
            Some(stored) => {
                let backup: GpgBackup = serde_json::from_value(stored)?;
                info!(user = %user_id, "restoring keyring from backup");
                self.gpg.restore(&backup).await?;
            }
            None => {
                let auth = self
                    .credentials
                    .get(&user_id)
                    .ok_or_else(|| Error::NoCredentials(user_id.clone()))?;

                info!(user = %user_id, "generating first key pair");
                self.gpg
                    .generate_key_pair(&auth.email, &auth.password, DEFAULT_KEY_STRENGTH_BITS)
                    .await?;
                // Reached only when generation reported success; a
                // failed command must never be backed up.
                self.backup_gpg_data(Some(&user_id)).await?;
            }
        }
        Ok(())
    }

    fn resolve_user(&self, user_id: Option<&str>) -> Result<String> {
        match user_id {
            Some(id) => Ok(id.to_string()),
            None => self.current_user().ok_or(Error::NoCurrentUser),
        }
    }
}

impl std::fmt::Debug for UserMgr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserMgr")
            .field("current_user", &self.current_user())
            .finish_non_exhaustive()
    }
}
