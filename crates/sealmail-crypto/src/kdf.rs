//! Adaptive-strength password-based key derivation.
//!
//! PBKDF2-HMAC-SHA512 with a 512-bit output, split into two 256-bit
//! halves: the first is the authentication key, the second the
//! secure-data key. When [`KdfParams::required_strength_ms`] is set, the
//! iteration count is rescaled against measured wall-clock time until a
//! single derivation takes at least the requested duration; the final
//! count is returned so that later derivations can reproduce the same
//! keys deterministically.

use std::time::Instant;

use pbkdf2::pbkdf2_hmac;
use sha2::Sha512;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::entropy::EntropyProvider;
use crate::error::{Error, Result};

/// Starting iteration count when none is supplied.
pub const BASELINE_ITERATIONS: u32 = 10_000;

/// Default target duration for deriving a brand-new key.
pub const DEFAULT_STRENGTH_MS: u64 = 1_000;

/// Salt length in bytes for newly derived keys.
pub const SALT_LEN: usize = 32;

/// PBKDF2 output length in bytes (512 bits).
const OUTPUT_LEN: usize = 64;

/// Key-derivation algorithm parameters.
///
/// `salt` is required. If `required_strength_ms` is set, any supplied
/// `iterations` value is only the starting point for the adaptive loop.
#[derive(Debug, Clone, Default)]
pub struct KdfParams {
    /// Salt as a hex string.
    pub salt: String,
    /// Number of iterations to perform. Defaults to [`BASELINE_ITERATIONS`].
    pub iterations: Option<u32>,
    /// Target wall-clock duration; derivation repeats, rescaling the
    /// iteration count, until one pass takes at least this long.
    pub required_strength_ms: Option<u64>,
}

/// Result of a key derivation.
///
/// The two 256-bit keys are hex strings. Both halves are wiped from
/// memory on drop; callers must persist only `salt` and `iterations`,
/// never the keys themselves.
#[derive(Debug, Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKeys {
    /// Authentication key (first 256 bits of the PBKDF2 output), hex.
    pub auth_key: String,
    /// Secure-data encryption key (last 256 bits), hex.
    pub secure_data_key: String,
    /// Salt that was used, hex.
    #[zeroize(skip)]
    pub salt: String,
    /// Iteration count actually used. Persist alongside the salt to make
    /// future derivations reproduce the same keys.
    #[zeroize(skip)]
    pub iterations: u32,
}

/// Derives a brand-new key from a user password.
///
/// Obtains a fresh random salt from `entropy`, then runs an adaptive
/// derivation targeting [`DEFAULT_STRENGTH_MS`].
///
/// # Errors
///
/// Returns an error if the derivation worker fails.
pub async fn derive_new_key(entropy: &dyn EntropyProvider, password: &str) -> Result<DerivedKeys> {
    let salt = entropy.get_random_bytes(SALT_LEN);
    derive_key(
        password,
        KdfParams {
            salt: hex::encode(&salt),
            iterations: None,
            required_strength_ms: Some(DEFAULT_STRENGTH_MS),
        },
    )
    .await
}

/// Derives keys from a password and existing algorithm parameters.
///
/// Runs on the blocking thread pool; the caller's event loop is never
/// stalled by the PBKDF2 work.
///
/// # Errors
///
/// Returns an error if the salt is not valid hex or the worker fails.
pub async fn derive_key(password: &str, params: KdfParams) -> Result<DerivedKeys> {
    let salt = hex::decode(&params.salt)?;
    let salt_hex = params.salt;
    let password = password.to_owned();
    debug!(iterations = ?params.iterations, target_ms = ?params.required_strength_ms, "deriving key");

    tokio::task::spawn_blocking(move || {
        derive_blocking(
            &password,
            &salt,
            salt_hex,
            params.iterations,
            params.required_strength_ms,
        )
    })
    .await
    .map_err(|e| Error::Worker(e.to_string()))
}

/// The derivation loop proper. Runs synchronously; see [`derive_key`].
fn derive_blocking(
    password: &str,
    salt: &[u8],
    salt_hex: String,
    iterations: Option<u32>,
    required_strength_ms: Option<u64>,
) -> DerivedKeys {
    let mut iterations = iterations.unwrap_or(BASELINE_ITERATIONS);
    let mut output = [0u8; OUTPUT_LEN];

    loop {
        let start = Instant::now();
        pbkdf2_hmac::<Sha512>(password.as_bytes(), salt, iterations, &mut output);
        let elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

        match required_strength_ms {
            Some(target) if elapsed_ms < target => {
                // Not strong enough yet: rescale proportionally and retry.
                if elapsed_ms == 0 {
                    iterations = iterations.saturating_mul(2);
                } else {
                    let rescaled = u64::from(iterations) * target / elapsed_ms + 1;
                    iterations = u32::try_from(rescaled).unwrap_or(u32::MAX);
                }
                debug!(iterations, elapsed_ms, target, "rescaling iteration count");
            }
            _ => break,
        }
    }

    let keys = DerivedKeys {
        auth_key: hex::encode(&output[..OUTPUT_LEN / 2]),
        secure_data_key: hex::encode(&output[OUTPUT_LEN / 2..]),
        salt: salt_hex,
        iterations,
    };
    output.zeroize();
    keys
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::entropy::OsEntropy;

    #[tokio::test]
    async fn test_zero_strength_is_single_pass_at_baseline() {
        let keys = derive_key(
            "",
            KdfParams {
                salt: "00".repeat(32),
                iterations: None,
                required_strength_ms: Some(0),
            },
        )
        .await
        .unwrap();

        assert_eq!(keys.iterations, BASELINE_ITERATIONS);
        assert_eq!(keys.auth_key.len(), 64);
        assert_eq!(keys.secure_data_key.len(), 64);
        assert_ne!(keys.auth_key, keys.secure_data_key);
    }

    #[tokio::test]
    async fn test_deterministic_for_fixed_parameters() {
        let params = KdfParams {
            salt: "ab".repeat(32),
            iterations: Some(1000),
            required_strength_ms: None,
        };
        let a = derive_key("hunter2", params.clone()).await.unwrap();
        let b = derive_key("hunter2", params).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_different_salt_different_keys() {
        let a = derive_key(
            "hunter2",
            KdfParams {
                salt: "00".repeat(32),
                iterations: Some(1000),
                required_strength_ms: None,
            },
        )
        .await
        .unwrap();
        let b = derive_key(
            "hunter2",
            KdfParams {
                salt: "01".repeat(32),
                iterations: Some(1000),
                required_strength_ms: None,
            },
        )
        .await
        .unwrap();
        assert_ne!(a.auth_key, b.auth_key);
    }

    #[tokio::test]
    async fn test_adaptive_count_reproduces_keys_non_adaptively() {
        // A small target so the test stays fast; the loop must still have
        // converged (measured time >= target) by the time it returns.
        let adaptive = derive_key(
            "correct horse",
            KdfParams {
                salt: "42".repeat(32),
                iterations: None,
                required_strength_ms: Some(5),
            },
        )
        .await
        .unwrap();

        let replay = derive_key(
            "correct horse",
            KdfParams {
                salt: "42".repeat(32),
                iterations: Some(adaptive.iterations),
                required_strength_ms: None,
            },
        )
        .await
        .unwrap();

        assert_eq!(adaptive.auth_key, replay.auth_key);
        assert_eq!(adaptive.secure_data_key, replay.secure_data_key);
        assert_eq!(adaptive.iterations, replay.iterations);
    }

    #[tokio::test]
    async fn test_derive_new_key_uses_fresh_salt() {
        let a = derive_new_key_fast("pw").await;
        let b = derive_new_key_fast("pw").await;
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.auth_key, b.auth_key);
    }

    #[tokio::test]
    async fn test_invalid_salt_hex_rejected() {
        let err = derive_key(
            "pw",
            KdfParams {
                salt: "not hex".into(),
                iterations: Some(10),
                required_strength_ms: None,
            },
        )
        .await;
        assert!(matches!(err, Err(Error::InvalidHex(_))));
    }

    #[tokio::test]
    #[ignore = "runs a full-strength (one second) derivation"]
    async fn test_derive_new_key_full_strength() {
        let keys = derive_new_key(&OsEntropy, "pw").await.unwrap();
        assert!(keys.iterations >= BASELINE_ITERATIONS);
        assert_eq!(keys.auth_key.len(), 64);
        assert_eq!(keys.salt.len(), SALT_LEN * 2);
    }

    /// Like `derive_new_key` but with a tiny strength target.
    async fn derive_new_key_fast(password: &str) -> DerivedKeys {
        let salt = OsEntropy.get_random_bytes(SALT_LEN);
        derive_key(
            password,
            KdfParams {
                salt: hex::encode(&salt),
                iterations: Some(100),
                required_strength_ms: None,
            },
        )
        .await
        .unwrap()
    }
}
