//! Randomness source for salts, IVs, and engine entropy seeding.

use bytes::Bytes;
use rand::RngCore;
use rand::rngs::OsRng;

/// Supplies cryptographically secure random bytes.
///
/// Consumed for key-derivation salts and cipher IVs in this crate, and by
/// the engine orchestrator to fill the PGP engine's entropy pool file.
/// A trait so that tests can substitute a deterministic source.
pub trait EntropyProvider: Send + Sync {
    /// Returns `num_bytes` of random data.
    fn get_random_bytes(&self, num_bytes: usize) -> Bytes;
}

/// Entropy provider backed by the operating system's CSPRNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsEntropy;

impl EntropyProvider for OsEntropy {
    fn get_random_bytes(&self, num_bytes: usize) -> Bytes {
        let mut buf = vec![0u8; num_bytes];
        OsRng.fill_bytes(&mut buf);
        Bytes::from(buf)
    }
}
