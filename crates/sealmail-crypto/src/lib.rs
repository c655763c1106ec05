//! # sealmail-crypto
//!
//! Symmetric cryptography for the sealmail secure email client.
//!
//! This crate covers the two CPU-heavy operations that must never run on
//! the caller's event loop:
//!
//! - **Key derivation** ([`kdf`]): adaptive-strength PBKDF2-HMAC-SHA512.
//!   The 512-bit output is split into an authentication key and a
//!   secure-data key. When a target duration is requested, the iteration
//!   count is rescaled until one derivation takes at least that long.
//! - **Authenticated encryption** ([`cipher`]): AES-256-GCM over a
//!   canonical JSON text form, with a fresh 16-byte IV per call.
//!
//! Both are executed on the blocking thread pool via
//! [`tokio::task::spawn_blocking`]; callers only ever observe futures.
//!
//! The [`entropy`] module defines the randomness source consumed here for
//! salts and IVs and by `sealmail-engine` for seeding the PGP engine's
//! entropy pool.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod cipher;
pub mod entropy;
mod error;
pub mod kdf;

pub use cipher::{CipherEnvelope, KEY_LEN, decrypt, encrypt};
pub use entropy::{EntropyProvider, OsEntropy};
pub use error::{Error, Result};
pub use kdf::{BASELINE_ITERATIONS, DEFAULT_STRENGTH_MS, DerivedKeys, KdfParams, derive_key, derive_new_key};
