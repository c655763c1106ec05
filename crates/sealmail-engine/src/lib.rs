//! # sealmail-engine
//!
//! Orchestration of a sandboxed, GnuPG-compatible OpenPGP engine.
//!
//! The engine itself is an opaque capability hosted inside an isolated
//! worker with a private virtual filesystem. This crate provides:
//!
//! - **Worker protocol** ([`protocol`]): JSON commands (`mkdir`,
//!   `add_data`, chunked `get_file`, `run`) tagged with correlation ids.
//! - **Channel** ([`channel`]): request/response matching by id, with
//!   out-of-order chunk reassembly for file reads.
//! - **Worker** ([`worker`]): the isolated task owning one engine
//!   instance and one filesystem copy; everything crossing the boundary
//!   is serialized, nothing is shared.
//! - **Orchestrator** ([`orchestrator`]): the single serialized command
//!   queue. One engine command executes at a time, a worker instance is
//!   discarded after one `run`, and the entropy pool is seeded into the
//!   filesystem once per process lifetime.
//! - **Keyring parser** ([`keyring`]): colon-format key listings parsed
//!   into key/identity/subkey trees.
//!
//! ## Command lifecycle
//!
//! ```text
//! ┌──────────┐ acquire ┌─────────────────────────────────────────┐
//! │  caller   │ ──────→ │ load vfs → worker │ run cmds │ extract   │
//! │ (queued)  │         │ outputs → persist vfs → release lock    │
//! └──────────┘         └─────────────────────────────────────────┘
//! ```
//!
//! Callers may issue concurrent requests; the lock queue guarantees
//! FIFO, non-overlapping execution.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod channel;
pub mod engine;
mod error;
pub mod keyring;
pub mod orchestrator;
pub mod protocol;
pub mod stub;
pub mod vfs;
pub mod worker;

pub use channel::WorkerChannel;
pub use engine::{Engine, EngineFactory, EngineRun};
pub use error::{Error, Result};
pub use keyring::{KeyCapabilities, PgpIdentity, PgpKey, PgpKeyInfo, is_encrypted, parse_key_listing};
pub use orchestrator::{ALLOWED_KEY_STRENGTHS, ENTROPY_POOL_BYTES, GNUPG_HOME, Gpg, GpgBackup};
pub use protocol::{EXIT_STATUS_PREFIX, FILE_CHUNK_SIZE, WorkerCommand, WorkerReply};
pub use stub::{StubEngine, StubEngineFactory};
pub use vfs::{VfsSnapshot, VirtualFile};
