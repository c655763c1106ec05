//! # sealmail-core
//!
//! Message processing state machines and secure data services for the
//! sealmail secure email client.
//!
//! This crate ties the engine orchestrator (`sealmail-engine`) and the
//! symmetric crypto layer (`sealmail-crypto`) into the per-message
//! pipelines the application drives:
//!
//! - **Inbound** ([`inbound`]): streamed body download with a 1 KB
//!   preview, debounced public-key lookup, signature verification and
//!   decryption — all surfaced as replayable state events.
//! - **Outbound** ([`outbound`] + [`mailbox`]): recipient parsing with
//!   per-address key coverage, sign-or-encrypt decision, and a
//!   per-mailbox FIFO queue that serializes sends.
//! - **Secure data** ([`secure_data`], [`credentials`], [`user`]):
//!   password-derived master keys (parameters persisted, keys never),
//!   encrypted per-user storage, and keyring backup/restore ordering.
//! - **Collaborator seams** ([`storage`], [`server`]): the persistence
//!   and transport interfaces this core consumes but does not
//!   implement, plus an in-memory store and a transport simulator.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod address;
pub mod credentials;
mod error;
pub mod events;
pub mod inbound;
pub mod key_directory;
pub mod mail_view;
pub mod mailbox;
pub mod outbound;
pub mod secure_data;
pub mod server;
pub mod storage;
pub mod user;

pub use address::{Recipient, extract_addresses, extract_recipients};
pub use credentials::{AuthCredentials, UserCredentials};
pub use error::{Error, Result};
pub use events::{EventChannel, ReplayableEvent};
pub use inbound::{InboundMessage, PREVIEW_LIMIT, ProcessedMeta, ProcessingEvent};
pub use key_directory::{DEBOUNCE_WINDOW, KeyDirectory};
pub use mail_view::{MailView, MailViewEvent, MailViewOptions};
pub use mailbox::{Mailbox, QUEUE_DRAIN_INTERVAL};
pub use outbound::{Draft, MissingKeys, OutboundMessage, ProcessedRecipients, SendState};
pub use secure_data::SecureData;
pub use server::{BodyStream, FinalizedMessage, MessageFlags, RawMessage, Server, SimulatedServer};
pub use storage::{MemoryStorage, Storage};
pub use user::UserMgr;
