//! Transport collaborator interface and its simulator.
//!
//! The mail-transport/account server is not implemented by this core;
//! we define the seam and ship a simulator that behaves like one:
//! folders per user, messages with streamed bodies, and delivery of
//! finalized outbound messages. The simulator is what the test suites
//! (and a development build of the app) run against.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// A streamed message body: chunks arrive in order, the channel closing
/// marks end-of-stream. A chunk-level error aborts the download.
pub type BodyStream = mpsc::Receiver<std::result::Result<Bytes, String>>;

/// Message flags from the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageFlags {
    /// The message has been read.
    pub read: bool,
    /// The message was sent by this account.
    pub outbound: bool,
}

/// A raw inbound message as handed over by the transport.
#[derive(Debug)]
pub struct RawMessage {
    /// Unique id within the mailbox.
    pub id: String,
    /// Message date.
    pub date: DateTime<Utc>,
    /// Sender, as free text (may include a display name).
    pub from: String,
    /// Recipient addresses.
    pub to: Vec<String>,
    /// CC addresses.
    pub cc: Vec<String>,
    /// BCC addresses.
    pub bcc: Vec<String>,
    /// Subject line.
    pub subject: String,
    /// Streamed body.
    pub body: BodyStream,
    /// Detached PGP signature, if the message carries one.
    pub sig: Option<String>,
    /// Flags.
    pub flags: MessageFlags,
}

/// A finalized outbound message: addresses reduced to bare email
/// strings, body already signed or encrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedMessage {
    /// Sender address.
    pub from: String,
    /// Recipient addresses.
    pub to: Vec<String>,
    /// CC addresses.
    pub cc: Vec<String>,
    /// BCC addresses.
    pub bcc: Vec<String>,
    /// Subject line.
    pub subject: String,
    /// Body text (ciphertext armor when encrypted).
    pub body: String,
    /// Detached signature to attach, if the message was signed.
    pub sig: Option<String>,
    /// Flags to store with the message.
    pub flags: MessageFlags,
}

/// The mail-transport/account server, as consumed by this core.
#[async_trait]
pub trait Server: Send + Sync {
    /// Sends a finalized message.
    async fn send(&self, user_id: &str, msg: FinalizedMessage) -> Result<()>;

    /// Fetches up to `count` messages of a folder starting at `from`
    /// (0 = newest).
    async fn get_messages(
        &self,
        user_id: &str,
        folder: &str,
        from: usize,
        count: usize,
    ) -> Result<Vec<RawMessage>>;

    /// Lists the user's folders.
    async fn get_folders(&self, user_id: &str) -> Result<Vec<String>>;

    /// Total number of messages in a folder.
    async fn get_message_count(&self, user_id: &str, folder: &str) -> Result<usize>;
}

/// A message at rest inside the simulator.
#[derive(Debug, Clone)]
struct StoredMessage {
    id: String,
    date: DateTime<Utc>,
    from: String,
    to: Vec<String>,
    cc: Vec<String>,
    bcc: Vec<String>,
    subject: String,
    body: String,
    sig: Option<String>,
    flags: MessageFlags,
}

/// In-memory transport simulator.
///
/// Bodies are streamed back in fixed-size chunks so that the inbound
/// pipeline's preview/loading behavior is exercised realistically.
pub struct SimulatedServer {
    folders: Mutex<HashMap<String, HashMap<String, Vec<StoredMessage>>>>,
    chunk_size: usize,
    next_id: Mutex<u64>,
}

impl Default for SimulatedServer {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedServer {
    /// Creates an empty simulator with a 256-byte body chunk size.
    #[must_use]
    pub fn new() -> Self {
        Self {
            folders: Mutex::new(HashMap::new()),
            chunk_size: 256,
            next_id: Mutex::new(1),
        }
    }

    /// Overrides the body chunk size (tests use small chunks to drive
    /// the preview threshold precisely).
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Seeds a message directly into a user's folder.
    pub fn deliver(
        &self,
        user_id: &str,
        folder: &str,
        from: &str,
        subject: &str,
        body: &str,
        sig: Option<String>,
    ) -> String {
        let id = self.fresh_id();
        let msg = StoredMessage {
            id: id.clone(),
            date: Utc::now(),
            from: from.to_string(),
            to: vec![user_id.to_string()],
            cc: Vec::new(),
            bcc: Vec::new(),
            subject: subject.to_string(),
            body: body.to_string(),
            sig,
            flags: MessageFlags::default(),
        };
        self.push(user_id, folder, msg);
        id
    }

    fn fresh_id(&self) -> String {
        let mut next = match self.next_id.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let id = format!("msg-{}", *next);
        *next += 1;
        id
    }

    fn push(&self, user_id: &str, folder: &str, msg: StoredMessage) {
        if let Ok(mut folders) = self.folders.lock() {
            folders
                .entry(user_id.to_string())
                .or_default()
                .entry(folder.to_string())
                .or_default()
                .insert(0, msg); // newest first
        }
    }

    fn stream_body(&self, body: String) -> BodyStream {
        let (tx, rx) = mpsc::channel(4);
        let chunk_size = self.chunk_size;
        tokio::spawn(async move {
            for chunk in body.into_bytes().chunks(chunk_size) {
                if tx.send(Ok(Bytes::copy_from_slice(chunk))).await.is_err() {
                    return;
                }
            }
        });
        rx
    }
}

impl std::fmt::Debug for SimulatedServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedServer")
            .field("chunk_size", &self.chunk_size)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Server for SimulatedServer {
    async fn send(&self, user_id: &str, msg: FinalizedMessage) -> Result<()> {
        let stored = StoredMessage {
            id: self.fresh_id(),
            date: Utc::now(),
            from: msg.from.clone(),
            to: msg.to.clone(),
            cc: msg.cc.clone(),
            bcc: msg.bcc.clone(),
            subject: msg.subject.clone(),
            body: msg.body.clone(),
            sig: msg.sig.clone(),
            flags: msg.flags,
        };

        // Sender keeps a copy; each recipient gets a delivery.
        self.push(user_id, "sent", stored.clone());
        for recipient in msg.to.iter().chain(&msg.cc).chain(&msg.bcc) {
            let mut delivered = stored.clone();
            delivered.id = self.fresh_id();
            delivered.flags = MessageFlags::default();
            self.push(recipient, "inbox", delivered);
        }
        Ok(())
    }

    async fn get_messages(
        &self,
        user_id: &str,
        folder: &str,
        from: usize,
        count: usize,
    ) -> Result<Vec<RawMessage>> {
        let stored: Vec<StoredMessage> = self
            .folders
            .lock()
            .map_err(|_| Error::Transport("simulator state poisoned".into()))?
            .get(user_id)
            .and_then(|folders| folders.get(folder))
            .map(|msgs| msgs.iter().skip(from).take(count).cloned().collect())
            .unwrap_or_default();

        Ok(stored
            .into_iter()
            .map(|msg| RawMessage {
                id: msg.id,
                date: msg.date,
                from: msg.from,
                to: msg.to,
                cc: msg.cc,
                bcc: msg.bcc,
                subject: msg.subject,
                body: self.stream_body(msg.body),
                sig: msg.sig,
                flags: msg.flags,
            })
            .collect())
    }

    async fn get_folders(&self, user_id: &str) -> Result<Vec<String>> {
        Ok(self
            .folders
            .lock()
            .map_err(|_| Error::Transport("simulator state poisoned".into()))?
            .get(user_id)
            .map(|folders| folders.keys().cloned().collect())
            .unwrap_or_else(|| vec!["inbox".to_string()]))
    }

    async fn get_message_count(&self, user_id: &str, folder: &str) -> Result<usize> {
        Ok(self
            .folders
            .lock()
            .map_err(|_| Error::Transport("simulator state poisoned".into()))?
            .get(user_id)
            .and_then(|folders| folders.get(folder))
            .map_or(0, Vec::len))
    }
}
