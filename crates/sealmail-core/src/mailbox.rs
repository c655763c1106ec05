//! Per-user mailbox: message cache and outbound queue.
//!
//! Messages are cached by id so repeated view requests reuse the same
//! [`InboundMessage`] instance and its processing progress. Outbound
//! sends go through a FIFO queue drained on a fixed-period timer, one
//! message at a time — the engine executes one command at a time anyway,
//! and this keeps concurrent composes from interleaving.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sealmail_engine::Gpg;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::Result;
use crate::inbound::InboundMessage;
use crate::key_directory::KeyDirectory;
use crate::outbound::OutboundMessage;
use crate::server::{FinalizedMessage, Server};

/// How often the outbound queue is drained.
pub const QUEUE_DRAIN_INTERVAL: Duration = Duration::from_millis(100);

struct MailboxInner {
    user_id: String,
    folder: Mutex<String>,
    server: Arc<dyn Server>,
    gpg: Arc<Gpg>,
    directory: Arc<KeyDirectory>,
    cache: Mutex<HashMap<String, InboundMessage>>,
    queue: Mutex<VecDeque<OutboundMessage>>,
    shutdown: watch::Sender<bool>,
}

/// A user's mailbox.
#[derive(Clone)]
pub struct Mailbox {
    inner: Arc<MailboxInner>,
}

impl Mailbox {
    /// Opens a mailbox for `user_id` with the default queue drain
    /// period. The initial folder is always the inbox.
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        server: Arc<dyn Server>,
        gpg: Arc<Gpg>,
        directory: Arc<KeyDirectory>,
    ) -> Self {
        Self::with_drain_interval(user_id, server, gpg, directory, QUEUE_DRAIN_INTERVAL)
    }

    /// Opens a mailbox with a custom queue drain period (tests).
    #[must_use]
    pub fn with_drain_interval(
        user_id: impl Into<String>,
        server: Arc<dyn Server>,
        gpg: Arc<Gpg>,
        directory: Arc<KeyDirectory>,
        drain_interval: Duration,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mailbox = Self {
            inner: Arc::new(MailboxInner {
                user_id: user_id.into(),
                folder: Mutex::new("inbox".to_string()),
                server,
                gpg,
                directory,
                cache: Mutex::new(HashMap::new()),
                queue: Mutex::new(VecDeque::new()),
                shutdown,
            }),
        };

        tokio::spawn(drain_queue(mailbox.clone(), shutdown_rx, drain_interval));
        mailbox
    }

    /// The owning user id.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    /// Current folder.
    #[must_use]
    pub fn folder(&self) -> String {
        self.inner
            .folder
            .lock()
            .map(|f| f.clone())
            .unwrap_or_else(|_| "inbox".to_string())
    }

    /// Switches folders.
    pub fn set_folder(&self, folder: impl Into<String>) {
        if let Ok(mut slot) = self.inner.folder.lock() {
            *slot = folder.into();
        }
    }

    /// Adds a message to the outbound queue. This is the only way
    /// outbound messages get sent.
    pub fn enqueue_outbound(&self, msg: OutboundMessage) {
        debug!(user = %self.inner.user_id, "outbound message enqueued");
        if let Ok(mut queue) = self.inner.queue.lock() {
            queue.push_back(msg);
        }
    }

    /// Number of messages waiting in the outbound queue.
    #[must_use]
    pub fn outbound_queue_len(&self) -> usize {
        self.inner.queue.lock().map_or(0, |q| q.len())
    }

    /// Fetches messages from the current folder, reusing cached
    /// instances (and their processing progress) by message id.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails.
    pub async fn get_messages(&self, from: usize, count: usize) -> Result<Vec<InboundMessage>> {
        let folder = self.folder();
        let raw = self
            .inner
            .server
            .get_messages(&self.inner.user_id, &folder, from, count)
            .await?;

        let mut messages = Vec::with_capacity(raw.len());
        for msg in raw {
            let cached = self
                .inner
                .cache
                .lock()
                .ok()
                .and_then(|cache| cache.get(&msg.id).cloned());
            match cached {
                Some(existing) => messages.push(existing),
                None => {
                    let wrapped = InboundMessage::new(
                        msg,
                        Arc::clone(&self.inner.gpg),
                        Arc::clone(&self.inner.directory),
                    );
                    if let Ok(mut cache) = self.inner.cache.lock() {
                        cache.insert(wrapped.id().to_string(), wrapped.clone());
                    }
                    messages.push(wrapped);
                }
            }
        }
        Ok(messages)
    }

    /// Lists the user's folders.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails.
    pub async fn get_folders(&self) -> Result<Vec<String>> {
        self.inner.server.get_folders(&self.inner.user_id).await
    }

    /// Total number of messages in the current folder.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails.
    pub async fn get_count(&self) -> Result<usize> {
        self.inner
            .server
            .get_message_count(&self.inner.user_id, &self.folder())
            .await
    }

    /// Forwards a finalized message to the transport.
    pub(crate) async fn deliver(&self, msg: FinalizedMessage) -> Result<()> {
        info!(user = %self.inner.user_id, "sending message");
        self.inner.server.send(&self.inner.user_id, msg).await
    }

    /// Closes the mailbox: stops the queue drain timer. In-flight work
    /// runs to completion; its results are simply no longer observed.
    pub fn close(&self) {
        let _ = self.inner.shutdown.send(true);
    }
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("user_id", &self.inner.user_id)
            .field("folder", &self.folder())
            .finish_non_exhaustive()
    }
}

/// Queue drain loop: one outbound message per tick, sent to completion
/// before the next is dequeued.
async fn drain_queue(mailbox: Mailbox, mut shutdown: watch::Receiver<bool>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let next = mailbox
                    .inner
                    .queue
                    .lock()
                    .ok()
                    .and_then(|mut queue| queue.pop_front());
                if let Some(msg) = next {
                    debug!(user = %mailbox.inner.user_id, "processing outbound message");
                    msg.send_via(&mailbox).await;
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
