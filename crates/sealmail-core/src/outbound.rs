//! Outbound message processing state machine.
//!
//! A compose buffer holds free-text recipient fields; `process()`
//! parses them and records per-recipient public-key coverage via the
//! debounced directory. Sending never happens inline: the message
//! enqueues itself on its mailbox's outbound queue and the mailbox
//! drains one message at a time, which keeps concurrent composes from
//! interleaving their engine work.
//!
//! Terminal states are `Sent` and `Error`; after an error `can_send`
//! becomes true again so the caller may retry.

use std::sync::{Arc, Mutex};

use sealmail_engine::Gpg;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::address::{Recipient, extract_recipients};
use crate::error::{Error, Result};
use crate::key_directory::KeyDirectory;
use crate::mailbox::Mailbox;
use crate::server::{FinalizedMessage, MessageFlags};

/// Send state of an outbound message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SendState {
    /// Editable; not yet in flight.
    #[default]
    Ready,
    /// Recipient parsing / key lookup in progress.
    Processing,
    /// Producing a detached signature.
    Signing,
    /// Encrypting the body.
    Encrypting,
    /// Handing the finalized message to the transport.
    Sending,
    /// Accepted by the transport; terminal.
    Sent,
    /// Failed with the attached cause; terminal, but retryable.
    Error(String),
}

/// Raw user-entered fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Draft {
    /// To field, free text.
    pub to: String,
    /// CC field, free text.
    pub cc: String,
    /// BCC field, free text.
    pub bcc: String,
    /// Subject line.
    pub subject: String,
    /// Body text.
    pub body: String,
}

/// Parsed recipients per field.
#[derive(Debug, Clone, Default)]
pub struct ProcessedRecipients {
    /// To recipients.
    pub to: Vec<Recipient>,
    /// CC recipients.
    pub cc: Vec<Recipient>,
    /// BCC recipients.
    pub bcc: Vec<Recipient>,
}

/// Addresses lacking a public key, per field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MissingKeys {
    /// Missing in To.
    pub to: Vec<String>,
    /// Missing in CC.
    pub cc: Vec<String>,
    /// Missing in BCC.
    pub bcc: Vec<String>,
}

impl MissingKeys {
    /// Total number of uncovered addresses across all fields.
    #[must_use]
    pub fn total(&self) -> usize {
        self.to.len() + self.cc.len() + self.bcc.len()
    }

    /// `true` if every recipient has a key.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

struct OutboundInner {
    raw: Mutex<Draft>,
    processed: Mutex<ProcessedRecipients>,
    missing: Mutex<MissingKeys>,
    state: watch::Sender<SendState>,
    gpg: Arc<Gpg>,
    directory: Arc<KeyDirectory>,
}

/// An outbound message. Created per compose action; after a terminal
/// `Sent` the caller constructs a new instance to send again.
#[derive(Clone)]
pub struct OutboundMessage {
    inner: Arc<OutboundInner>,
}

impl OutboundMessage {
    /// Creates an empty compose buffer.
    #[must_use]
    pub fn new(gpg: Arc<Gpg>, directory: Arc<KeyDirectory>) -> Self {
        let (state, _) = watch::channel(SendState::Ready);
        debug!("outbound message created");
        Self {
            inner: Arc::new(OutboundInner {
                raw: Mutex::new(Draft::default()),
                processed: Mutex::new(ProcessedRecipients::default()),
                missing: Mutex::new(MissingKeys::default()),
                state,
                gpg,
                directory,
            }),
        }
    }

    /// Replaces the draft fields.
    pub fn set_draft(&self, draft: Draft) {
        if let Ok(mut raw) = self.inner.raw.lock() {
            *raw = draft;
        }
    }

    /// Current draft fields.
    #[must_use]
    pub fn draft(&self) -> Draft {
        self.inner.raw.lock().map(|raw| raw.clone()).unwrap_or_default()
    }

    /// Current send state.
    #[must_use]
    pub fn state(&self) -> SendState {
        self.inner.state.borrow().clone()
    }

    /// Watches send-state transitions.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SendState> {
        self.inner.state.subscribe()
    }

    /// Parsed recipients from the last `process()`.
    #[must_use]
    pub fn processed(&self) -> ProcessedRecipients {
        self.inner
            .processed
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    /// Missing-key aggregation from the last `process()`.
    #[must_use]
    pub fn missing_keys(&self) -> MissingKeys {
        self.inner
            .missing
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    /// Parses the recipient fields and records public-key coverage.
    ///
    /// Repeated calls within the debounce window share one engine
    /// invocation.
    ///
    /// # Errors
    ///
    /// Returns an error if the key directory lookup fails.
    pub async fn process(&self) -> Result<()> {
        let keys = self.inner.directory.keys().await?;
        let draft = self.draft();

        let mut processed = ProcessedRecipients::default();
        let mut missing = MissingKeys::default();

        for (text, parsed, absent) in [
            (&draft.to, &mut processed.to, &mut missing.to),
            (&draft.cc, &mut processed.cc, &mut missing.cc),
            (&draft.bcc, &mut processed.bcc, &mut missing.bcc),
        ] {
            let mut recipients = extract_recipients(text);
            for recipient in &mut recipients {
                recipient.have_public_key =
                    keys.iter().any(|key| key.has_identity_for(&recipient.email));
                if !recipient.have_public_key {
                    absent.push(recipient.email.clone());
                }
            }
            *parsed = recipients;
        }

        if let Ok(mut slot) = self.inner.processed.lock() {
            *slot = processed;
        }
        if let Ok(mut slot) = self.inner.missing.lock() {
            *slot = missing;
        }
        Ok(())
    }

    /// True only when there is at least one To recipient and no missing
    /// keys anywhere. Reflects the last `process()` run.
    #[must_use]
    pub fn can_encrypt(&self) -> bool {
        let has_to = self
            .inner
            .processed
            .lock()
            .map_or(false, |p| !p.to.is_empty());
        has_to && self.missing_keys().is_empty()
    }

    /// True only when there is at least one To recipient and the message
    /// is not already in flight.
    #[must_use]
    pub fn can_send(&self) -> bool {
        let has_to = !extract_recipients(&self.draft().to).is_empty();
        has_to && matches!(self.state(), SendState::Ready | SendState::Error(_))
    }

    /// Enqueues this message on the mailbox's outbound queue. The actual
    /// send happens when the mailbox drains the queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the message is not currently sendable.
    pub fn send(&self, mailbox: &Mailbox) -> Result<()> {
        if !self.can_send() {
            return Err(Error::InvalidState(format!(
                "message not sendable in state {:?}",
                self.state()
            )));
        }
        // In flight from the caller's point of view as soon as it is
        // queued.
        self.set_state(SendState::Processing);
        mailbox.enqueue_outbound(self.clone());
        Ok(())
    }

    /// The internal send routine, invoked by the mailbox queue drain.
    pub(crate) async fn send_via(&self, mailbox: &Mailbox) {
        self.set_state(SendState::Processing);

        if let Err(e) = self.process().await {
            self.fail(&e.to_string());
            return;
        }

        let draft = self.draft();
        let processed = self.processed();
        let missing = self.missing_keys();

        let to: Vec<String> = processed.to.iter().map(|r| r.email.clone()).collect();
        let cc: Vec<String> = processed.cc.iter().map(|r| r.email.clone()).collect();
        let bcc: Vec<String> = processed.bcc.iter().map(|r| r.email.clone()).collect();
        if to.is_empty() {
            self.fail("no recipients");
            return;
        }

        // Every recipient covered: encrypt for the deduplicated union.
        // Otherwise fall back to signing the plaintext.
        let (body, sig) = if missing.is_empty() {
            self.set_state(SendState::Encrypting);
            let mut union: Vec<String> = Vec::new();
            for addr in to.iter().chain(&cc).chain(&bcc) {
                if !union.contains(addr) {
                    union.push(addr.clone());
                }
            }
            match self.inner.gpg.encrypt(&draft.body, &union).await {
                Ok(armor) => (armor, None),
                Err(e) => {
                    self.fail(&format!("encryption failed: {e}"));
                    return;
                }
            }
        } else {
            self.set_state(SendState::Signing);
            match self.inner.gpg.sign(&draft.body).await {
                Ok(signature) => (draft.body.clone(), Some(signature)),
                Err(e) => {
                    self.fail(&format!("signing failed: {e}"));
                    return;
                }
            }
        };

        self.set_state(SendState::Sending);
        let finalized = FinalizedMessage {
            from: mailbox.user_id().to_string(),
            to,
            cc,
            bcc,
            subject: draft.subject,
            body,
            sig,
            flags: MessageFlags {
                read: true,
                outbound: true,
            },
        };

        match mailbox.deliver(finalized).await {
            Ok(()) => {
                info!("outbound message sent");
                self.set_state(SendState::Sent);
            }
            Err(e) => self.fail(&e.to_string()),
        }
    }

    fn fail(&self, cause: &str) {
        warn!(cause, "outbound send failed");
        self.set_state(SendState::Error(cause.to_string()));
    }

    fn set_state(&self, state: SendState) {
        self.inner.state.send_replace(state);
    }
}

impl std::fmt::Debug for OutboundMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundMessage")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
