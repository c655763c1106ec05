//! Inbound message processing state machine.
//!
//! Each message walks the same path: envelope fields are copied over,
//! the body streams in while a preview is frozen at the 1 KB threshold,
//! the public-key directory is consulted once the preview is available,
//! and when both key coverage and the full body are known the message is
//! verified or decrypted. Every transition is published through a
//! replayable event channel so list views and detail views can attach
//! at any point and still see the milestones.
//!
//! `process()` is idempotent: a second call after completion does not
//! re-download the body or touch the engine again.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use sealmail_engine::{Gpg, is_encrypted};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::address::extract_addresses;
use crate::error::Result;
use crate::events::{EventChannel, ReplayableEvent};
use crate::key_directory::KeyDirectory;
use crate::server::{MessageFlags, RawMessage};

/// Preview size threshold in bytes.
pub const PREVIEW_LIMIT: usize = 1024;

/// A processing state transition, with its payload where one applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingEvent {
    /// Processing has started.
    Processing,
    /// Envelope fields copied into the processed view.
    LoadedMeta,
    /// Body download progress (running byte count).
    LoadingBody(usize),
    /// The preview is frozen and available.
    LoadedPreview,
    /// The full body has arrived (final byte count).
    LoadedBody(usize),
    /// Signature verification is running.
    Verifying,
    /// Decryption is running.
    Decrypting,
    /// All applicable crypto work is finished.
    DoneCrypto,
    /// Processing failed; terminal.
    Error(String),
}

impl ReplayableEvent for ProcessingEvent {
    fn is_milestone(&self) -> bool {
        matches!(
            self,
            Self::LoadedMeta
                | Self::LoadedPreview
                | Self::LoadedBody(_)
                | Self::DoneCrypto
                | Self::Error(_)
        )
    }
}

/// Envelope fields after processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedMeta {
    /// Message date.
    pub date: DateTime<Utc>,
    /// Sender as given by the server.
    pub from: String,
    /// Sender's bare email address, if one could be parsed.
    pub from_email: Option<String>,
    /// Recipients.
    pub to: Vec<String>,
    /// CC recipients.
    pub cc: Vec<String>,
    /// BCC recipients.
    pub bcc: Vec<String>,
    /// Subject line.
    pub subject: String,
}

/// What the crypto stage decided to do, once key coverage is known.
#[derive(Debug, Clone, Copy)]
struct CryptoPlan {
    can_verify_or_decrypt: bool,
    needs_verification: bool,
    needs_decryption: bool,
}

#[derive(Default)]
struct ProcessState {
    started: bool,
    done: bool,
    meta: Option<ProcessedMeta>,
    preview: String,
    preview_frozen: bool,
    raw_body: Vec<u8>,
    body_loaded: bool,
    good_signature: Option<bool>,
    decrypted_body: Option<String>,
    decrypt_failed: bool,
}

struct Inner {
    id: String,
    raw_date: DateTime<Utc>,
    raw_from: String,
    raw_to: Vec<String>,
    raw_cc: Vec<String>,
    raw_bcc: Vec<String>,
    raw_subject: String,
    sig: Option<String>,
    flags: MessageFlags,
    body: Mutex<Option<crate::server::BodyStream>>,
    state: Mutex<ProcessState>,
    events: EventChannel<ProcessingEvent>,
    gpg: Arc<Gpg>,
    directory: Arc<KeyDirectory>,
}

/// An inbound message and its processing progress.
///
/// Cheap to clone; clones share state, so a cached message keeps its
/// progress across repeated view requests.
#[derive(Clone)]
pub struct InboundMessage {
    inner: Arc<Inner>,
}

impl InboundMessage {
    /// Wraps a raw server message.
    #[must_use]
    pub fn new(raw: RawMessage, gpg: Arc<Gpg>, directory: Arc<KeyDirectory>) -> Self {
        debug!(id = %raw.id, "inbound message created");
        Self {
            inner: Arc::new(Inner {
                id: raw.id,
                raw_date: raw.date,
                raw_from: raw.from,
                raw_to: raw.to,
                raw_cc: raw.cc,
                raw_bcc: raw.bcc,
                raw_subject: raw.subject,
                sig: raw.sig,
                flags: raw.flags,
                body: Mutex::new(Some(raw.body)),
                state: Mutex::new(ProcessState::default()),
                events: EventChannel::new(),
                gpg,
                directory,
            }),
        }
    }

    /// Unique message id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Whether the message has been read.
    #[must_use]
    pub fn has_been_read(&self) -> bool {
        self.inner.flags.read
    }

    /// Whether this is an outbound message.
    #[must_use]
    pub fn is_outbound(&self) -> bool {
        self.inner.flags.outbound
    }

    /// Attaches an observer. Milestone events that already happened are
    /// replayed first.
    #[must_use]
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ProcessingEvent> {
        self.inner.events.subscribe()
    }

    /// Processed envelope fields, once `LoadedMeta` has fired.
    #[must_use]
    pub fn meta(&self) -> Option<ProcessedMeta> {
        self.lock_state(|st| st.meta.clone())
    }

    /// The frozen preview text, once `LoadedPreview` has fired.
    #[must_use]
    pub fn preview(&self) -> Option<String> {
        self.lock_state(|st| st.preview_frozen.then(|| st.preview.clone()))
    }

    /// The full raw body, once `LoadedBody` has fired.
    #[must_use]
    pub fn raw_body(&self) -> Option<String> {
        self.lock_state(|st| {
            st.body_loaded
                .then(|| String::from_utf8_lossy(&st.raw_body).into_owned())
        })
    }

    /// The decrypted body, if decryption ran and succeeded.
    #[must_use]
    pub fn decrypted_body(&self) -> Option<String> {
        self.lock_state(|st| st.decrypted_body.clone())
    }

    /// Signature verification result, if verification ran.
    #[must_use]
    pub fn good_signature(&self) -> Option<bool> {
        self.lock_state(|st| st.good_signature)
    }

    /// Whether decryption was attempted and failed.
    #[must_use]
    pub fn decrypt_failed(&self) -> bool {
        self.lock_state(|st| st.decrypt_failed)
    }

    /// Whether processing has reached its terminal state.
    #[must_use]
    pub fn is_processed(&self) -> bool {
        self.lock_state(|st| st.done)
    }

    /// Drives the message through its processing stages. Calling this
    /// again once started is a no-op; partially completed stages are
    /// never redone.
    pub fn process(&self) {
        let already_started = self.lock_state(|st| {
            let started = st.started;
            st.started = true;
            started
        });
        if already_started {
            debug!(id = %self.inner.id, "process() is a no-op: already started");
            return;
        }

        let msg = self.clone();
        tokio::spawn(async move { msg.drive().await });
    }

    async fn drive(self) {
        self.emit(ProcessingEvent::Processing);

        // Stage 1: envelope fields.
        self.lock_state(|st| {
            if st.meta.is_none() {
                st.meta = Some(ProcessedMeta {
                    date: self.inner.raw_date,
                    from: self.inner.raw_from.clone(),
                    from_email: extract_addresses(&self.inner.raw_from).pop(),
                    to: self.inner.raw_to.clone(),
                    cc: self.inner.raw_cc.clone(),
                    bcc: self.inner.raw_bcc.clone(),
                    subject: self.inner.raw_subject.clone(),
                });
            }
        });
        self.emit(ProcessingEvent::LoadedMeta);

        // Stage 2: stream the body; the key lookup kicks off as soon as
        // the preview is available.
        let stream = self.inner.body.lock().ok().and_then(|mut b| b.take());
        let Some(mut stream) = stream else {
            self.fail("body stream unavailable");
            return;
        };

        let mut lookup: Option<tokio::task::JoinHandle<Result<CryptoPlan>>> = None;

        while let Some(chunk) = stream.recv().await {
            match chunk {
                Ok(bytes) => {
                    let (total, frozen_now) = self.lock_state(|st| {
                        st.raw_body.extend_from_slice(&bytes);
                        let frozen_now = if !st.preview_frozen && st.raw_body.len() >= PREVIEW_LIMIT
                        {
                            st.preview =
                                String::from_utf8_lossy(&st.raw_body[..PREVIEW_LIMIT]).into_owned();
                            st.preview_frozen = true;
                            true
                        } else {
                            false
                        };
                        (st.raw_body.len(), frozen_now)
                    });

                    self.emit(ProcessingEvent::LoadingBody(total));
                    if frozen_now {
                        self.emit(ProcessingEvent::LoadedPreview);
                        lookup = Some(self.spawn_lookup());
                    }
                }
                Err(e) => {
                    self.fail(&e);
                    return;
                }
            }
        }

        // End of stream. Short bodies freeze their preview here.
        let (total, frozen_now) = self.lock_state(|st| {
            let frozen_now = if st.preview_frozen {
                false
            } else {
                st.preview = String::from_utf8_lossy(&st.raw_body).into_owned();
                st.preview_frozen = true;
                true
            };
            st.body_loaded = true;
            (st.raw_body.len(), frozen_now)
        });
        if frozen_now {
            self.emit(ProcessingEvent::LoadedPreview);
        }
        self.emit(ProcessingEvent::LoadedBody(total));

        let lookup = lookup.unwrap_or_else(|| self.spawn_lookup());

        // Stage 3/4: wait for key coverage, then do the crypto work.
        match lookup.await {
            Ok(Ok(plan)) => self.finish_crypto(plan).await,
            Ok(Err(e)) => self.fail(&e.to_string()),
            Err(e) => self.fail(&format!("key lookup task failed: {e}")),
        }
    }

    /// Queries the debounced key directory and decides what crypto work
    /// applies to this message.
    fn spawn_lookup(&self) -> tokio::task::JoinHandle<Result<CryptoPlan>> {
        let msg = self.clone();
        tokio::spawn(async move {
            let keys = msg.inner.directory.keys().await?;
            let (preview, sender) = msg.lock_state(|st| {
                (
                    st.preview.clone(),
                    st.meta.as_ref().and_then(|m| m.from_email.clone()),
                )
            });

            let have_key =
                sender.is_some_and(|email| keys.iter().any(|key| key.has_identity_for(&email)));
            let needs_verification = msg.inner.sig.is_some();
            let needs_decryption = is_encrypted(&preview);

            Ok(CryptoPlan {
                // Verification needs the sender's public key; decryption
                // only needs our own secret key.
                can_verify_or_decrypt: !needs_verification || have_key,
                needs_verification,
                needs_decryption,
            })
        })
    }

    async fn finish_crypto(&self, plan: CryptoPlan) {
        if !plan.can_verify_or_decrypt || (!plan.needs_verification && !plan.needs_decryption) {
            self.finish();
            return;
        }

        let body = self.lock_state(|st| String::from_utf8_lossy(&st.raw_body).into_owned());

        if plan.needs_verification {
            self.emit(ProcessingEvent::Verifying);
            let sig = self.inner.sig.clone().unwrap_or_default();
            match self.inner.gpg.verify(&body, &sig).await {
                Ok(good) => {
                    self.lock_state(|st| st.good_signature = Some(good));
                }
                Err(e) => {
                    self.fail(&format!("verification failure: {e}"));
                    return;
                }
            }
        } else if plan.needs_decryption {
            self.emit(ProcessingEvent::Decrypting);
            match self.inner.gpg.decrypt(&body).await {
                Ok(plain) => {
                    self.lock_state(|st| st.decrypted_body = Some(plain));
                }
                Err(e) => {
                    // A missing key or corrupt armor is a per-message
                    // condition, not a pipeline failure.
                    warn!(id = %self.inner.id, error = %e, "decryption failed");
                    self.lock_state(|st| st.decrypt_failed = true);
                }
            }
        }

        self.finish();
    }

    fn finish(&self) {
        self.lock_state(|st| st.done = true);
        self.emit(ProcessingEvent::DoneCrypto);
    }

    fn fail(&self, message: &str) {
        warn!(id = %self.inner.id, message, "inbound processing failed");
        self.lock_state(|st| st.done = true);
        self.emit(ProcessingEvent::Error(message.to_string()));
    }

    fn emit(&self, event: ProcessingEvent) {
        self.inner.events.emit(event);
    }

    fn lock_state<T>(&self, f: impl FnOnce(&mut ProcessState) -> T) -> T {
        let mut guard = match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

impl std::fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundMessage")
            .field("id", &self.inner.id)
            .field("processed", &self.is_processed())
            .finish_non_exhaustive()
    }
}
