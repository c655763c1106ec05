//! Polling view over a mailbox.
//!
//! A view periodically fetches the current page of messages and pushes
//! them (plus the folder count) to its consumer, so the UI sees new
//! mail "arrive" without asking. Changing the page or page size
//! triggers an immediate refresh. Destroying the view stops the timer;
//! an in-flight fetch is not cancelled — its results are discarded when
//! nobody is listening anymore.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Notify, mpsc, watch};
use tracing::{debug, warn};

use crate::inbound::InboundMessage;
use crate::mailbox::Mailbox;

/// Default delay between message fetches.
pub const DEFAULT_FETCH_INTERVAL: Duration = Duration::from_secs(60);

/// View configuration.
#[derive(Debug, Clone)]
pub struct MailViewOptions {
    /// Messages per page.
    pub per_page: usize,
    /// Page to show (1-based).
    pub page: usize,
    /// Delay between fetches.
    pub interval: Duration,
}

impl Default for MailViewOptions {
    fn default() -> Self {
        Self {
            per_page: 10,
            page: 1,
            interval: DEFAULT_FETCH_INTERVAL,
        }
    }
}

/// What a view pushes to its consumer.
#[derive(Debug, Clone)]
pub enum MailViewEvent {
    /// The messages currently in view.
    Messages(Vec<InboundMessage>),
    /// Total messages in the folder.
    Count(usize),
}

struct ViewConfig {
    per_page: usize,
    page: usize,
}

struct ViewInner {
    mailbox: Mailbox,
    config: Mutex<ViewConfig>,
    refresh: Notify,
    shutdown: watch::Sender<bool>,
    events: Mutex<Option<mpsc::UnboundedReceiver<MailViewEvent>>>,
}

/// A live view of a mailbox's contents.
#[derive(Clone)]
pub struct MailView {
    inner: Arc<ViewInner>,
}

impl MailView {
    /// Creates a view and starts its polling loop.
    #[must_use]
    pub fn new(mailbox: Mailbox, options: MailViewOptions) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (tx, rx) = mpsc::unbounded_channel();

        let view = Self {
            inner: Arc::new(ViewInner {
                mailbox,
                config: Mutex::new(ViewConfig {
                    per_page: options.per_page.max(1),
                    page: options.page.max(1),
                }),
                refresh: Notify::new(),
                shutdown,
                events: Mutex::new(Some(rx)),
            }),
        };

        tokio::spawn(poll_loop(view.clone(), tx, shutdown_rx, options.interval));
        view
    }

    /// Takes the event stream. Yields `None` after the first call.
    #[must_use]
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<MailViewEvent>> {
        self.inner.events.lock().ok().and_then(|mut slot| slot.take())
    }

    /// Jumps to another page and refreshes immediately.
    pub fn set_page(&self, page: usize) {
        if let Ok(mut config) = self.inner.config.lock() {
            config.page = page.max(1);
        }
        self.inner.refresh.notify_one();
    }

    /// Changes the page size and refreshes immediately.
    pub fn set_per_page(&self, per_page: usize) {
        if let Ok(mut config) = self.inner.config.lock() {
            config.per_page = per_page.max(1);
        }
        self.inner.refresh.notify_one();
    }

    /// Stops the recurring timer. Fetches already in flight run to
    /// completion and their results are dropped.
    pub fn destroy(&self) {
        let _ = self.inner.shutdown.send(true);
    }
}

impl std::fmt::Debug for MailView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailView").finish_non_exhaustive()
    }
}

async fn poll_loop(
    view: MailView,
    tx: mpsc::UnboundedSender<MailViewEvent>,
    mut shutdown: watch::Receiver<bool>,
    interval: Duration,
) {
    loop {
        let (page, per_page) = view
            .inner
            .config
            .lock()
            .map_or((1, 10), |c| (c.page, c.per_page));
        let start = (page - 1) * per_page;
        debug!(start, per_page, "mail view refresh");

        match view.inner.mailbox.get_messages(start, per_page).await {
            Ok(messages) => {
                // Consumer may be gone; results are simply discarded
                // until the view is destroyed.
                let _ = tx.send(MailViewEvent::Messages(messages));
                match view.inner.mailbox.get_count().await {
                    Ok(count) => {
                        let _ = tx.send(MailViewEvent::Count(count));
                    }
                    Err(e) => warn!(error = %e, "count fetch failed"),
                }
            }
            Err(e) => warn!(error = %e, "message fetch failed"),
        }

        tokio::select! {
            () = tokio::time::sleep(interval) => {}
            () = view.inner.refresh.notified() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
