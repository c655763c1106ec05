//! Debounced front for public-key directory lookups.
//!
//! Rapid field edits and freshly arrived messages all want the key list
//! at once. Calls landing within the debounce window collapse into a
//! single `get_all_keys` engine invocation whose result is fanned out to
//! every waiter; a new call during the window pushes the deadline back,
//! the way a cancel-and-restart timer would.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use sealmail_engine::{Gpg, PgpKey};
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{Error, Result};

/// Default debounce window.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(100);

type KeyList = Arc<Vec<PgpKey>>;
type Waiter = oneshot::Sender<std::result::Result<KeyList, String>>;

#[derive(Default)]
struct DirectoryState {
    waiters: Vec<Waiter>,
    /// Bumped on every call; the timer only fires once a full window
    /// passes with no new calls.
    generation: u64,
    timer_running: bool,
}

/// Debounced, coalescing public-key directory.
pub struct KeyDirectory {
    gpg: Arc<Gpg>,
    window: Duration,
    state: Arc<Mutex<DirectoryState>>,
}

impl KeyDirectory {
    /// Creates a directory over the engine orchestrator.
    #[must_use]
    pub fn new(gpg: Arc<Gpg>) -> Self {
        Self::with_window(gpg, DEBOUNCE_WINDOW)
    }

    /// Creates a directory with a custom debounce window.
    #[must_use]
    pub fn with_window(gpg: Arc<Gpg>, window: Duration) -> Self {
        Self {
            gpg,
            window,
            state: Arc::new(Mutex::new(DirectoryState::default())),
        }
    }

    /// Fetches the key list, coalescing with any other call inside the
    /// debounce window. The list is rebuilt from the engine every time;
    /// there is no cache to invalidate.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine listing fails.
    pub async fn keys(&self) -> Result<KeyList> {
        let (tx, rx) = oneshot::channel();

        let start_timer = {
            let Ok(mut state) = self.state.lock() else {
                return Err(Error::InvalidState("key directory state poisoned".into()));
            };
            state.waiters.push(tx);
            state.generation += 1;
            if state.timer_running {
                false
            } else {
                state.timer_running = true;
                true
            }
        };

        if start_timer {
            let gpg = Arc::clone(&self.gpg);
            let state = Arc::clone(&self.state);
            let window = self.window;
            tokio::spawn(debounce_and_fetch(gpg, state, window));
        }

        match rx.await {
            Ok(Ok(keys)) => Ok(keys),
            Ok(Err(message)) => Err(Error::Engine(sealmail_engine::Error::Channel(message))),
            Err(_) => Err(Error::InvalidState("key lookup dropped".into())),
        }
    }

    /// Convenience: `true` if any known key has an identity for `email`.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine listing fails.
    pub async fn has_key_for(&self, email: &str) -> Result<bool> {
        Ok(self
            .keys()
            .await?
            .iter()
            .any(|key| key.has_identity_for(email)))
    }
}

impl std::fmt::Debug for KeyDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyDirectory")
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

/// Waits until the window passes without new calls, then performs one
/// engine fetch and distributes the result.
async fn debounce_and_fetch(gpg: Arc<Gpg>, state: Arc<Mutex<DirectoryState>>, window: Duration) {
    loop {
        let before = state.lock().map_or(0, |s| s.generation);
        tokio::time::sleep(window).await;
        let after = state.lock().map_or(0, |s| s.generation);
        if before == after {
            break;
        }
        // Another call landed inside the window: keep waiting.
    }

    // Drain waiters before fetching; calls arriving from here on start a
    // fresh debounce cycle (and a fresh engine invocation).
    let waiters: Vec<Waiter> = match state.lock() {
        Ok(mut s) => {
            s.timer_running = false;
            s.waiters.drain(..).collect()
        }
        Err(_) => return,
    };

    debug!(waiters = waiters.len(), "coalesced key directory fetch");
    let outcome = match gpg.get_all_keys().await {
        Ok(keys) => Ok(Arc::new(keys)),
        Err(e) => Err(e.to_string()),
    };

    for waiter in waiters {
        let _ = waiter.send(outcome.clone());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use sealmail_crypto::OsEntropy;
    use sealmail_engine::engine::{Engine, EngineRun};
    use sealmail_engine::vfs::VfsSnapshot;

    use super::*;

    /// Engine that counts `run` invocations and lists one key.
    struct CountingEngine(Arc<AtomicU32>);

    impl Engine for CountingEngine {
        fn run(&mut self, _args: &[String], _vfs: &mut VfsSnapshot) -> EngineRun {
            self.0.fetch_add(1, Ordering::SeqCst);
            EngineRun::ok(vec![
                "pub:u:2048:1:AABB:1388576897:::u:::scESC:".into(),
                "uid:u::::1388576897::X::Alice <alice@x.com>:".into(),
            ])
        }
    }

    fn counting_directory(window: Duration) -> (KeyDirectory, Arc<AtomicU32>) {
        let runs = Arc::new(AtomicU32::new(0));
        let runs_for_factory = Arc::clone(&runs);
        let factory = move || {
            Box::new(CountingEngine(Arc::clone(&runs_for_factory))) as Box<dyn Engine>
        };
        let gpg = Arc::new(Gpg::new(factory, Arc::new(OsEntropy)));
        (KeyDirectory::with_window(gpg, window), runs)
    }

    #[tokio::test]
    async fn test_burst_coalesces_to_one_fetch() {
        let (directory, runs) = counting_directory(Duration::from_millis(20));
        let directory = Arc::new(directory);

        let mut handles = Vec::new();
        for _ in 0..5 {
            let directory = Arc::clone(&directory);
            handles.push(tokio::spawn(async move { directory.keys().await }));
        }
        for handle in handles {
            let keys = handle.await.unwrap().unwrap();
            assert_eq!(keys.len(), 1);
        }

        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_separate_bursts_fetch_separately() {
        let (directory, runs) = counting_directory(Duration::from_millis(10));
        directory.keys().await.unwrap();
        directory.keys().await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_has_key_for() {
        let (directory, _) = counting_directory(Duration::from_millis(5));
        assert!(directory.has_key_for("alice@x.com").await.unwrap());
        assert!(!directory.has_key_for("nobody@x.com").await.unwrap());
    }
}
