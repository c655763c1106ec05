//! Observable state transitions with milestone replay.
//!
//! Message state machines are event sources: each transition is pushed
//! to every attached observer. Observers may attach at any time — list
//! views and detail views come and go independently — so a whitelisted
//! subset of milestone events is recorded and replayed, in order, to
//! late subscribers. Transient progress events are not replayed.

use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::trace;

/// An event that knows whether it is a replayable milestone.
pub trait ReplayableEvent: Clone + Send + 'static {
    /// Milestone events are recorded and replayed to late subscribers.
    fn is_milestone(&self) -> bool;
}

struct EventInner<E> {
    observers: Vec<mpsc::UnboundedSender<E>>,
    recorded: Vec<E>,
}

/// An observer list keyed by event kind, with milestone replay.
pub struct EventChannel<E> {
    inner: Mutex<EventInner<E>>,
}

impl<E> Default for EventChannel<E> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(EventInner {
                observers: Vec::new(),
                recorded: Vec::new(),
            }),
        }
    }
}

impl<E: ReplayableEvent> EventChannel<E> {
    /// Creates an empty channel.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a new observer. Previously recorded milestone events are
    /// replayed into the returned receiver before anything new arrives.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut inner) = self.inner.lock() {
            for event in &inner.recorded {
                let _ = tx.send(event.clone());
            }
            inner.observers.push(tx);
        }
        rx
    }

    /// Emits an event to all live observers, recording it first if it is
    /// a milestone. Observers whose receivers are gone are pruned.
    pub fn emit(&self, event: E) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if event.is_milestone() {
            inner.recorded.push(event.clone());
        }
        inner
            .observers
            .retain(|observer| observer.send(event.clone()).is_ok());
        trace!(observers = inner.observers.len(), "event emitted");
    }

    /// Number of currently attached observers.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.inner.lock().map_or(0, |inner| inner.observers.len())
    }
}

impl<E> std::fmt::Debug for EventChannel<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventChannel").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum TestEvent {
        Milestone(u32),
        Transient(u32),
    }

    impl ReplayableEvent for TestEvent {
        fn is_milestone(&self) -> bool {
            matches!(self, Self::Milestone(_))
        }
    }

    #[tokio::test]
    async fn test_live_observer_sees_everything() {
        let channel = EventChannel::new();
        let mut rx = channel.subscribe();

        channel.emit(TestEvent::Transient(1));
        channel.emit(TestEvent::Milestone(2));

        assert_eq!(rx.recv().await.unwrap(), TestEvent::Transient(1));
        assert_eq!(rx.recv().await.unwrap(), TestEvent::Milestone(2));
    }

    #[tokio::test]
    async fn test_late_observer_gets_milestones_only() {
        let channel = EventChannel::new();
        channel.emit(TestEvent::Transient(1));
        channel.emit(TestEvent::Milestone(2));
        channel.emit(TestEvent::Transient(3));
        channel.emit(TestEvent::Milestone(4));

        let mut rx = channel.subscribe();
        assert_eq!(rx.recv().await.unwrap(), TestEvent::Milestone(2));
        assert_eq!(rx.recv().await.unwrap(), TestEvent::Milestone(4));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dropped_observers_are_pruned() {
        let channel = EventChannel::new();
        let rx = channel.subscribe();
        drop(rx);
        channel.emit(TestEvent::Milestone(1));
        assert_eq!(channel.observer_count(), 0);
    }
}
