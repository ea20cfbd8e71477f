//! Shutdown signal shared between a pipe and its consumer workers.
//!
//! A `ShutdownSignal` can be cloned freely. Tripping any clone is observed by
//! all of them, both by polling `is_triggered()` between reads and by awaiting
//! `triggered()` inside a `select!`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct SignalState {
    triggered: AtomicBool,
    notify: Notify,
}

/// One-way shutdown flag with async wakeup.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    state: Arc<SignalState>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the signal. Returns `true` only for the call that tripped it, so
    /// teardown that hangs off the signal runs exactly once.
    pub fn trigger(&self) -> bool {
        let first = !self.state.triggered.swap(true, Ordering::SeqCst);
        if first {
            self.state.notify.notify_waiters();
        }
        first
    }

    pub fn is_triggered(&self) -> bool {
        self.state.triggered.load(Ordering::SeqCst)
    }

    /// Resolve once the signal has been tripped.
    pub async fn triggered(&self) {
        loop {
            let notified = self.state.notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a trigger in between is not lost.
            notified.as_mut().enable();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}
