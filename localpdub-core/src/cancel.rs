//! Cooperative cancellation for discovery and sync sessions.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Cancellation token shared between a session and its background threads.
///
/// Background loops call [`CancelToken::wait`] instead of sleeping so
/// that `stop()` interrupts them immediately; socket loops combine the
/// token with short read timeouts so blocked syscalls return promptly.
///
/// Cancellation is one-way and idempotent: once cancelled, a token
/// stays cancelled.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

struct Inner {
    cancelled: Mutex<bool>,
    condvar: Condvar,
}

impl CancelToken {
    /// Creates a new, un-cancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: Mutex::new(false),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Cancels the token, waking every thread blocked in [`wait`].
    ///
    /// [`wait`]: CancelToken::wait
    pub fn cancel(&self) {
        let mut cancelled = self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *cancelled = true;
        self.inner.condvar.notify_all();
    }

    /// Returns true once the token has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Blocks for up to `timeout`, returning early if cancelled.
    ///
    /// Returns true when the token was cancelled, false on timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        let cancelled = self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if *cancelled {
            return true;
        }
        let (cancelled, _) = self
            .inner
            .condvar
            .wait_timeout(cancelled, timeout)
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *cancelled
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
