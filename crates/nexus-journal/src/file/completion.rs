//! Write completion callbacks.

use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{JournalError, JournalResult};
use crate::executor::CountDownLatch;

/// Callback signalled when a journal write finishes.
pub trait IoCompletion: Send + Sync {
    /// Called before the write is queued, once per write that will later
    /// call `done` or `on_error`.
    fn store_line_up(&self) {}

    /// The write completed.
    fn done(&self);

    /// The write failed.
    fn on_error(&self, code: i32, message: &str);
}

/// Completion that lets a caller block until the write is done.
pub struct WaitCompletion {
    latch: CountDownLatch,
    error: Mutex<Option<(i32, String)>>,
}

impl WaitCompletion {
    /// Creates a completion waiting for a single write.
    pub fn new() -> Self {
        Self {
            latch: CountDownLatch::new(1),
            error: Mutex::new(None),
        }
    }

    /// Blocks until the write completes, surfacing a reported error.
    pub fn wait(&self, timeout: Duration) -> JournalResult<()> {
        if !self.latch.wait_for(timeout) {
            return Err(JournalError::timeout("write completion", timeout));
        }
        match self.error.lock().take() {
            Some((code, message)) => Err(JournalError::CompletionFailed { code, message }),
            None => Ok(()),
        }
    }

    /// Returns true once the write finished, successfully or not.
    pub fn is_done(&self) -> bool {
        self.latch.count() == 0
    }
}

impl Default for WaitCompletion {
    fn default() -> Self {
        Self::new()
    }
}

impl IoCompletion for WaitCompletion {
    fn done(&self) {
        self.latch.count_down();
    }

    fn on_error(&self, code: i32, message: &str) {
        *self.error.lock() = Some((code, message.to_string()));
        self.latch.count_down();
    }
}

impl std::fmt::Debug for WaitCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitCompletion")
            .field("done", &self.is_done())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_completion_done() {
        let completion = WaitCompletion::new();
        assert!(!completion.is_done());
        completion.done();
        assert!(completion.is_done());
        completion.wait(Duration::from_millis(10)).unwrap();
    }

    #[test]
    fn test_wait_completion_error() {
        let completion = WaitCompletion::new();
        completion.on_error(5, "disk full");
        let err = completion.wait(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, JournalError::CompletionFailed { code: 5, .. }));
    }

    #[test]
    fn test_wait_completion_timeout() {
        let completion = WaitCompletion::new();
        let err = completion.wait(Duration::from_millis(5)).unwrap_err();
        assert!(err.is_timeout());
    }
}
