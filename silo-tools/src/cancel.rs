//! Cooperative cancellation threaded through long running operations.
//!
//! A token is either clean, canceled by request, or canceled because
//! some worker hit a fatal error. The first failure reason wins and is
//! attached to the `Canceled` error every later `check()` raises, so
//! worker pools need no separate abort latch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Error;

use silo_api_types::RepoError;

#[derive(Default)]
struct TokenState {
    canceled: AtomicBool,
    reason: Mutex<Option<String>>,
}

/// Shared cancellation flag. Cloning is cheap; all clones observe the
/// same state.
#[derive(Clone, Default)]
pub struct CancelToken {
    state: Arc<TokenState>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. In-flight work drains best-effort; the next
    /// `check()` fails.
    pub fn cancel(&self) {
        self.state.canceled.store(true, Ordering::SeqCst);
    }

    /// Cancel because something went wrong. Only the first reason is
    /// kept; it rides along on every subsequent `check()` error.
    pub fn cancel_with<S: Into<String>>(&self, reason: S) {
        {
            let mut slot = self.state.reason.lock().unwrap();
            if slot.is_none() {
                *slot = Some(reason.into());
            }
        }
        self.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.state.canceled.load(Ordering::SeqCst)
    }

    /// The failure reason, when cancellation was caused by an error.
    pub fn failure(&self) -> Option<String> {
        self.state.reason.lock().unwrap().clone()
    }

    /// Fail with `Canceled` once cancellation was requested. Called at
    /// every suspension point of long running loops.
    pub fn check(&self) -> Result<(), Error> {
        if !self.is_canceled() {
            return Ok(());
        }
        match self.failure() {
            Some(reason) => Err(Error::from(RepoError::Canceled).context(reason)),
            None => Err(RepoError::Canceled.into()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use silo_api_types::is_canceled;

    #[test]
    fn check_fails_after_cancel() {
        let token = CancelToken::new();
        assert!(token.check().is_ok());

        let clone = token.clone();
        clone.cancel();

        let err = token.check().unwrap_err();
        assert!(is_canceled(&err));
        assert!(token.failure().is_none());
    }

    #[test]
    fn first_failure_reason_sticks() {
        let token = CancelToken::new();
        token.cancel_with("disk on fire");
        token.cancel_with("also out of coffee");

        assert_eq!(token.failure().as_deref(), Some("disk on fire"));

        let err = token.check().unwrap_err();
        assert!(is_canceled(&err));
        assert!(format!("{:#}", err).contains("disk on fire"));
    }
}
