//! Cooperative cancellation.
//!
//! A [`CancellationToken`] is created at the start of a run, handed to
//! every stage, and set at most once (by the user aborting, or by the run
//! finishing). Stages poll it at their checkpoints; nothing is interrupted
//! preemptively.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared, write-once cancellation flag.
///
/// Cloning shares the flag. A token is never reset; start a new run with
/// a new token.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Creates an unset token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Returns `true` if this call set the flag.
    pub fn cancel(&self) -> bool {
        !self.flag.swap(true, Ordering::SeqCst)
    }

    /// Returns `true` once cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Polling point for `?`-style early exit.
    ///
    /// # Errors
    ///
    /// Returns [`Cancelled`] if cancellation has been requested.
    pub fn checkpoint(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Marker returned from a polling point after cancellation.
///
/// This is a terminal outcome, not an error; callers convert it into
/// their own "cancelled" result variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("cancelled")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let token = CancellationToken::new();
        let observer = token.clone();
        assert!(observer.checkpoint().is_ok());

        assert!(token.cancel());
        assert!(observer.is_cancelled());
        assert_eq!(observer.checkpoint(), Err(Cancelled));
    }

    #[test]
    fn cancel_is_latched() {
        let token = CancellationToken::new();
        assert!(token.cancel());
        assert!(!token.cancel());
        assert!(token.is_cancelled());
    }
}
