//! Progress reporting for page downloads.
//!
//! [`ProgressCallback`] decouples the fetcher from any rendering backend;
//! the CLI plugs in `indicatif` bars, tests and library callers use
//! [`NullProgress`] or [`LogProgress`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Receives download progress, measured in features.
///
/// Implementations must be `Send + Sync` so they can be shared with the
/// background pipeline task.
pub trait ProgressCallback: Send + Sync {
    /// Sets the expected number of features, when the service reports it.
    fn set_total(&self, total: u64);

    /// Called after each stored page with the page index and the number of
    /// features on that page.
    fn page_received(&self, page: u32, features: u64);

    /// Updates the status line.
    fn set_message(&self, msg: String);

    /// Marks the download as finished.
    fn finish(&self, msg: String);
}

/// Ignores every update.
pub struct NullProgress;

impl ProgressCallback for NullProgress {
    fn set_total(&self, _total: u64) {}
    fn page_received(&self, _page: u32, _features: u64) {}
    fn set_message(&self, _msg: String) {}
    fn finish(&self, _msg: String) {}
}

/// Returns a shared [`NullProgress`].
#[must_use]
pub fn null_progress() -> Arc<dyn ProgressCallback> {
    Arc::new(NullProgress)
}

/// Writes progress to the `log` facade at `info` level.
#[derive(Default)]
pub struct LogProgress {
    total: AtomicU64,
    received: AtomicU64,
}

impl LogProgress {
    /// Creates a reporter with no known total.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Features received so far.
    #[must_use]
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

impl ProgressCallback for LogProgress {
    fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
    }

    fn page_received(&self, page: u32, features: u64) {
        let received = self.received.fetch_add(features, Ordering::Relaxed) + features;
        match self.total.load(Ordering::Relaxed) {
            0 => log::info!("Page {page}: {features} features ({received} so far)"),
            total => log::info!("Page {page}: {features} features ({received}/{total})"),
        }
    }

    fn set_message(&self, msg: String) {
        log::info!("{msg}");
    }

    fn finish(&self, msg: String) {
        log::info!("{msg}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_progress_accumulates_features() {
        let progress = LogProgress::new();
        progress.set_total(10);
        progress.page_received(0, 4);
        progress.page_received(1, 6);
        assert_eq!(progress.received(), 10);
    }
}
