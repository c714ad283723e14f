//! The per-run processing log.
//!
//! Every transform stage appends exactly one entry describing what it did
//! (operation name, feature counts before and after, and a human-readable
//! summary). The log is append-only and shared between stages, so it is
//! the one place besides the [`crate::CancellationToken`] that needs
//! interior mutability.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Direction of a feature-count change.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChangeKind {
    /// Fewer features after the operation.
    Loss,
    /// More features after the operation.
    Gain,
    /// Same number of features.
    NoOp,
}

impl ChangeKind {
    /// Classifies a before/after feature count.
    #[must_use]
    pub const fn from_counts(before: usize, after: usize) -> Self {
        if after < before {
            Self::Loss
        } else if after > before {
            Self::Gain
        } else {
            Self::NoOp
        }
    }
}

/// One processing step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingLogEntry {
    /// When the entry was recorded.
    pub timestamp: DateTime<Utc>,
    /// Operation name (e.g. `"repair_geometry"`).
    pub operation: String,
    /// Human-readable before/after summary.
    pub summary: String,
    /// Feature count before the operation, when it applies.
    pub before: Option<usize>,
    /// Feature count after the operation, when it applies.
    pub after: Option<usize>,
    /// Classification of the count change, when counts are present.
    pub change: Option<ChangeKind>,
}

impl ProcessingLogEntry {
    /// Creates an entry without feature counts.
    #[must_use]
    pub fn note(operation: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            operation: operation.into(),
            summary: summary.into(),
            before: None,
            after: None,
            change: None,
        }
    }

    /// Creates an entry recording a before/after feature count.
    #[must_use]
    pub fn counts(
        operation: impl Into<String>,
        before: usize,
        after: usize,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            operation: operation.into(),
            summary: summary.into(),
            before: Some(before),
            after: Some(after),
            change: Some(ChangeKind::from_counts(before, after)),
        }
    }
}

/// Append-only, shareable list of [`ProcessingLogEntry`] values.
///
/// Clones share the same underlying list.
#[derive(Debug, Clone, Default)]
pub struct ProcessingLog {
    entries: Arc<Mutex<Vec<ProcessingLogEntry>>>,
}

impl ProcessingLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry.
    pub fn append(&self, entry: ProcessingLogEntry) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }

    /// Returns a snapshot of every entry, in append order.
    #[must_use]
    pub fn entries(&self) -> Vec<ProcessingLogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the most recent entry.
    #[must_use]
    pub fn last(&self) -> Option<ProcessingLogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns `true` if nothing has been logged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
