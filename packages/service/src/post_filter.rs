//! Post-download attribute filtering.

use geoharvest_feature_models::{FeatureCollection, ProcessingLog, ProcessingLogEntry};

use crate::expression::{Expression, ExpressionError};

/// Log operation name.
pub const OPERATION: &str = "post_filter";

/// Result of [`post_filter`].
#[derive(Debug, Clone, PartialEq)]
pub enum PostFilterOutcome {
    /// The expression was applied. The collection may be empty.
    Filtered(FeatureCollection),
    /// The expression could not be applied; the input is returned
    /// unfiltered.
    NotApplied {
        /// Unfiltered input.
        collection: FeatureCollection,
        /// Why the expression was not applied.
        reason: ExpressionError,
    },
}

impl PostFilterOutcome {
    /// Whether the expression was applied.
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Filtered(_))
    }

    /// Returns the resulting collection, filtered or not.
    #[must_use]
    pub fn into_collection(self) -> FeatureCollection {
        match self {
            Self::Filtered(collection) | Self::NotApplied { collection, .. } => collection,
        }
    }
}

/// Keeps the features of `collection` that satisfy `expression`.
///
/// The expression is bound once against the collection schema. An empty
/// collection is returned as filtered without binding. A binding
/// failure (unknown field, literal of the wrong type) is not fatal: the
/// input comes back unchanged as [`PostFilterOutcome::NotApplied`] and a
/// warning is logged. Either way one [`ProcessingLogEntry`] is appended.
#[must_use]
pub fn post_filter(
    collection: &FeatureCollection,
    expression: &Expression,
    log: &ProcessingLog,
) -> PostFilterOutcome {
    let before = collection.len();

    if before == 0 {
        // Zero matches carry no schema to bind against.
        log.append(ProcessingLogEntry::counts(
            OPERATION,
            0,
            0,
            format!("0 -> 0 features: {expression}"),
        ));
        return PostFilterOutcome::Filtered(collection.clone());
    }

    let bound = match expression.bind(&collection.schema) {
        Ok(bound) => bound,
        Err(reason) => {
            log::warn!("Post-filter {expression} not applied: {reason}");
            log.append(ProcessingLogEntry::counts(
                OPERATION,
                before,
                before,
                format!("not applied ({reason}): {expression}"),
            ));
            return PostFilterOutcome::NotApplied {
                collection: collection.clone(),
                reason,
            };
        }
    };

    let features: Vec<_> = collection
        .features
        .iter()
        .filter(|f| bound.matches(f))
        .cloned()
        .collect();

    let after = features.len();
    if after == 0 && before > 0 {
        log::warn!("Post-filter {expression} matched none of {before} features");
    }
    let summary = format!("{before} -> {after} features: {expression}");
    log::info!("Post-filter: {summary}");
    log.append(ProcessingLogEntry::counts(OPERATION, before, after, summary));

    PostFilterOutcome::Filtered(collection.with_features(features))
}
