#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! End-to-end harvest runs.
//!
//! A [`PipelineRequest`] names one or more datasets, optional temporal and
//! class constraints, an optional cut boundary and an output file. The
//! [`Pipeline`] drives every dataset through resolve, plan, fetch,
//! assemble and post-filter, then repairs, merges, clips, dissolves and
//! exports the result. Each stage polls the run's
//! [`CancellationToken`](geoharvest_feature_models::CancellationToken) and
//! a cancelled run is reported as [`RunOutcome::Cancelled`], never as an
//! error.
//!
//! [`spawn_pipeline`] runs the same thing as a background task and streams
//! [`PipelineEvent`]s over a channel.

pub mod boundary;
pub mod events;
pub mod request;
pub mod run;

use geoharvest_export::{ExportError, ExportSummary};
use geoharvest_feature_models::ProcessingLogEntry;
use geoharvest_service::ServiceError;
use geoharvest_spatial::SpatialError;
use strum_macros::{AsRefStr, Display};

pub use events::{PipelineEvent, PipelineHandle, spawn_pipeline};
pub use request::PipelineRequest;
pub use run::Pipeline;

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
    /// Loading and preparing the cut boundary.
    Boundary,
    /// Mapping a dataset onto a service endpoint.
    Resolve,
    /// Splitting constraints into server and local filters.
    Plan,
    /// Downloading pages.
    Fetch,
    /// Concatenating pages.
    Assemble,
    /// Moving features into the pipeline CRS.
    Reproject,
    /// Applying the deferred expression.
    PostFilter,
    /// Fixing invalid geometries.
    Repair,
    /// Concatenating datasets.
    Merge,
    /// Cutting to the boundary.
    Clip,
    /// Unioning adjacent polygons.
    Dissolve,
    /// Writing the output file.
    Export,
}

/// The error behind a [`PipelineError`].
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// Resolution, network or assembly failure.
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// Geometry failure.
    #[error(transparent)]
    Spatial(#[from] SpatialError),

    /// Output could not be written.
    #[error(transparent)]
    Export(#[from] ExportError),

    /// The request is inconsistent.
    #[error("Invalid request: {message}")]
    Config {
        /// What is wrong.
        message: String,
    },

    /// File system failure outside the exporter.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A blocking geometry task did not complete.
    #[error("Worker task failed: {message}")]
    Join {
        /// Panic or cancellation text from the runtime.
        message: String,
    },
}

/// A failed run, tagged with where it failed and how many features the
/// failing stage was given.
#[derive(Debug, thiserror::Error)]
#[error("{stage} failed ({input_features} input features): {source}")]
pub struct PipelineError {
    /// Stage that failed.
    pub stage: Stage,
    /// Features handed to the stage.
    pub input_features: usize,
    /// Underlying error.
    #[source]
    pub source: StageError,
}

impl PipelineError {
    /// Wraps `source` for `stage`.
    pub fn new(stage: Stage, input_features: usize, source: impl Into<StageError>) -> Self {
        Self {
            stage,
            input_features,
            source: source.into(),
        }
    }
}

/// What a completed run produced.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Files written.
    pub output: ExportSummary,
    /// Features exported.
    pub features: usize,
    /// Every transform, in order.
    pub log: Vec<ProcessingLogEntry>,
    /// Page requests issued across all datasets and the boundary.
    pub requests: u32,
    /// Non-fatal problems (filters not applied, repair skipped, clip
    /// bypassed).
    pub warnings: Vec<String>,
}

/// How a run ended, when it did not fail.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// Output was written.
    Completed(RunReport),
    /// Cancellation was observed; nothing was written.
    Cancelled {
        /// Stage that observed the token.
        stage: Stage,
    },
}

impl RunOutcome {
    /// Returns the report of a completed run.
    #[must_use]
    pub const fn report(&self) -> Option<&RunReport> {
        match self {
            Self::Completed(report) => Some(report),
            Self::Cancelled { .. } => None,
        }
    }

    /// Returns `true` if the run was cancelled.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

#[cfg(test)]
pub(crate) mod test_utils;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_name_the_stage() {
        let err = PipelineError::new(
            Stage::PostFilter,
            12,
            StageError::Config {
                message: "bad".to_string(),
            },
        );
        assert_eq!(
            err.to_string(),
            "post_filter failed (12 input features): Invalid request: bad"
        );
    }

    #[test]
    fn spatial_errors_convert() {
        let err = PipelineError::new(Stage::Merge, 0, SpatialError::NothingToMerge);
        assert!(matches!(err.source, StageError::Spatial(SpatialError::NothingToMerge)));
    }
}
