#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Geometry stages of the harvest pipeline.
//!
//! Every transform takes a [`FeatureCollection`] by reference and returns a
//! new one, appending exactly one entry to the run's [`ProcessingLog`]:
//!
//! - [`repair`]: drops degenerate rings and resolves self-intersections.
//! - [`clip`]: intersects features with a boundary mask, using an R-tree
//!   over the mask parts.
//! - [`merge`]: concatenates layers and dissolves adjacent polygons.
//! - [`reproject`]: moves collections between coordinate systems.
//!
//! The polygon engine can panic on pathological input; those panics are
//! caught at the stage boundary and surfaced as [`SpatialError`] values.
//!
//! [`FeatureCollection`]: geoharvest_feature_models::FeatureCollection
//! [`ProcessingLog`]: geoharvest_feature_models::ProcessingLog

pub mod clip;
pub mod merge;
pub mod repair;
pub mod reproject;

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};

use geo::{BoundingRect as _, MultiPolygon};
use geoharvest_feature_models::{BoundaryError, Crs, SchemaMismatch};
use rstar::AABB;

pub use clip::{clip, prepare_mask};
pub use merge::{DissolveOptions, dissolve, merge};
pub use repair::{RepairOptions, repair};
pub use reproject::{Reprojector, reproject_collection};

/// Errors produced by the geometry stages.
#[derive(Debug, thiserror::Error)]
pub enum SpatialError {
    /// No projection definition is known for the CRS.
    #[error("Unsupported CRS: {0}")]
    UnsupportedCrs(Crs),

    /// Coordinate transformation failed.
    #[error("Reprojection failed: {message}")]
    Reprojection {
        /// Underlying error text.
        message: String,
    },

    /// Inputs that must share a CRS do not.
    #[error("CRS mismatch: {expected} vs {found}")]
    CrsMismatch {
        /// CRS of the first input.
        expected: Crs,
        /// CRS of the offending input.
        found: Crs,
    },

    /// The repair step could not process the collection.
    #[error("Geometry repair failed: {message}")]
    RepairFailure {
        /// What went wrong.
        message: String,
    },

    /// Clipping could not be performed.
    #[error("Clip failed: {message}")]
    ClipFailure {
        /// What went wrong.
        message: String,
    },

    /// Dissolving could not be performed.
    #[error("Dissolve failed: {message}")]
    DissolveFailure {
        /// What went wrong.
        message: String,
    },

    /// Merge was called with no layers.
    #[error("Nothing to merge")]
    NothingToMerge,

    /// Layer schemas cannot be combined.
    #[error("Schema mismatch: {0}")]
    Schema(#[from] SchemaMismatch),

    /// A field named by an option does not exist.
    #[error("Unknown field \"{0}\"")]
    UnknownField(String),

    /// The cut boundary could not be turned into a mask.
    #[error("Boundary error: {0}")]
    Boundary(#[from] BoundaryError),
}

/// Runs `f`, turning a panic inside the polygon engine into an error
/// message.
pub(crate) fn guarded<T>(f: impl FnOnce() -> T) -> Result<T, String> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| panic_message(payload.as_ref()))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "polygon engine panicked".to_string())
}

/// Compute the bounding box envelope for a [`MultiPolygon`].
pub(crate) fn envelope_of(mp: &MultiPolygon<f64>) -> Option<AABB<[f64; 2]>> {
    mp.bounding_rect()
        .map(|rect| AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y]))
}

/// Percentage of features removed going from `before` to `after`.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn reduction_pct(before: usize, after: usize) -> f64 {
    if before == 0 {
        0.0
    } else {
        (before as f64 - after as f64) / before as f64 * 100.0
    }
}
