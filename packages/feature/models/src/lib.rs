#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Shared types for the feature harvesting pipeline.
//!
//! Every stage of the pipeline (fetching, assembly, filtering, repair,
//! clipping, merging and export) exchanges [`FeatureCollection`] values.
//! Transform stages never mutate their input: each returns a new
//! collection, and records what it did in the run's [`ProcessingLog`].
//!
//! The [`CancellationToken`] is the only other piece of state shared
//! between stages.

pub mod attribute;
pub mod boundary;
pub mod cancel;
pub mod collection;
pub mod crs;
pub mod filter;
pub mod processing;

pub use attribute::{AttributeValue, FieldDef, FieldType, Schema, SchemaMismatch};
pub use boundary::{BoundaryError, CutBoundary};
pub use cancel::{CancellationToken, Cancelled};
pub use collection::{Feature, FeatureCollection};
pub use crs::{Crs, CrsParseError, PIPELINE_CRS};
pub use filter::{BBox, FilterSpec};
pub use processing::{ChangeKind, ProcessingLog, ProcessingLogEntry};
