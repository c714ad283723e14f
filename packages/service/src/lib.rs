#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Feature-service acquisition.
//!
//! Turns a dataset selection into an assembled [`FeatureCollection`]:
//!
//! 1. [`resolve`] maps a (family, region, kind) triple onto a service URL
//!    and a qualified type name, using the endpoint [`registry`].
//! 2. [`planner`] splits the user's constraints into the part the server
//!    evaluates (a bounding box *or* an attribute expression) and the part
//!    applied after download.
//! 3. [`fetch`] pages through the service, falling back to the legacy
//!    unpaginated protocol when pagination is rejected, and polls the
//!    [`CancellationToken`] between requests.
//! 4. [`assemble`] concatenates the pages in index order.
//! 5. [`post_filter`] applies the deferred [`expression`].
//!
//! [`FeatureCollection`]: geoharvest_feature_models::FeatureCollection
//! [`CancellationToken`]: geoharvest_feature_models::CancellationToken

pub mod assemble;
pub mod expression;
pub mod fetch;
pub mod page;
pub mod planner;
pub mod post_filter;
pub mod progress;
pub mod registry;
pub mod resolve;
pub mod retry;
pub mod transport;

use geoharvest_feature_models::SchemaMismatch;

pub use expression::ExpressionError;

/// Errors that can occur while resolving, fetching or assembling features.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// No endpoint mapping and no parseable URL for the requested dataset.
    #[error("Resolution error: {message}")]
    Resolution {
        /// Description of what could not be resolved.
        message: String,
    },

    /// The requested constraints cannot be expressed against the layer.
    #[error("Invalid filter: {message}")]
    InvalidFilter {
        /// What is missing or inconsistent.
        message: String,
    },

    /// HTTP request failed (connection, timeout, body read).
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The service answered with a non-success status code.
    #[error("HTTP {status} from {url}")]
    Status {
        /// Status code.
        status: u16,
        /// Requested URL.
        url: String,
    },

    /// The response body carried a service exception report.
    #[error("Service exception: {message}")]
    ServiceException {
        /// Exception text reported by the service.
        message: String,
    },

    /// The response body could not be understood.
    #[error("Malformed response: {message}")]
    MalformedResponse {
        /// Description of what went wrong.
        message: String,
    },

    /// Pages of the same request disagree on the attribute schema.
    #[error("Schema drift on page {page}: {mismatch}")]
    SchemaDrift {
        /// Index of the offending page.
        page: u32,
        /// How the page differs from the first page.
        mismatch: SchemaMismatch,
    },

    /// An attribute expression could not be parsed.
    #[error("Expression error: {0}")]
    Expression(#[from] ExpressionError),

    /// A cut extent could not be moved into the service CRS.
    #[error("Spatial error: {0}")]
    Spatial(#[from] geoharvest_spatial::SpatialError),

    /// JSON parsing failed.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error (temporary page files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServiceError {
    /// Returns `true` for the network class of failures (transport errors,
    /// non-success statuses, exception reports and malformed bodies).
    #[must_use]
    pub const fn is_network(&self) -> bool {
        matches!(
            self,
            Self::Http(_)
                | Self::Status { .. }
                | Self::ServiceException { .. }
                | Self::MalformedResponse { .. }
        )
    }
}
