//! Filter descriptions sent to (or kept back from) the feature service.

use std::fmt;

use geo::Rect;
use serde::{Deserialize, Serialize};

use crate::crs::Crs;

/// An axis-aligned extent in a given CRS.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    /// Minimum x (longitude / easting).
    pub min_x: f64,
    /// Minimum y (latitude / northing).
    pub min_y: f64,
    /// Maximum x.
    pub max_x: f64,
    /// Maximum y.
    pub max_y: f64,
    /// CRS the corners are expressed in.
    pub crs: Crs,
}

impl BBox {
    /// Creates a bounding box from a [`Rect`].
    #[must_use]
    pub fn from_rect(rect: Rect<f64>, crs: Crs) -> Self {
        Self {
            min_x: rect.min().x,
            min_y: rect.min().y,
            max_x: rect.max().x,
            max_y: rect.max().y,
            crs,
        }
    }

    /// Returns the box as a [`Rect`].
    #[must_use]
    pub fn to_rect(&self) -> Rect<f64> {
        Rect::new(
            geo::coord! { x: self.min_x, y: self.min_y },
            geo::coord! { x: self.max_x, y: self.max_y },
        )
    }

    /// Renders the `bbox` request parameter:
    /// `minx,miny,maxx,maxy,EPSG:code`.
    #[must_use]
    pub fn to_query_value(&self) -> String {
        format!(
            "{},{},{},{},{}",
            self.min_x, self.min_y, self.max_x, self.max_y, self.crs
        )
    }
}

/// How a request is filtered, and where each part of the filter runs.
///
/// A bounding box and an attribute expression are never sent to the
/// service in the same request: when both exist the box goes to the
/// server and the expression is applied after download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilterSpec {
    /// Full-region request with no filtering.
    None,
    /// Server-side bounding-box filter only.
    SpatialBBox {
        /// Extent sent as the `bbox` parameter.
        bbox: BBox,
    },
    /// Attribute expression only (sent as `CQL_FILTER` and re-applied
    /// locally).
    AttributeExpression {
        /// Canonical rendering of the expression.
        expression: String,
    },
    /// Bounding box on the server, expression after download.
    Combined {
        /// Extent sent as the `bbox` parameter.
        bbox: BBox,
        /// Canonical rendering of the deferred expression.
        deferred: String,
    },
}

impl FilterSpec {
    /// Returns the bounding box sent to the server, if any.
    #[must_use]
    pub const fn server_bbox(&self) -> Option<&BBox> {
        match self {
            Self::SpatialBBox { bbox } | Self::Combined { bbox, .. } => Some(bbox),
            Self::None | Self::AttributeExpression { .. } => None,
        }
    }

    /// Returns the expression sent to the server, if any.
    #[must_use]
    pub fn server_expression(&self) -> Option<&str> {
        match self {
            Self::AttributeExpression { expression } => Some(expression),
            Self::None | Self::SpatialBBox { .. } | Self::Combined { .. } => None,
        }
    }

    /// Returns the expression applied after download, if any.
    #[must_use]
    pub fn local_expression(&self) -> Option<&str> {
        match self {
            Self::AttributeExpression { expression } => Some(expression),
            Self::Combined { deferred, .. } => Some(deferred),
            Self::None | Self::SpatialBBox { .. } => None,
        }
    }
}

impl fmt::Display for FilterSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("no filter"),
            Self::SpatialBBox { bbox } => write!(f, "bbox({})", bbox.to_query_value()),
            Self::AttributeExpression { expression } => write!(f, "expression({expression})"),
            Self::Combined { bbox, deferred } => write!(
                f,
                "bbox({}) then expression({deferred})",
                bbox.to_query_value()
            ),
        }
    }
}
