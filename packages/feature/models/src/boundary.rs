//! Clip masks.

use std::fmt;

use geo::{MultiPolygon, Rect};

use crate::attribute::Schema;
use crate::collection::{Feature, FeatureCollection};
use crate::crs::Crs;

/// The boundary a dataset is clipped against.
#[derive(Debug, Clone, PartialEq)]
pub enum CutBoundary {
    /// Every feature of a loaded boundary layer (e.g. a whole biome).
    Full(FeatureCollection),
    /// A single administrative unit selected from a boundary layer by
    /// attribute value (e.g. one state out of a state layer).
    Unit {
        /// The boundary layer to select from.
        boundary: FeatureCollection,
        /// Attribute holding the unit identifier.
        field: String,
        /// Identifier of the unit to keep.
        value: String,
    },
    /// A rectangle drawn by the user.
    Rectangle {
        /// Rectangle corners.
        rect: Rect<f64>,
        /// CRS of the corners.
        crs: Crs,
    },
    /// An arbitrary externally loaded polygon layer.
    External(FeatureCollection),
}

/// Error returned when a [`CutBoundary`] cannot be turned into a mask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundaryError {
    /// The selection field does not exist in the boundary layer.
    UnknownField(String),
    /// No feature has the requested identifier.
    NoMatchingUnit {
        /// Selection field.
        field: String,
        /// Requested identifier.
        value: String,
    },
}

impl fmt::Display for BoundaryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownField(field) => {
                write!(f, "boundary layer has no field \"{field}\"")
            }
            Self::NoMatchingUnit { field, value } => {
                write!(f, "no boundary feature with {field} = \"{value}\"")
            }
        }
    }
}

impl std::error::Error for BoundaryError {}

impl CutBoundary {
    /// Returns the CRS the mask geometries are expressed in.
    #[must_use]
    pub const fn crs(&self) -> Crs {
        match self {
            Self::Full(c) | Self::External(c) | Self::Unit { boundary: c, .. } => c.crs,
            Self::Rectangle { crs, .. } => *crs,
        }
    }

    /// Short description for log messages.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Full(c) => format!("full boundary ({} features)", c.len()),
            Self::Unit { field, value, .. } => format!("unit {field} = {value}"),
            Self::Rectangle { rect, crs } => format!(
                "rectangle ({}, {}) - ({}, {}) {crs}",
                rect.min().x,
                rect.min().y,
                rect.max().x,
                rect.max().y
            ),
            Self::External(c) => format!("external layer ({} features)", c.len()),
        }
    }

    /// Resolves the boundary into a polygon collection usable as a clip
    /// mask.
    ///
    /// Unit selection compares the field's textual value with `value`,
    /// ignoring ASCII case.
    ///
    /// # Errors
    ///
    /// Returns [`BoundaryError`] if a unit selection names an unknown field
    /// or matches no feature.
    pub fn to_collection(&self) -> Result<FeatureCollection, BoundaryError> {
        match self {
            Self::Full(c) | Self::External(c) => Ok(c.clone()),
            Self::Unit {
                boundary,
                field,
                value,
            } => {
                let idx = boundary
                    .schema
                    .index_of(field)
                    .ok_or_else(|| BoundaryError::UnknownField(field.clone()))?;
                let selected: Vec<Feature> = boundary
                    .features
                    .iter()
                    .filter(|f| f.attribute(idx).to_string().eq_ignore_ascii_case(value))
                    .cloned()
                    .collect();
                if selected.is_empty() {
                    return Err(BoundaryError::NoMatchingUnit {
                        field: field.clone(),
                        value: value.clone(),
                    });
                }
                Ok(boundary.with_features(selected))
            }
            Self::Rectangle { rect, crs } => Ok(FeatureCollection::new(
                Schema::default(),
                *crs,
                vec![Feature::new(
                    MultiPolygon::new(vec![rect.to_polygon()]),
                    Vec::new(),
                )],
            )),
        }
    }
}
