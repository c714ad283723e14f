//! Features and feature collections.

use geo::{Area as _, BoundingRect as _, MultiPolygon, Rect};

use crate::attribute::{AttributeValue, Schema};
use crate::crs::Crs;

/// A polygonal feature with positional attribute values.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    /// Feature geometry. Single polygons are stored as one-part
    /// multipolygons.
    pub geometry: MultiPolygon<f64>,
    /// Attribute values aligned with the owning collection's [`Schema`].
    pub attributes: Vec<AttributeValue>,
}

impl Feature {
    /// Creates a feature.
    #[must_use]
    pub const fn new(geometry: MultiPolygon<f64>, attributes: Vec<AttributeValue>) -> Self {
        Self {
            geometry,
            attributes,
        }
    }

    /// Returns the attribute stored at `index`, or `Null` when out of range.
    #[must_use]
    pub fn attribute(&self, index: usize) -> &AttributeValue {
        self.attributes.get(index).unwrap_or(&AttributeValue::Null)
    }
}

/// An ordered collection of features sharing one schema and one CRS.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureCollection {
    /// Attribute schema shared by every feature.
    pub schema: Schema,
    /// Coordinate reference system of every geometry.
    pub crs: Crs,
    /// Features, in service order.
    pub features: Vec<Feature>,
}

impl FeatureCollection {
    /// Creates a collection.
    #[must_use]
    pub const fn new(schema: Schema, crs: Crs, features: Vec<Feature>) -> Self {
        Self {
            schema,
            crs,
            features,
        }
    }

    /// Creates an empty collection with the given schema and CRS.
    #[must_use]
    pub const fn empty(schema: Schema, crs: Crs) -> Self {
        Self::new(schema, crs, Vec::new())
    }

    /// Returns a collection with the same schema and CRS holding
    /// `features`.
    #[must_use]
    pub fn with_features(&self, features: Vec<Feature>) -> Self {
        Self::new(self.schema.clone(), self.crs, features)
    }

    /// Number of features.
    #[must_use]
    pub fn len(&self) -> usize {
        self.features.len()
    }

    /// Returns `true` if there are no features.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Bounding rectangle of all geometries, or `None` if every geometry
    /// is empty.
    #[must_use]
    pub fn bounding_rect(&self) -> Option<Rect<f64>> {
        self.features
            .iter()
            .filter_map(|f| f.geometry.bounding_rect())
            .reduce(|a, b| {
                Rect::new(
                    geo::coord! { x: a.min().x.min(b.min().x), y: a.min().y.min(b.min().y) },
                    geo::coord! { x: a.max().x.max(b.max().x), y: a.max().y.max(b.max().y) },
                )
            })
    }

    /// Sum of the planar (unsigned) areas of every geometry, in CRS units.
    #[must_use]
    pub fn total_area(&self) -> f64 {
        self.features
            .iter()
            .map(|f| f.geometry.unsigned_area())
            .sum()
    }
}
