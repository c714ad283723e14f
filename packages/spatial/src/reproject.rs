//! Coordinate reprojection with `proj4rs`.
//!
//! Only the systems the harvested layers actually use are known: the
//! geographic datums (SIRGAS 2000, WGS 84, SAD69), Web Mercator, Brazil
//! Mercator and the UTM zones covering Brazil on both SIRGAS 2000 and
//! WGS 84. Geographic coordinates are in degrees at the API boundary and
//! converted to radians for `proj4rs`.

use geo::{Coord, MapCoords as _, MultiPolygon, Rect, coord};
use geoharvest_feature_models::{Crs, Feature, FeatureCollection};
use proj4rs::proj::Proj;
use proj4rs::transform::transform;

use crate::SpatialError;

/// Points sampled along each rectangle edge when reprojecting extents.
const EDGE_SAMPLES: u32 = 8;

/// Returns the PROJ.4 definition for a CRS.
///
/// # Errors
///
/// Returns [`SpatialError::UnsupportedCrs`] for unknown codes.
pub fn proj_string(crs: Crs) -> Result<String, SpatialError> {
    let code = crs.code();
    let def = match code {
        4674 => "+proj=longlat +ellps=GRS80 +towgs84=0,0,0,0,0,0,0 +no_defs".to_string(),
        4326 => "+proj=longlat +datum=WGS84 +no_defs".to_string(),
        4618 => "+proj=longlat +ellps=aust_SA +towgs84=-57,1,-41,0,0,0,0 +no_defs".to_string(),
        3857 => "+proj=merc +a=6378137 +b=6378137 +lat_ts=0 +lon_0=0 +x_0=0 +y_0=0 +k=1 +units=m +no_defs"
            .to_string(),
        5641 => "+proj=merc +lon_0=-43 +lat_ts=-2 +x_0=5000000 +y_0=10000000 +ellps=GRS80 +units=m +no_defs"
            .to_string(),
        // SIRGAS 2000 / UTM zones 17N..22N and 18S..25S.
        31972..=31977 => utm(code - 31972 + 17, false, "+ellps=GRS80 +towgs84=0,0,0,0,0,0,0"),
        31978..=31985 => utm(code - 31978 + 18, true, "+ellps=GRS80 +towgs84=0,0,0,0,0,0,0"),
        32601..=32660 => utm(code - 32600, false, "+datum=WGS84"),
        32701..=32760 => utm(code - 32700, true, "+datum=WGS84"),
        _ => return Err(SpatialError::UnsupportedCrs(crs)),
    };
    Ok(def)
}

fn utm(zone: u32, south: bool, datum: &str) -> String {
    let south = if south { " +south" } else { "" };
    format!("+proj=utm +zone={zone}{south} {datum} +units=m +no_defs")
}

fn build(crs: Crs) -> Result<Proj, SpatialError> {
    let def = proj_string(crs)?;
    Proj::from_proj_string(&def).map_err(|e| SpatialError::Reprojection {
        message: format!("failed to build {crs} from \"{def}\": {e}"),
    })
}

/// Transforms coordinates between two systems.
pub struct Reprojector {
    from: Crs,
    to: Crs,
    projs: Option<(Proj, Proj)>,
}

impl Reprojector {
    /// Builds a transformer. Identical source and target need no PROJ
    /// definitions.
    ///
    /// # Errors
    ///
    /// Returns [`SpatialError::UnsupportedCrs`] or
    /// [`SpatialError::Reprojection`] if either side cannot be built.
    pub fn new(from: Crs, to: Crs) -> Result<Self, SpatialError> {
        let projs = if from == to {
            None
        } else {
            Some((build(from)?, build(to)?))
        };
        Ok(Self { from, to, projs })
    }

    /// Whether the transform leaves coordinates unchanged.
    #[must_use]
    pub const fn is_identity(&self) -> bool {
        self.projs.is_none()
    }

    /// Target CRS.
    #[must_use]
    pub const fn target(&self) -> Crs {
        self.to
    }

    /// Transforms one coordinate.
    ///
    /// # Errors
    ///
    /// Returns [`SpatialError::Reprojection`] if `proj4rs` rejects the point.
    pub fn coord(&self, c: Coord<f64>) -> Result<Coord<f64>, SpatialError> {
        let Some((from, to)) = &self.projs else {
            return Ok(c);
        };
        let mut point = if self.from.is_geographic() {
            (c.x.to_radians(), c.y.to_radians(), 0.0)
        } else {
            (c.x, c.y, 0.0)
        };
        transform(from, to, &mut point).map_err(|e| SpatialError::Reprojection {
            message: format!("({}, {}) {} -> {}: {e}", c.x, c.y, self.from, self.to),
        })?;
        Ok(if self.to.is_geographic() {
            coord! { x: point.0.to_degrees(), y: point.1.to_degrees() }
        } else {
            coord! { x: point.0, y: point.1 }
        })
    }

    /// Transforms every vertex of a multipolygon.
    ///
    /// # Errors
    ///
    /// Returns [`SpatialError::Reprojection`] on the first failing vertex.
    pub fn multipolygon(&self, mp: &MultiPolygon<f64>) -> Result<MultiPolygon<f64>, SpatialError> {
        if self.is_identity() {
            return Ok(mp.clone());
        }
        mp.try_map_coords(|c| self.coord(c))
    }

    /// Transforms a rectangle, returning the extent of its image. Edges are
    /// sampled so curved images are still covered.
    ///
    /// # Errors
    ///
    /// Returns [`SpatialError::Reprojection`] if a sample point fails.
    pub fn rect(&self, rect: Rect<f64>) -> Result<Rect<f64>, SpatialError> {
        if self.is_identity() {
            return Ok(rect);
        }
        let (min, max) = (rect.min(), rect.max());
        let mut xs = Vec::new();
        let mut ys = Vec::new();
        for i in 0..=EDGE_SAMPLES {
            let t = f64::from(i) / f64::from(EDGE_SAMPLES);
            let x = (max.x - min.x).mul_add(t, min.x);
            let y = (max.y - min.y).mul_add(t, min.y);
            for c in [
                coord! { x: x, y: min.y },
                coord! { x: x, y: max.y },
                coord! { x: min.x, y: y },
                coord! { x: max.x, y: y },
            ] {
                let p = self.coord(c)?;
                xs.push(p.x);
                ys.push(p.y);
            }
        }
        let fold = |v: &[f64], init: f64, f: fn(f64, f64) -> f64| v.iter().copied().fold(init, f);
        let min = coord! {
            x: fold(&xs, f64::INFINITY, f64::min),
            y: fold(&ys, f64::INFINITY, f64::min),
        };
        let max = coord! {
            x: fold(&xs, f64::NEG_INFINITY, f64::max),
            y: fold(&ys, f64::NEG_INFINITY, f64::max),
        };
        Ok(Rect::new(min, max))
    }
}

/// Returns a copy of `collection` in `target` coordinates.
///
/// # Errors
///
/// Returns [`SpatialError`] if either CRS is unsupported or a vertex fails
/// to transform.
pub fn reproject_collection(
    collection: &FeatureCollection,
    target: Crs,
) -> Result<FeatureCollection, SpatialError> {
    if collection.crs == target {
        return Ok(collection.clone());
    }
    let reprojector = Reprojector::new(collection.crs, target)?;
    log::debug!(
        "Reprojecting {} features {} -> {target}",
        collection.len(),
        collection.crs
    );
    let features = collection
        .features
        .iter()
        .map(|f| {
            Ok(Feature::new(
                reprojector.multipolygon(&f.geometry)?,
                f.attributes.clone(),
            ))
        })
        .collect::<Result<Vec<_>, SpatialError>>()?;
    Ok(FeatureCollection::new(
        collection.schema.clone(),
        target,
        features,
    ))
}

#[cfg(test)]
mod tests {
    use geoharvest_feature_models::{PIPELINE_CRS, Schema};

    use super::*;
    use crate::test_utils::square;

    #[test]
    fn knows_brazilian_systems() {
        for code in [4674, 4326, 4618, 3857, 5641, 31982, 31983, 32723] {
            assert!(proj_string(Crs::epsg(code)).is_ok(), "EPSG:{code}");
        }
        assert!(matches!(
            proj_string(Crs::epsg(2154)),
            Err(SpatialError::UnsupportedCrs(_))
        ));
    }

    #[test]
    fn utm_zones_map_to_hemispheres() {
        assert!(proj_string(Crs::epsg(31983)).unwrap().contains("+zone=23 +south"));
        assert!(proj_string(Crs::epsg(31976)).unwrap().contains("+zone=21 +ellps"));
        assert!(proj_string(Crs::epsg(32722)).unwrap().contains("+zone=22 +south"));
    }

    #[test]
    fn identity_keeps_coordinates() {
        let r = Reprojector::new(PIPELINE_CRS, PIPELINE_CRS).unwrap();
        assert!(r.is_identity());
        let c = coord! { x: -47.9, y: -15.8 };
        assert_eq!(r.coord(c).unwrap(), c);
    }

    #[test]
    fn round_trips_through_utm() {
        let there = Reprojector::new(PIPELINE_CRS, Crs::epsg(31983)).unwrap();
        let back = Reprojector::new(Crs::epsg(31983), PIPELINE_CRS).unwrap();
        let brasilia = coord! { x: -47.9292, y: -15.7801 };

        let projected = there.coord(brasilia).unwrap();
        assert!(projected.x > 100_000.0 && projected.x < 900_000.0);
        assert!(projected.y > 8_000_000.0);

        let restored = back.coord(projected).unwrap();
        assert!((restored.x - brasilia.x).abs() < 1e-6);
        assert!((restored.y - brasilia.y).abs() < 1e-6);
    }

    #[test]
    fn reprojected_extent_covers_corners() {
        let r = Reprojector::new(PIPELINE_CRS, Crs::epsg(3857)).unwrap();
        let rect = Rect::new(coord! { x: -50.0, y: -15.0 }, coord! { x: -45.0, y: -10.0 });
        let out = r.rect(rect).unwrap();
        let corner = r.coord(coord! { x: -50.0, y: -15.0 }).unwrap();
        assert!(out.min().x <= corner.x + 1e-6);
        assert!(out.min().y <= corner.y + 1e-6);
        assert!(out.max().x > out.min().x);
    }

    #[test]
    fn collection_keeps_attributes_and_count() {
        let collection = FeatureCollection::new(
            Schema::default(),
            PIPELINE_CRS,
            vec![Feature::new(square(-48.0, -16.0, 0.5), vec![])],
        );
        let out = reproject_collection(&collection, Crs::epsg(31983)).unwrap();
        assert_eq!(out.crs, Crs::epsg(31983));
        assert_eq!(out.len(), 1);
        assert!(out.features[0].geometry.0[0].exterior().0[0].x > 100_000.0);
    }
}
