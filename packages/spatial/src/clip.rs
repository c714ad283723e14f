//! Clipping a layer to a boundary mask.
//!
//! The mask is dissolved once into a single multipolygon whose parts are
//! loaded into an R-tree. Each feature is then intersected only with the
//! parts whose envelopes touch its own.

use geo::{Area as _, BooleanOps as _, MultiPolygon, Polygon};
use geoharvest_feature_models::{
    Crs, CutBoundary, Feature, FeatureCollection, ProcessingLog, ProcessingLogEntry,
};
use rstar::{AABB, RTree, RTreeObject};

use crate::reproject::reproject_collection;
use crate::{SpatialError, envelope_of, guarded, reduction_pct};

/// Log operation name.
pub const OPERATION: &str = "clip_to_boundary";

/// One part of the dissolved mask.
struct MaskPart {
    envelope: AABB<[f64; 2]>,
    polygon: Polygon<f64>,
}

impl RTreeObject for MaskPart {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

/// Resolves a [`CutBoundary`] into a mask collection in `target`
/// coordinates.
///
/// # Errors
///
/// Returns [`SpatialError::Boundary`] if a unit selection fails, or a
/// reprojection error if the boundary CRS cannot be transformed.
pub fn prepare_mask(
    boundary: &CutBoundary,
    target: Crs,
) -> Result<FeatureCollection, SpatialError> {
    let mask = boundary.to_collection()?;
    log::debug!(
        "Prepared clip mask from {}: {} features",
        boundary.describe(),
        mask.len()
    );
    reproject_collection(&mask, target)
}

/// Returns the parts of `data` that fall inside `mask`.
///
/// Attributes are carried unchanged. Features that end up with no area
/// are dropped. An empty `data` or an empty `mask` yields an empty
/// collection with the data schema.
///
/// # Errors
///
/// Returns [`SpatialError::ClipFailure`] if the CRSs differ or the overlay
/// engine panics.
pub fn clip(
    data: &FeatureCollection,
    mask: &FeatureCollection,
    log: &ProcessingLog,
) -> Result<FeatureCollection, SpatialError> {
    if data.crs != mask.crs {
        return Err(SpatialError::ClipFailure {
            message: format!("data is in {} but mask is in {}", data.crs, mask.crs),
        });
    }

    let before = data.len();
    if data.is_empty() || mask.is_empty() {
        let summary = if data.is_empty() {
            "no features to clip".to_string()
        } else {
            format!("mask is empty, {before} features removed")
        };
        log::warn!("Clip: {summary}");
        log.append(ProcessingLogEntry::counts(OPERATION, before, 0, summary));
        return Ok(data.with_features(Vec::new()));
    }

    let features = guarded(|| clip_features(data, mask))
        .map_err(|message| SpatialError::ClipFailure { message })?;

    let after = features.len();
    let summary = format!(
        "{before} -> {after} features ({:.1}% removed)",
        reduction_pct(before, after)
    );
    log::info!("Clip: {summary}");
    log.append(ProcessingLogEntry::counts(OPERATION, before, after, summary));

    Ok(data.with_features(features))
}

fn build_index(mask: &FeatureCollection) -> RTree<MaskPart> {
    let dissolved = geo::unary_union(mask.features.iter().map(|f| &f.geometry));
    let parts = dissolved
        .0
        .into_iter()
        .filter_map(|polygon| {
            let envelope = envelope_of(&MultiPolygon::new(vec![polygon.clone()]))?;
            Some(MaskPart { envelope, polygon })
        })
        .collect();
    RTree::bulk_load(parts)
}

fn clip_features(data: &FeatureCollection, mask: &FeatureCollection) -> Vec<Feature> {
    let index = build_index(mask);
    log::debug!("Clip mask dissolved into {} parts", index.size());

    data.features
        .iter()
        .filter_map(|feature| {
            let envelope = envelope_of(&feature.geometry)?;
            let candidates: Vec<Polygon<f64>> = index
                .locate_in_envelope_intersecting(&envelope)
                .map(|part| part.polygon.clone())
                .collect();
            if candidates.is_empty() {
                return None;
            }

            let clipped = feature.geometry.intersection(&MultiPolygon::new(candidates));
            let clipped = MultiPolygon::new(
                clipped
                    .0
                    .into_iter()
                    .filter(|p| p.unsigned_area() > 0.0)
                    .collect(),
            );
            if clipped.0.is_empty() {
                None
            } else {
                Some(Feature::new(clipped, feature.attributes.clone()))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use geo::{Area as _, Rect, coord};
    use geoharvest_feature_models::{ChangeKind, PIPELINE_CRS};

    use super::*;
    use crate::test_utils::{layer, square};

    #[test]
    fn keeps_only_the_inside_portion() {
        let data = layer(vec![
            (square(0.0, 0.0, 10.0), "straddles"),
            (square(20.0, 20.0, 2.0), "outside"),
            (square(2.0, 2.0, 1.0), "inside"),
        ]);
        let mask = layer(vec![(square(5.0, 0.0, 10.0), "mask")]);
        let log = ProcessingLog::new();
        let out = clip(&data, &mask, &log).unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out.features[0].attributes, data.features[0].attributes);
        assert!((out.features[0].geometry.unsigned_area() - 50.0).abs() < 1e-9);

        let entry = log.last().unwrap();
        assert_eq!(entry.operation, OPERATION);
        assert_eq!((entry.before, entry.after), (Some(3), Some(1)));
        assert_eq!(entry.change, Some(ChangeKind::Loss));
    }

    #[test]
    fn overlapping_mask_parts_do_not_duplicate_area() {
        let data = layer(vec![(square(0.0, 0.0, 10.0), "a")]);
        let mask = layer(vec![
            (square(0.0, 0.0, 6.0), "m1"),
            (square(4.0, 0.0, 6.0), "m2"),
        ]);
        let out = clip(&data, &mask, &ProcessingLog::new()).unwrap();

        assert_eq!(out.len(), 1);
        assert!((out.features[0].geometry.unsigned_area() - 60.0).abs() < 1e-9);
    }

    #[test]
    fn empty_mask_yields_empty_collection() {
        let data = layer(vec![(square(0.0, 0.0, 1.0), "a")]);
        let mask = layer(vec![]);
        let log = ProcessingLog::new();
        let out = clip(&data, &mask, &log).unwrap();

        assert!(out.is_empty());
        assert_eq!(out.schema, data.schema);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn empty_data_is_a_no_op() {
        let data = layer(vec![]);
        let mask = layer(vec![(square(0.0, 0.0, 1.0), "m")]);
        let log = ProcessingLog::new();
        let out = clip(&data, &mask, &log).unwrap();

        assert!(out.is_empty());
        assert_eq!(log.last().unwrap().change, Some(ChangeKind::NoOp));
    }

    #[test]
    fn crs_mismatch_is_rejected() {
        let data = layer(vec![(square(0.0, 0.0, 1.0), "a")]);
        let mut mask = layer(vec![(square(0.0, 0.0, 1.0), "m")]);
        mask.crs = Crs::epsg(31983);
        assert!(matches!(
            clip(&data, &mask, &ProcessingLog::new()),
            Err(SpatialError::ClipFailure { .. })
        ));
    }

    #[test]
    fn rectangle_boundary_becomes_a_mask() {
        let boundary = CutBoundary::Rectangle {
            rect: Rect::new(coord! { x: -50.0, y: -10.0 }, coord! { x: -45.0, y: -5.0 }),
            crs: PIPELINE_CRS,
        };
        let mask = prepare_mask(&boundary, PIPELINE_CRS).unwrap();
        assert_eq!(mask.len(), 1);
        assert_eq!(mask.crs, PIPELINE_CRS);
        assert!((mask.total_area() - 25.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_unit_field_is_a_boundary_error() {
        let boundary = CutBoundary::Unit {
            boundary: layer(vec![(square(0.0, 0.0, 1.0), "PA")]),
            field: "uf".to_string(),
            value: "PA".to_string(),
        };
        assert!(matches!(
            prepare_mask(&boundary, PIPELINE_CRS),
            Err(SpatialError::Boundary(_))
        ));
    }
}
