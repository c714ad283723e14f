//! Geometry repair.
//!
//! Each feature goes through two passes:
//!
//! 1. **Clean**: non-finite coordinates and repeated vertices are removed,
//!    rings are re-closed, and rings with fewer than three distinct
//!    coordinates are dropped. A polygon whose exterior is dropped is gone.
//! 2. **Resolve**: if the cleaned geometry is still invalid, every ring is
//!    split into simple loops at its self-intersections and the loops are
//!    combined with the even-odd rule, so both lobes of a bowtie survive.
//!    Overlapping parts of a multi-polygon are then unioned.
//!
//! Polygons with zero area after resolving are dropped, and so are features
//! left with no polygon. With [`RepairOptions::explode_multipart`], a
//! repaired multi-part geometry is split into one feature per part.

use geo::algorithm::line_intersection::{LineIntersection, line_intersection};
use geo::{
    Area as _, BooleanOps as _, Coord, Line, LineString, MultiPolygon, Polygon, Validation as _,
};
use geoharvest_feature_models::{Feature, FeatureCollection, ProcessingLog, ProcessingLogEntry};

use crate::{SpatialError, guarded};

/// Log operation name.
pub const OPERATION: &str = "repair_geometry";

/// Repair behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairOptions {
    /// Split repaired multi-part geometries into one feature per part.
    pub explode_multipart: bool,
}

#[derive(Debug, Default)]
struct RepairStats {
    invalid: usize,
    resolved: usize,
    dropped: usize,
}

/// Returns a repaired copy of `collection`.
///
/// Appends exactly one [`ProcessingLogEntry`] with the before/after counts.
///
/// # Errors
///
/// Returns [`SpatialError::RepairFailure`] if the overlay engine panics on a
/// feature. No log entry is appended in that case; the caller decides
/// whether to pass the input through.
pub fn repair(
    collection: &FeatureCollection,
    options: RepairOptions,
    log: &ProcessingLog,
) -> Result<FeatureCollection, SpatialError> {
    let before = collection.len();
    let mut stats = RepairStats::default();
    let mut features = Vec::with_capacity(before);

    for (idx, feature) in collection.features.iter().enumerate() {
        let repaired = guarded(|| repair_geometry(&feature.geometry, &mut stats)).map_err(|m| {
            SpatialError::RepairFailure {
                message: format!("feature {idx}: {m}"),
            }
        })?;

        let Some(geometry) = repaired else {
            stats.dropped += 1;
            continue;
        };

        if options.explode_multipart && geometry.0.len() > 1 {
            features.extend(
                geometry
                    .0
                    .into_iter()
                    .map(|p| Feature::new(MultiPolygon::new(vec![p]), feature.attributes.clone())),
            );
        } else {
            features.push(Feature::new(geometry, feature.attributes.clone()));
        }
    }

    let after = features.len();
    let summary = if stats.invalid == 0 && stats.dropped == 0 && after == before {
        format!("{before} features, all valid")
    } else {
        format!(
            "{before} -> {after} features ({} invalid, {} resolved, {} dropped)",
            stats.invalid, stats.resolved, stats.dropped
        )
    };
    log::info!("Repair: {summary}");
    log.append(ProcessingLogEntry::counts(OPERATION, before, after, summary));

    Ok(collection.with_features(features))
}

fn repair_geometry(
    geometry: &MultiPolygon<f64>,
    stats: &mut RepairStats,
) -> Option<MultiPolygon<f64>> {
    let cleaned = MultiPolygon::new(geometry.0.iter().filter_map(clean_polygon).collect());
    if cleaned == *geometry && has_area(&cleaned) && cleaned.is_valid() {
        return Some(cleaned);
    }
    stats.invalid += 1;

    let resolved = if cleaned.is_valid() {
        cleaned
    } else {
        resolve(&cleaned)
    };
    let resolved = MultiPolygon::new(
        resolved
            .0
            .into_iter()
            .filter(|p| p.unsigned_area() > 0.0)
            .collect(),
    );
    if resolved.0.is_empty() {
        return None;
    }
    stats.resolved += 1;
    Some(resolved)
}

fn has_area(geometry: &MultiPolygon<f64>) -> bool {
    !geometry.0.is_empty() && geometry.0.iter().all(|p| p.unsigned_area() > 0.0)
}

fn clean_polygon(polygon: &Polygon<f64>) -> Option<Polygon<f64>> {
    let exterior = clean_ring(polygon.exterior())?;
    let interiors = polygon.interiors().iter().filter_map(clean_ring).collect();
    Some(Polygon::new(exterior, interiors))
}

fn clean_ring(ring: &LineString<f64>) -> Option<LineString<f64>> {
    let mut coords: Vec<Coord<f64>> = Vec::with_capacity(ring.0.len());
    for c in ring.0.iter().filter(|c| c.x.is_finite() && c.y.is_finite()) {
        if coords.last() != Some(c) {
            coords.push(*c);
        }
    }
    if coords.len() > 1 && coords.first() == coords.last() {
        coords.pop();
    }
    if coords.len() < 3 {
        return None;
    }
    coords.push(coords[0]);
    Some(LineString::new(coords))
}

/// Even-odd fill of every polygon, then a union across polygons.
fn resolve(geometry: &MultiPolygon<f64>) -> MultiPolygon<f64> {
    let parts: Vec<MultiPolygon<f64>> = geometry.0.iter().map(even_odd).collect();
    match parts.as_slice() {
        [single] => single.clone(),
        _ => geo::unary_union(parts.iter().flat_map(|mp| mp.0.iter())),
    }
}

fn even_odd(polygon: &Polygon<f64>) -> MultiPolygon<f64> {
    std::iter::once(polygon.exterior())
        .chain(polygon.interiors())
        .flat_map(simple_loops)
        .map(|ring| Polygon::new(ring, vec![]))
        .filter(|p| p.unsigned_area() > 0.0)
        .fold(MultiPolygon::new(vec![]), |acc, lobe| acc.xor(&lobe))
}

/// Splits a closed ring into simple closed loops at the points where it
/// crosses or touches itself.
fn simple_loops(ring: &LineString<f64>) -> Vec<LineString<f64>> {
    let mut loops = Vec::new();
    let mut stack: Vec<Coord<f64>> = Vec::new();

    for c in node_ring(ring) {
        if let Some(k) = stack.iter().position(|s| *s == c) {
            let mut lobe = stack.split_off(k + 1);
            lobe.insert(0, c);
            lobe.push(c);
            if lobe.len() >= 4 {
                loops.push(LineString::new(lobe));
            }
        } else {
            stack.push(c);
        }
    }
    if stack.len() >= 3 {
        stack.push(stack[0]);
        loops.push(LineString::new(stack));
    }
    loops
}

/// Ring vertices plus every self-intersection point, in ring order,
/// without the closing coordinate.
fn node_ring(ring: &LineString<f64>) -> Vec<Coord<f64>> {
    let segments: Vec<Line<f64>> = ring.lines().collect();
    let n = segments.len();
    let mut splits: Vec<Vec<Coord<f64>>> = vec![Vec::new(); n];

    for i in 0..n {
        for j in (i + 1)..n {
            let adjacent = j == i + 1 || (i == 0 && j == n - 1);
            let hit = line_intersection(segments[i], segments[j]);
            let points = match hit {
                Some(LineIntersection::SinglePoint { intersection, .. }) => {
                    if adjacent {
                        continue;
                    }
                    vec![intersection]
                }
                Some(LineIntersection::Collinear { intersection }) => {
                    vec![intersection.start, intersection.end]
                }
                None => continue,
            };
            for p in points {
                splits[i].push(p);
                splits[j].push(p);
            }
        }
    }

    let mut noded = Vec::with_capacity(n * 2);
    for (segment, mut points) in segments.iter().zip(splits) {
        let start = segment.start;
        points.sort_by(|a, b| {
            let da = (a.x - start.x).powi(2) + (a.y - start.y).powi(2);
            let db = (b.x - start.x).powi(2) + (b.y - start.y).powi(2);
            da.total_cmp(&db)
        });
        noded.push(start);
        for p in points {
            if noded.last() != Some(&p) && p != segment.end {
                noded.push(p);
            }
        }
    }
    noded
}

/// Number of features whose geometry is invalid.
#[must_use]
pub fn count_invalid(collection: &FeatureCollection) -> usize {
    collection
        .features
        .iter()
        .filter(|f| !f.geometry.is_valid())
        .count()
}
