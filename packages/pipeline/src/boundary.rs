//! Cut boundary construction.

use std::path::Path;

use geo::Rect;
use geoharvest_feature_models::{Crs, CutBoundary, FeatureCollection, PIPELINE_CRS};
use geoharvest_service::page::parse_features;

use crate::StageError;
use crate::request::CutConfig;

/// Reads a `GeoJSON` boundary layer. Files without a `crs` member are
/// taken to be in the pipeline CRS.
///
/// # Errors
///
/// Returns [`StageError::Io`] if the file cannot be read and
/// [`StageError::Service`] if it is not a polygon feature collection.
pub async fn read_layer(path: &Path) -> Result<FeatureCollection, StageError> {
    let body = tokio::fs::read_to_string(path).await?;
    let parsed = parse_features(&body)?;
    if parsed.dropped > 0 {
        log::warn!(
            "Ignored {} non-polygon features in {}",
            parsed.dropped,
            path.display()
        );
    }
    let crs = parsed.crs.unwrap_or(PIPELINE_CRS);
    log::info!(
        "Loaded boundary {} ({} features, {crs})",
        path.display(),
        parsed.features.len()
    );
    Ok(FeatureCollection::new(parsed.schema, crs, parsed.features))
}

/// Builds the [`CutBoundary`] for `cut`.
///
/// `layer` is the boundary layer for file and service cuts; it is ignored
/// for rectangles. A layer with a unit selection becomes
/// [`CutBoundary::Unit`]; otherwise a service layer is used in
/// [`full`](CutBoundary::Full) and a file layer as an
/// [`external`](CutBoundary::External) mask.
///
/// # Errors
///
/// Returns [`StageError::Config`] if a file or service cut has no layer.
pub fn cut_boundary(
    cut: &CutConfig,
    layer: Option<FeatureCollection>,
) -> Result<CutBoundary, StageError> {
    if let Some((rect, crs)) = cut.rect() {
        return Ok(CutBoundary::Rectangle { rect, crs });
    }
    let layer = layer.ok_or_else(|| StageError::Config {
        message: "cut boundary layer was not loaded".to_string(),
    })?;
    Ok(match (cut, cut.unit()) {
        (_, Some((field, value))) => CutBoundary::Unit {
            boundary: layer,
            field: field.to_string(),
            value: value.to_string(),
        },
        (CutConfig::Service { .. }, None) => CutBoundary::Full(layer),
        (_, None) => CutBoundary::External(layer),
    })
}

/// Bounding rectangle of a prepared mask, or `None` when the mask is empty.
#[must_use]
pub fn mask_extent(mask: &FeatureCollection) -> Option<(Rect<f64>, Crs)> {
    mask.bounding_rect().map(|rect| (rect, mask.crs))
}
