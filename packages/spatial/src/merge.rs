//! Layer merge and dissolve.

use std::collections::BTreeMap;

use geo::{Area as _, BooleanOps as _, MultiPolygon};
use geoharvest_feature_models::{
    AttributeValue, Feature, FeatureCollection, FieldType, ProcessingLog, ProcessingLogEntry,
};

use crate::{SpatialError, guarded};

/// Log operation name for [`merge`].
pub const MERGE_OPERATION: &str = "merge_layers";

/// Log operation name for [`dissolve`].
pub const DISSOLVE_OPERATION: &str = "dissolve";

/// Concatenates `layers` into one collection.
///
/// The output schema is the union of the input schemas, in first-seen
/// order; columns a layer lacks are filled with `Null`. Integer values
/// in a column that widened to float are converted.
///
/// # Errors
///
/// * [`SpatialError::NothingToMerge`] for an empty slice.
/// * [`SpatialError::CrsMismatch`] if the layers disagree on CRS.
/// * [`SpatialError::Schema`] if a shared column has incompatible types.
pub fn merge(
    layers: &[FeatureCollection],
    log: &ProcessingLog,
) -> Result<FeatureCollection, SpatialError> {
    let Some(first) = layers.first() else {
        return Err(SpatialError::NothingToMerge);
    };

    let mut schema = first.schema.clone();
    for layer in &layers[1..] {
        if layer.crs != first.crs {
            return Err(SpatialError::CrsMismatch {
                expected: first.crs,
                found: layer.crs,
            });
        }
        schema = schema.union(&layer.schema)?;
    }

    let mut features = Vec::with_capacity(layers.iter().map(FeatureCollection::len).sum());
    for layer in layers {
        let mapping: Vec<Option<usize>> = schema
            .fields
            .iter()
            .map(|f| layer.schema.index_of(&f.name))
            .collect();
        features.extend(layer.features.iter().map(|feature| {
            let attributes = mapping
                .iter()
                .zip(&schema.fields)
                .map(|(idx, field)| {
                    idx.map_or(AttributeValue::Null, |i| {
                        widen(feature.attribute(i).clone(), field.field_type)
                    })
                })
                .collect();
            Feature::new(feature.geometry.clone(), attributes)
        }));
    }

    let inputs: Vec<String> = layers.iter().map(|l| l.len().to_string()).collect();
    let before: usize = layers.iter().map(FeatureCollection::len).sum();
    let summary = format!(
        "{} layers ({}) -> {} features",
        layers.len(),
        inputs.join(" + "),
        features.len()
    );
    log::info!("Merge: {summary}");
    log.append(ProcessingLogEntry::counts(
        MERGE_OPERATION,
        before,
        features.len(),
        summary,
    ));

    Ok(FeatureCollection::new(schema, first.crs, features))
}

fn widen(value: AttributeValue, target: FieldType) -> AttributeValue {
    match (value, target) {
        #[allow(clippy::cast_precision_loss)]
        (AttributeValue::Integer(i), FieldType::Float) => AttributeValue::Float(i as f64),
        (v, _) => v,
    }
}

/// Dissolve behaviour.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DissolveOptions {
    /// Field whose distinct values each produce one output feature. With
    /// no field the whole layer dissolves into one feature.
    pub group_by: Option<String>,
    /// Split each dissolved result into one feature per polygon part.
    pub single_part: bool,
}

/// Unions overlapping and adjacent polygons.
///
/// Each geometry is first cleaned by a self-union, then the members of
/// each group are unioned together. Output attributes come from the first
/// member of each group; groups appear in first-seen order.
///
/// # Errors
///
/// * [`SpatialError::UnknownField`] if `group_by` is not in the schema.
/// * [`SpatialError::DissolveFailure`] if the overlay engine panics.
pub fn dissolve(
    collection: &FeatureCollection,
    options: &DissolveOptions,
    log: &ProcessingLog,
) -> Result<FeatureCollection, SpatialError> {
    let group_idx = match &options.group_by {
        Some(field) => Some(
            collection
                .schema
                .index_of(field)
                .ok_or_else(|| SpatialError::UnknownField(field.clone()))?,
        ),
        None => None,
    };

    let before = collection.len();
    let features = guarded(|| dissolve_features(collection, group_idx, options.single_part))
        .map_err(|message| SpatialError::DissolveFailure { message })?;

    let after = features.len();
    let summary = match &options.group_by {
        Some(field) => format!("{before} -> {after} features grouped by \"{field}\""),
        None => format!("{before} -> {after} features"),
    };
    log::info!("Dissolve: {summary}");
    log.append(ProcessingLogEntry::counts(
        DISSOLVE_OPERATION,
        before,
        after,
        summary,
    ));

    Ok(collection.with_features(features))
}

fn dissolve_features(
    collection: &FeatureCollection,
    group_idx: Option<usize>,
    single_part: bool,
) -> Vec<Feature> {
    // group key -> member indices, keys kept in first-seen order
    let mut order: Vec<String> = Vec::new();
    let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (i, feature) in collection.features.iter().enumerate() {
        let key = group_idx.map_or_else(String::new, |idx| feature.attribute(idx).to_string());
        let members = groups.entry(key.clone()).or_default();
        if members.is_empty() {
            order.push(key);
        }
        members.push(i);
    }

    let mut out = Vec::with_capacity(order.len());
    for key in order {
        let members = &groups[&key];
        // Self-union of each member, the zero-distance buffer step.
        let cleaned: Vec<MultiPolygon<f64>> = members
            .iter()
            .map(|&i| geo::unary_union(collection.features[i].geometry.0.iter()))
            .collect();
        let dissolved = cleaned
            .iter()
            .skip(1)
            .fold(cleaned[0].clone(), |acc, mp| acc.union(mp));
        let dissolved = MultiPolygon::new(
            dissolved
                .0
                .into_iter()
                .filter(|p| p.unsigned_area() > 0.0)
                .collect(),
        );
        if dissolved.0.is_empty() {
            continue;
        }

        let attributes = &collection.features[members[0]].attributes;
        if single_part {
            out.extend(
                dissolved
                    .0
                    .into_iter()
                    .map(|p| Feature::new(MultiPolygon::new(vec![p]), attributes.clone())),
            );
        } else {
            out.push(Feature::new(dissolved, attributes.clone()));
        }
    }
    out
}
