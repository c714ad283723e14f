//! Page assembly.
//!
//! Concatenates downloaded pages, in ascending index order, into a single
//! [`FeatureCollection`]. The first page fixes the column set; later pages
//! may list the same columns in another order and may refine columns the
//! first page only saw as null, but any other difference is schema drift.

use geoharvest_feature_models::{
    AttributeValue, Crs, Feature, FeatureCollection, FieldType, ProcessingLog, ProcessingLogEntry,
    Schema,
};

use crate::ServiceError;
use crate::fetch::PageSet;
use crate::page::parse_features;

/// Log operation name.
pub const OPERATION: &str = "assemble_pages";

/// Assembles `pages` and removes the page directory afterwards, whether
/// or not assembly succeeded.
///
/// Geometries come back in the CRS the service declared on the first
/// page, or `requested_crs` when it declared none.
///
/// # Errors
///
/// * [`ServiceError::SchemaDrift`] if a page's columns differ from the
///   first page's.
/// * [`ServiceError::MalformedResponse`] if a stored page cannot be
///   decoded.
/// * [`ServiceError::Io`] if a page cannot be read.
pub async fn assemble(
    pages: PageSet,
    requested_crs: Crs,
    log: &ProcessingLog,
) -> Result<FeatureCollection, ServiceError> {
    let result = assemble_pages(&pages, requested_crs, log).await;
    if let Err(e) = pages.close() {
        log::warn!("Failed to remove page directory: {e}");
    }
    result
}

async fn assemble_pages(
    pages: &PageSet,
    requested_crs: Crs,
    log: &ProcessingLog,
) -> Result<FeatureCollection, ServiceError> {
    let mut schema: Option<Schema> = None;
    let mut crs: Option<Crs> = None;
    let mut features: Vec<Feature> = Vec::with_capacity(pages.total_features());
    let mut dropped = 0;

    for page in pages.pages() {
        let body = pages.read_page(page).await?;
        let parsed = parse_features(&body)?;
        dropped += parsed.dropped;

        match (crs, parsed.crs) {
            (None, found) => crs = found.or(Some(requested_crs)),
            (Some(current), Some(found)) if current != found => {
                log::warn!(
                    "Page {} declares {found} but page 0 declared {current}; keeping {current}",
                    page.index
                );
            }
            _ => {}
        }

        let Some(base) = schema.as_mut() else {
            schema = Some(parsed.schema);
            features.extend(parsed.features);
            continue;
        };

        let mut page_schema = parsed.schema;
        reconcile_text_dates(base, &mut page_schema);
        let mapping = base
            .align(&page_schema)
            .map_err(|mismatch| ServiceError::SchemaDrift {
                page: page.index,
                mismatch,
            })?;
        base.refine_from(&page_schema, &mapping);

        features.extend(parsed.features.into_iter().map(|f| {
            let attributes = mapping.iter().map(|&i| f.attribute(i).clone()).collect();
            Feature::new(f.geometry, attributes)
        }));
    }

    let schema = schema.unwrap_or_default();
    normalize_values(&schema, &mut features);

    let before = pages.total_features();
    let after = features.len();
    let summary = if dropped == 0 {
        format!("{} pages, {after} features", pages.len())
    } else {
        log::warn!("Dropped {dropped} features with non-polygonal or missing geometry");
        format!(
            "{} pages, {after} features ({dropped} non-polygonal dropped)",
            pages.len()
        )
    };
    log::info!("Assemble: {summary}");
    log.append(ProcessingLogEntry::counts(OPERATION, before, after, summary));

    Ok(FeatureCollection::new(
        schema,
        crs.unwrap_or(requested_crs),
        features,
    ))
}

/// A column inferred as a date on one page and as free text on another is
/// text on both.
fn reconcile_text_dates(base: &mut Schema, page: &mut Schema) {
    for field in &mut base.fields {
        let Some(other) = page.fields.iter_mut().find(|f| f.name == field.name) else {
            continue;
        };
        if matches!(
            (field.field_type, other.field_type),
            (FieldType::Date, FieldType::Text) | (FieldType::Text, FieldType::Date)
        ) {
            field.field_type = FieldType::Text;
            other.field_type = FieldType::Text;
        }
    }
}

/// Makes every value match its column's final type.
fn normalize_values(schema: &Schema, features: &mut [Feature]) {
    for feature in features {
        for (value, field) in feature.attributes.iter_mut().zip(&schema.fields) {
            match (field.field_type, &*value) {
                #[allow(clippy::cast_precision_loss)]
                (FieldType::Float, AttributeValue::Integer(i)) => {
                    *value = AttributeValue::Float(*i as f64);
                }
                (FieldType::Text, AttributeValue::Date(d)) => {
                    *value = AttributeValue::Text(d.format("%Y-%m-%d").to_string());
                }
                _ => {}
            }
        }
    }
}
