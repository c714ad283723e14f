//! Parsing of raw `GetFeature` response bodies.
//!
//! The fetcher only needs a cheap [`summarize`] per page (feature count and
//! the server's match count); full decoding into typed features happens in
//! [`parse_features`] during assembly.

use std::sync::LazyLock;

use geo::MultiPolygon;
use geoharvest_feature_models::{AttributeValue, Crs, Feature, FieldDef, FieldType, Schema};
use geojson::GeoJson;
use regex::Regex;
use serde_json::Value;

use crate::ServiceError;

/// Bodies shorter than this are checked for exception markers.
pub const EXCEPTION_PROBE_LEN: usize = 1024;

const EXCEPTION_MARKERS: &[&str] = &["ExceptionReport", "ServiceException"];

static EXCEPTION_TEXT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<(?:[A-Za-z0-9_]+:)?(?:ExceptionText|ServiceException)[^>]*>(.*?)</")
        .expect("valid regex")
});

static HITS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:numberMatched|numberOfFeatures)="([0-9]+)""#).expect("valid regex")
});

/// What the fetcher needs to know about a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSummary {
    /// Features on this page.
    pub feature_count: usize,
    /// Total matches reported by the server (`numberMatched` or
    /// `totalFeatures`), if any.
    pub number_matched: Option<u64>,
}

/// A page decoded into typed features.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPage {
    /// Schema inferred from the page's properties.
    pub schema: Schema,
    /// Polygonal features, attributes aligned with `schema`.
    pub features: Vec<Feature>,
    /// Features skipped because their geometry was missing or not polygonal.
    pub dropped: usize,
    /// CRS declared in the body, if any.
    pub crs: Option<Crs>,
}

/// Returns the exception text if a short body is a service exception
/// report rather than a feature collection.
#[must_use]
pub fn detect_exception(body: &str) -> Option<String> {
    if body.len() >= EXCEPTION_PROBE_LEN || !EXCEPTION_MARKERS.iter().any(|m| body.contains(m)) {
        return None;
    }

    let message = EXCEPTION_TEXT_RE
        .captures(body)
        .and_then(|c| c.get(1))
        .map_or_else(|| body.trim().to_string(), |m| m.as_str().trim().to_string());
    Some(message)
}

/// Reads the feature count and server match count of a page.
///
/// # Errors
///
/// Returns [`ServiceError::MalformedResponse`] if the body is not a JSON
/// feature collection.
pub fn summarize(body: &str) -> Result<PageSummary, ServiceError> {
    let value: Value = serde_json::from_str(body).map_err(|e| ServiceError::MalformedResponse {
        message: format!("page is not JSON: {e}"),
    })?;
    let features = value
        .get("features")
        .and_then(Value::as_array)
        .ok_or_else(|| ServiceError::MalformedResponse {
            message: "page has no \"features\" array".to_string(),
        })?;
    Ok(PageSummary {
        feature_count: features.len(),
        number_matched: number_matched(&value),
    })
}

/// Reads the match count from a `resultType=hits` response, which servers
/// answer either as JSON or as an XML root element with attributes.
#[must_use]
pub fn parse_hits(body: &str) -> Option<u64> {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        return number_matched(&value);
    }
    HITS_RE
        .captures(body)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn number_matched(value: &Value) -> Option<u64> {
    ["numberMatched", "totalFeatures"]
        .iter()
        .find_map(|key| value.get(key).and_then(Value::as_u64))
}

/// Decodes a page into polygonal features with an inferred schema.
///
/// # Errors
///
/// Returns [`ServiceError::MalformedResponse`] if the body is not a
/// `GeoJSON` feature collection.
pub fn parse_features(body: &str) -> Result<ParsedPage, ServiceError> {
    let value: Value = serde_json::from_str(body).map_err(|e| ServiceError::MalformedResponse {
        message: format!("page is not JSON: {e}"),
    })?;
    let collection = match GeoJson::from_json_value(value) {
        Ok(GeoJson::FeatureCollection(fc)) => fc,
        Ok(_) => {
            return Err(ServiceError::MalformedResponse {
                message: "page is not a FeatureCollection".to_string(),
            });
        }
        Err(e) => {
            return Err(ServiceError::MalformedResponse {
                message: format!("invalid GeoJSON: {e}"),
            });
        }
    };

    let crs = collection
        .foreign_members
        .as_ref()
        .and_then(|m| m.get("crs"))
        .and_then(|c| c.pointer("/properties/name"))
        .and_then(Value::as_str)
        .and_then(|name| name.parse().ok());

    let mut dropped = 0;
    let mut rows: Vec<(MultiPolygon<f64>, serde_json::Map<String, Value>)> =
        Vec::with_capacity(collection.features.len());
    for feature in collection.features {
        let Some(geometry) = feature.geometry.and_then(to_multipolygon) else {
            dropped += 1;
            continue;
        };
        rows.push((geometry, feature.properties.unwrap_or_default()));
    }

    let schema = infer_schema(rows.iter().map(|(_, props)| props));
    let features = rows
        .into_iter()
        .map(|(geometry, mut props)| {
            let attributes = schema
                .fields
                .iter()
                .map(|field| {
                    props
                        .remove(&field.name)
                        .map_or(AttributeValue::Null, |v| convert(v, field.field_type))
                })
                .collect();
            Feature::new(geometry, attributes)
        })
        .collect();

    Ok(ParsedPage {
        schema,
        features,
        dropped,
        crs,
    })
}

fn to_multipolygon(geometry: geojson::Geometry) -> Option<MultiPolygon<f64>> {
    let geometry: geo::Geometry<f64> = geometry.try_into().ok()?;
    match geometry {
        geo::Geometry::MultiPolygon(mp) => Some(mp),
        geo::Geometry::Polygon(p) => Some(MultiPolygon::new(vec![p])),
        _ => None,
    }
}

// ── Schema inference ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RawKind {
    Bool,
    Integer,
    Float,
    DateText,
    Text,
}

fn raw_kind(value: &Value) -> Option<RawKind> {
    match value {
        Value::Null => None,
        Value::Bool(_) => Some(RawKind::Bool),
        Value::Number(n) if n.is_i64() || n.is_u64() => Some(RawKind::Integer),
        Value::Number(_) => Some(RawKind::Float),
        Value::String(s) if AttributeValue::parse_date(s).is_some() => Some(RawKind::DateText),
        Value::String(_) | Value::Array(_) | Value::Object(_) => Some(RawKind::Text),
    }
}

const fn widen(current: FieldType, kind: RawKind) -> FieldType {
    match (current, kind) {
        (FieldType::Unknown, RawKind::Bool) | (FieldType::Bool, RawKind::Bool) => FieldType::Bool,
        (FieldType::Unknown, RawKind::Integer) | (FieldType::Integer, RawKind::Integer) => {
            FieldType::Integer
        }
        (FieldType::Unknown | FieldType::Integer | FieldType::Float, RawKind::Float)
        | (FieldType::Float, RawKind::Integer) => FieldType::Float,
        (FieldType::Unknown, RawKind::DateText) | (FieldType::Date, RawKind::DateText) => {
            FieldType::Date
        }
        _ => FieldType::Text,
    }
}

fn infer_schema<'a>(rows: impl Iterator<Item = &'a serde_json::Map<String, Value>>) -> Schema {
    let mut fields: Vec<FieldDef> = Vec::new();
    for props in rows {
        for (name, value) in props {
            let idx = match fields.iter().position(|f| f.name == *name) {
                Some(idx) => idx,
                None => {
                    fields.push(FieldDef::new(name.clone(), FieldType::Unknown));
                    fields.len() - 1
                }
            };
            if let Some(kind) = raw_kind(value) {
                fields[idx].field_type = widen(fields[idx].field_type, kind);
            }
        }
    }
    Schema::new(fields)
}

fn convert(value: Value, field_type: FieldType) -> AttributeValue {
    match (field_type, value) {
        (_, Value::Null) | (FieldType::Unknown, _) => AttributeValue::Null,
        (FieldType::Bool, Value::Bool(b)) => AttributeValue::Bool(b),
        (FieldType::Integer, Value::Number(n)) => n
            .as_i64()
            .map_or(AttributeValue::Null, AttributeValue::Integer),
        (FieldType::Float, Value::Number(n)) => {
            n.as_f64().map_or(AttributeValue::Null, AttributeValue::Float)
        }
        (FieldType::Date, Value::String(s)) => {
            AttributeValue::parse_date(&s).map_or(AttributeValue::Text(s), AttributeValue::Date)
        }
        (_, Value::String(s)) => AttributeValue::Text(s),
        (_, other) => AttributeValue::Text(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    const PAGE: &str = r#"{
        "type": "FeatureCollection",
        "numberMatched": 3,
        "crs": {"type": "name", "properties": {"name": "urn:ogc:def:crs:EPSG::4674"}},
        "features": [
            {"type": "Feature", "geometry": {"type": "Polygon", "coordinates": [[[0,0],[1,0],[1,1],[0,0]]]},
             "properties": {"year": 2020, "area_km": 1.5, "image_date": "2020-07-01Z", "uf": "MT", "note": null}},
            {"type": "Feature", "geometry": {"type": "MultiPolygon", "coordinates": [[[[0,0],[2,0],[2,2],[0,0]]]]},
             "properties": {"year": 2021, "area_km": 2, "image_date": "2021-07-01", "uf": 51, "note": null}},
            {"type": "Feature", "geometry": {"type": "Point", "coordinates": [0, 0]},
             "properties": {"year": 2022}}
        ]
    }"#;

    #[test]
    fn detects_exception_reports() {
        let body = r#"<?xml version="1.0"?><ows:ExceptionReport><ows:Exception exceptionCode="InvalidParameterValue"><ows:ExceptionText>Illegal value for startIndex</ows:ExceptionText></ows:Exception></ows:ExceptionReport>"#;
        assert_eq!(
            detect_exception(body).as_deref(),
            Some("Illegal value for startIndex")
        );
        assert_eq!(detect_exception(PAGE), None);
    }

    #[test]
    fn short_legacy_exception_and_hits_reports() {
        let body = "<ServiceExceptionReport><ServiceException>boom</ServiceException></ServiceExceptionReport>";
        assert_eq!(detect_exception(body).as_deref(), Some("boom"));
        assert_eq!(
            parse_hits(r#"<wfs:FeatureCollection numberOfFeatures="7"/>"#),
            Some(7)
        );
        assert_eq!(parse_hits("<wfs:FeatureCollection/>"), None);
    }

    #[test]
    fn large_bodies_are_not_probed() {
        let body = format!("ServiceException{}", " ".repeat(EXCEPTION_PROBE_LEN));
        assert_eq!(detect_exception(&body), None);
    }

    #[test]
    fn summarizes_count_and_matches() {
        let summary = summarize(PAGE).unwrap();
        assert_eq!(summary.feature_count, 3);
        assert_eq!(summary.number_matched, Some(3));
        assert!(matches!(
            summarize("<html/>"),
            Err(ServiceError::MalformedResponse { .. })
        ));
    }

    #[test]
    fn parses_hits_in_both_encodings() {
        assert_eq!(parse_hits(r#"{"totalFeatures": 42, "features": []}"#), Some(42));
        assert_eq!(
            parse_hits(r#"<wfs:FeatureCollection numberMatched="51200" numberReturned="0"/>"#),
            Some(51_200)
        );
    }

    #[test]
    fn parses_polygons_and_infers_types() {
        let page = parse_features(PAGE).unwrap();
        assert_eq!(page.features.len(), 2);
        assert_eq!(page.dropped, 1);
        assert_eq!(page.crs, Some(Crs::epsg(4674)));

        let ty = |name: &str| page.schema.field(name).unwrap().field_type;
        assert_eq!(ty("year"), FieldType::Integer);
        assert_eq!(ty("area_km"), FieldType::Float);
        assert_eq!(ty("image_date"), FieldType::Date);
        assert_eq!(ty("uf"), FieldType::Text);
        assert_eq!(ty("note"), FieldType::Unknown);

        let date_idx = page.schema.index_of("image_date").unwrap();
        assert_eq!(
            page.features[0].attributes[date_idx],
            AttributeValue::Date(NaiveDate::from_ymd_opt(2020, 7, 1).unwrap())
        );
        let uf_idx = page.schema.index_of("uf").unwrap();
        assert_eq!(
            page.features[1].attributes[uf_idx],
            AttributeValue::Text("51".to_string())
        );
        let area_idx = page.schema.index_of("area_km").unwrap();
        assert_eq!(page.features[1].attributes[area_idx], AttributeValue::Float(2.0));
    }
}
