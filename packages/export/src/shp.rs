//! ESRI Shapefile writer.
//!
//! Rings follow the Shapefile winding convention (exterior clockwise,
//! holes counter-clockwise). Attribute columns map onto dBase types:
//!
//! | Column    | dBase field        |
//! |-----------|--------------------|
//! | `Integer` | numeric(18, 0)     |
//! | `Float`   | numeric(19, 8)     |
//! | `Text`    | character(longest) |
//! | `Date`    | date               |
//! | `Bool`    | logical            |
//! | `Unknown` | character(1)       |
//!
//! Text is stored as UTF-8 and a `.cpg` file says so.

use std::path::{Path, PathBuf};

use chrono::Datelike as _;
use geo::MultiPolygon;
use geoharvest_feature_models::{AttributeValue, Feature, FeatureCollection, FieldType};
use shapefile::dbase::{self, FieldName, FieldValue, Record, TableWriterBuilder};

use crate::fields::dbase_names;
use crate::stage::{Stage, stem};
use crate::{ExportError, ExportFormat, prj};

/// Widest dBase character field.
const MAX_TEXT_WIDTH: usize = 254;

/// Code page declared in the `.cpg` sidecar.
pub const CODE_PAGE: &str = "UTF-8";

const FORMAT: ExportFormat = ExportFormat::Shapefile;

struct Column {
    name: String,
    field_type: FieldType,
    width: usize,
}

/// Writes the Shapefile bundle for `collection` at `dest` (the `.shp`
/// path) and returns the files created.
///
/// # Errors
///
/// Returns [`ExportError::Write`] on I/O failure and
/// [`ExportError::Encode`] if the encoder rejects the data.
pub fn write(collection: &FeatureCollection, dest: &Path) -> Result<Vec<PathBuf>, ExportError> {
    let stage = Stage::for_destination(dest)?;
    let stem = stem(dest)?;
    let columns = columns(collection);

    let shp_name = format!("{stem}.shp");
    let mut files = vec![
        shp_name.clone(),
        format!("{stem}.shx"),
        format!("{stem}.dbf"),
    ];

    {
        let mut writer = shapefile::Writer::from_path(stage.path(&shp_name), table(&columns)?)
            .map_err(|e| shapefile_error(dest, e))?;
        let mut skipped = 0usize;
        for feature in &collection.features {
            if feature.geometry.0.is_empty() {
                skipped += 1;
                continue;
            }
            writer
                .write_shape_and_record(&to_shape(&feature.geometry), &to_record(feature, &columns))
                .map_err(|e| shapefile_error(dest, e))?;
        }
        if skipped > 0 {
            log::warn!("Skipped {skipped} features with empty geometry");
        }
    }

    if let Some(wkt) = prj::wkt(collection.crs) {
        let name = format!("{stem}.prj");
        std::fs::write(stage.path(&name), wkt).map_err(|e| ExportError::write(dest, e))?;
        files.push(name);
    } else {
        log::warn!("No .prj definition for {}; writing without one", collection.crs);
    }

    let cpg = format!("{stem}.cpg");
    std::fs::write(stage.path(&cpg), CODE_PAGE).map_err(|e| ExportError::write(dest, e))?;
    files.push(cpg);

    stage.commit(&files)
}

fn shapefile_error(dest: &Path, error: shapefile::Error) -> ExportError {
    match error {
        shapefile::Error::IoError(e) => ExportError::write(dest, e),
        other => ExportError::encode(FORMAT, other),
    }
}

fn columns(collection: &FeatureCollection) -> Vec<Column> {
    let names = dbase_names(collection.schema.names());
    collection
        .schema
        .fields
        .iter()
        .zip(names)
        .enumerate()
        .map(|(idx, (field, name))| {
            let width = match field.field_type {
                FieldType::Text => collection
                    .features
                    .iter()
                    .map(|f| text_of(f.attribute(idx)).map_or(0, str::len))
                    .max()
                    .unwrap_or(0)
                    .clamp(1, MAX_TEXT_WIDTH),
                _ => 1,
            };
            Column {
                name,
                field_type: field.field_type,
                width,
            }
        })
        .collect()
}

fn table(columns: &[Column]) -> Result<TableWriterBuilder, ExportError> {
    columns.iter().try_fold(TableWriterBuilder::new(), |table, column| {
        let name = FieldName::try_from(column.name.as_str())
            .map_err(|e| ExportError::encode(FORMAT, format!("field {}: {e:?}", column.name)))?;
        Ok(match column.field_type {
            FieldType::Integer => table.add_numeric_field(name, 18, 0),
            FieldType::Float => table.add_numeric_field(name, 19, 8),
            FieldType::Date => table.add_date_field(name),
            FieldType::Bool => table.add_logical_field(name),
            FieldType::Text | FieldType::Unknown => {
                #[allow(clippy::cast_possible_truncation)]
                let width = column.width as u8;
                table.add_character_field(name, width)
            }
        })
    })
}

fn text_of(value: &AttributeValue) -> Option<&str> {
    match value {
        AttributeValue::Text(s) => Some(s),
        _ => None,
    }
}

fn truncate(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

fn to_record(feature: &Feature, columns: &[Column]) -> Record {
    let mut record = Record::default();
    for (idx, column) in columns.iter().enumerate() {
        let value = feature.attribute(idx);
        let field = match column.field_type {
            FieldType::Integer | FieldType::Float => FieldValue::Numeric(value.as_f64()),
            FieldType::Date => FieldValue::Date(value.as_date().and_then(|d| {
                u32::try_from(d.year())
                    .ok()
                    .map(|year| dbase::Date::new(d.day(), d.month(), year))
            })),
            FieldType::Bool => FieldValue::Logical(match value {
                AttributeValue::Bool(b) => Some(*b),
                _ => None,
            }),
            FieldType::Text => FieldValue::Character(match value {
                AttributeValue::Null => None,
                AttributeValue::Text(s) => Some(truncate(s, column.width)),
                other => Some(truncate(&other.to_string(), column.width)),
            }),
            FieldType::Unknown => FieldValue::Character(None),
        };
        record.insert(column.name.clone(), field);
    }
    record
}

/// Twice the signed area of a ring; positive when counter-clockwise.
fn signed_area2(points: &[shapefile::Point]) -> f64 {
    points
        .windows(2)
        .map(|w| w[0].x.mul_add(w[1].y, -(w[1].x * w[0].y)))
        .sum()
}

fn ring(coords: impl Iterator<Item = geo::Coord<f64>>, clockwise: bool) -> Vec<shapefile::Point> {
    let mut points: Vec<shapefile::Point> =
        coords.map(|c| shapefile::Point::new(c.x, c.y)).collect();
    if let (Some(first), Some(last)) = (points.first().copied(), points.last().copied())
        && (first.x != last.x || first.y != last.y)
    {
        points.push(first);
    }
    let is_clockwise = signed_area2(&points) < 0.0;
    if is_clockwise != clockwise {
        points.reverse();
    }
    points
}

fn to_shape(geometry: &MultiPolygon<f64>) -> shapefile::Polygon {
    let mut rings = Vec::new();
    for polygon in &geometry.0 {
        rings.push(shapefile::PolygonRing::Outer(ring(
            polygon.exterior().coords().copied(),
            true,
        )));
        for hole in polygon.interiors() {
            rings.push(shapefile::PolygonRing::Inner(ring(hole.coords().copied(), false)));
        }
    }
    shapefile::Polygon::with_rings(rings)
}
