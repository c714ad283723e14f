//! `FlatGeobuf` writer.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use flatgeobuf::{ColumnType, FgbCrs, FgbWriter, FgbWriterOptions, GeometryType};
use geoharvest_feature_models::{AttributeValue, FeatureCollection, FieldType};
use geozero::geo_types::process_geom;
use geozero::{ColumnValue, FeatureProcessor as _, PropertyProcessor as _};

use crate::stage::{Stage, stem};
use crate::{ExportError, ExportFormat};

const FORMAT: ExportFormat = ExportFormat::FlatGeobuf;

const fn column_type(field_type: FieldType) -> ColumnType {
    match field_type {
        FieldType::Bool => ColumnType::Bool,
        FieldType::Integer => ColumnType::Long,
        FieldType::Float => ColumnType::Double,
        FieldType::Date => ColumnType::DateTime,
        FieldType::Text | FieldType::Unknown => ColumnType::String,
    }
}

/// Writes `collection` to `dest` and returns the file created.
///
/// # Errors
///
/// Returns [`ExportError::Write`] on I/O failure and
/// [`ExportError::Encode`] if the encoder rejects the data.
pub fn write(collection: &FeatureCollection, dest: &Path) -> Result<Vec<PathBuf>, ExportError> {
    let stage = Stage::for_destination(dest)?;
    let stem = stem(dest)?;
    let file_name = format!("{stem}.fgb");

    let code = i32::try_from(collection.crs.code()).unwrap_or_default();
    let mut fgb = FgbWriter::create_with_options(
        &stem,
        GeometryType::MultiPolygon,
        FgbWriterOptions {
            // The spatial index sorts features along a Hilbert curve.
            write_index: false,
            crs: FgbCrs {
                code,
                ..Default::default()
            },
            ..Default::default()
        },
    )
    .map_err(|e| ExportError::encode(FORMAT, e))?;

    for field in &collection.schema.fields {
        fgb.add_column(&field.name, column_type(field.field_type), |_, column| {
            column.nullable = true;
        });
    }

    for (i, feature) in collection.features.iter().enumerate() {
        let idx = i as u64;
        fgb.feature_begin(idx).map_err(|e| ExportError::encode(FORMAT, e))?;

        fgb.properties_begin().map_err(|e| ExportError::encode(FORMAT, e))?;
        for (col, field) in collection.schema.fields.iter().enumerate() {
            let value = feature.attribute(col);
            let date;
            let rendered;
            let column_value = match value {
                AttributeValue::Null => continue,
                AttributeValue::Bool(b) => ColumnValue::Bool(*b),
                AttributeValue::Integer(v) => ColumnValue::Long(*v),
                AttributeValue::Float(v) => ColumnValue::Double(*v),
                AttributeValue::Text(s) => ColumnValue::String(s),
                AttributeValue::Date(d) if field.field_type == FieldType::Date => {
                    date = d.format("%Y-%m-%d").to_string();
                    ColumnValue::DateTime(&date)
                }
                AttributeValue::Date(_) => {
                    rendered = value.to_string();
                    ColumnValue::String(&rendered)
                }
            };
            fgb.property(col, &field.name, &column_value)
                .map_err(|e| ExportError::encode(FORMAT, e))?;
        }
        fgb.properties_end().map_err(|e| ExportError::encode(FORMAT, e))?;

        fgb.geometry_begin().map_err(|e| ExportError::encode(FORMAT, e))?;
        process_geom(&geo::Geometry::MultiPolygon(feature.geometry.clone()), &mut fgb)
            .map_err(|e| ExportError::encode(FORMAT, e))?;
        fgb.geometry_end().map_err(|e| ExportError::encode(FORMAT, e))?;

        fgb.feature_end(idx).map_err(|e| ExportError::encode(FORMAT, e))?;
    }

    let staged = stage.path(&file_name);
    let file = File::create(&staged).map_err(|e| ExportError::write(dest, e))?;
    let mut out = BufWriter::new(file);
    fgb.write(&mut out).map_err(|e| ExportError::encode(FORMAT, e))?;
    out.into_inner()
        .map_err(|e| ExportError::write(dest, e.into_error()))?
        .sync_all()
        .map_err(|e| ExportError::write(dest, e))?;

    stage.commit(&[file_name])
}

#[cfg(test)]
mod tests {
    use std::io::BufReader;

    use flatgeobuf::{FallibleStreamingIterator as _, FgbReader};
    use geo::polygon;
    use geozero::{FeatureProperties as _, ToGeo as _};

    use super::*;
    use crate::test_utils::sample;

    #[test]
    fn features_crs_and_properties_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("deter.fgb");
        let files = write(&sample(), &dest).unwrap();
        assert_eq!(files, vec![dest.clone()]);

        let reader = FgbReader::open(BufReader::new(File::open(&dest).unwrap())).unwrap();
        assert_eq!(reader.header().crs().map(|c| c.code()), Some(4674));

        let mut iter = reader.select_all().unwrap();
        let mut classes = Vec::new();
        let mut kinds = Vec::new();
        while let Some(feature) = iter.next().unwrap() {
            classes.push(feature.property::<String>("main_class").unwrap());
            kinds.push(matches!(
                feature.to_geo().unwrap(),
                geo::Geometry::MultiPolygon(_)
            ));
        }
        assert_eq!(classes, ["desmatamento", "queimada ção"]);
        assert_eq!(kinds, [true, true]);
    }

    #[test]
    fn scattered_features_keep_collection_order() {
        let base = sample();
        let template = base.features[0].clone();
        let features = [(10.0, 10.0), (-60.0, -30.0), (5.0, -20.0), (-10.0, 40.0), (0.0, 0.0)]
            .iter()
            .enumerate()
            .map(|(i, &(x, y))| {
                let mut attributes = template.attributes.clone();
                attributes[0] = AttributeValue::Integer(i64::try_from(i).unwrap());
                let square = geo::polygon![
                    (x: x, y: y),
                    (x: x + 1.0, y: y),
                    (x: x + 1.0, y: y + 1.0),
                    (x: x, y: y + 1.0),
                    (x: x, y: y),
                ];
                geoharvest_feature_models::Feature::new(
                    geo::MultiPolygon::new(vec![square]),
                    attributes,
                )
            })
            .collect();

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("ordered.fgb");
        write(&base.with_features(features), &dest).unwrap();

        let reader = FgbReader::open(BufReader::new(File::open(&dest).unwrap())).unwrap();
        let mut iter = reader.select_all().unwrap();
        let mut years = Vec::new();
        while let Some(feature) = iter.next().unwrap() {
            years.push(feature.property::<i64>("year").unwrap());
        }
        assert_eq!(years, [0, 1, 2, 3, 4]);
    }

    #[test]
    fn only_the_final_file_remains() {
        let dir = tempfile::tempdir().unwrap();
        write(&sample(), &dir.path().join("out.fgb")).unwrap();
        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, ["out.fgb"]);
    }
}
