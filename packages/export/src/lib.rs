#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Writes feature collections to disk.
//!
//! Two formats are supported: ESRI Shapefile (a `.shp`/`.shx`/`.dbf`
//! bundle plus `.prj` and a `.cpg` declaring UTF-8) and `FlatGeobuf` (one
//! file with the EPSG code in its header). Output is staged next to the
//! destination and moved into place only once every byte is written, so a
//! failed export never leaves a partial file behind.

pub mod fgb;
pub mod fields;
pub mod prj;
pub mod shp;
pub mod stage;

use std::path::{Path, PathBuf};

use geoharvest_feature_models::{FeatureCollection, ProcessingLog, ProcessingLogEntry};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Log operation name.
pub const OPERATION: &str = "export";

/// Output file format.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum ExportFormat {
    /// ESRI Shapefile bundle.
    #[strum(to_string = "shapefile", serialize = "shp")]
    Shapefile,
    /// `FlatGeobuf` single file.
    #[strum(to_string = "flatgeobuf", serialize = "fgb")]
    FlatGeobuf,
}

impl ExportFormat {
    /// File extension of the primary output file.
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Shapefile => "shp",
            Self::FlatGeobuf => "fgb",
        }
    }

    /// Guesses the format from a file extension.
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?;
        if ext.eq_ignore_ascii_case("shp") {
            Some(Self::Shapefile)
        } else if ext.eq_ignore_ascii_case("fgb") {
            Some(Self::FlatGeobuf)
        } else {
            None
        }
    }
}

/// Errors that can occur while exporting.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    /// The destination could not be written.
    #[error("Failed to write {}: {source}", path.display())]
    Write {
        /// Destination being written.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The encoder rejected the data.
    #[error("{format} encoding failed: {message}")]
    Encode {
        /// Format being written.
        format: ExportFormat,
        /// Encoder error text.
        message: String,
    },
}

impl ExportError {
    pub(crate) fn write(path: &Path, source: std::io::Error) -> Self {
        Self::Write {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn encode(format: ExportFormat, message: impl ToString) -> Self {
        Self::Encode {
            format,
            message: message.to_string(),
        }
    }
}

/// What an export produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSummary {
    /// Format written.
    pub format: ExportFormat,
    /// Every file created, primary file first.
    pub files: Vec<PathBuf>,
    /// Features written.
    pub features: usize,
}

/// Writes `collection` to `path` in `format`.
///
/// For shapefiles `path` names the `.shp` file; the sidecar files take the
/// same stem. Existing files at the destination are replaced.
///
/// # Errors
///
/// * [`ExportError::Write`] if the destination directory is missing or
///   not writable.
/// * [`ExportError::Encode`] if the encoder rejects a value or geometry.
pub fn export(
    collection: &FeatureCollection,
    path: &Path,
    format: ExportFormat,
    log: &ProcessingLog,
) -> Result<ExportSummary, ExportError> {
    log::info!(
        "Exporting {} features as {format} to {}",
        collection.len(),
        path.display()
    );

    let files = match format {
        ExportFormat::Shapefile => shp::write(collection, path)?,
        ExportFormat::FlatGeobuf => fgb::write(collection, path)?,
    };

    log.append(ProcessingLogEntry::counts(
        OPERATION,
        collection.len(),
        collection.len(),
        format!("{} features -> {} ({format})", collection.len(), path.display()),
    ));

    Ok(ExportSummary {
        format,
        files,
        features: collection.len(),
    })
}

#[cfg(test)]
pub(crate) mod test_utils {
    use chrono::NaiveDate;
    use geo::{MultiPolygon, polygon};
    use geoharvest_feature_models::{
        AttributeValue, Feature, FeatureCollection, FieldDef, FieldType, PIPELINE_CRS, Schema,
    };

    /// Two features with a hole in the second, covering every column type.
    pub fn sample() -> FeatureCollection {
        let outer = polygon![
            (x: -50.0, y: -10.0),
            (x: -49.0, y: -10.0),
            (x: -49.0, y: -9.0),
            (x: -50.0, y: -9.0),
            (x: -50.0, y: -10.0),
        ];
        let holed = polygon!(
            exterior: [
                (x: -48.0, y: -10.0),
                (x: -46.0, y: -10.0),
                (x: -46.0, y: -8.0),
                (x: -48.0, y: -8.0),
                (x: -48.0, y: -10.0),
            ],
            interiors: [[
                (x: -47.5, y: -9.5),
                (x: -47.5, y: -8.5),
                (x: -46.5, y: -8.5),
                (x: -46.5, y: -9.5),
                (x: -47.5, y: -9.5),
            ]],
        );
        FeatureCollection::new(
            Schema::new(vec![
                FieldDef::new("year", FieldType::Integer),
                FieldDef::new("area_km", FieldType::Float),
                FieldDef::new("main_class", FieldType::Text),
                FieldDef::new("image_date", FieldType::Date),
                FieldDef::new("verified", FieldType::Bool),
                FieldDef::new("note", FieldType::Unknown),
            ]),
            PIPELINE_CRS,
            vec![
                Feature::new(
                    MultiPolygon::new(vec![outer]),
                    vec![
                        AttributeValue::Integer(2021),
                        AttributeValue::Float(12.25),
                        AttributeValue::Text("desmatamento".to_string()),
                        AttributeValue::Date(NaiveDate::from_ymd_opt(2021, 7, 30).unwrap()),
                        AttributeValue::Bool(true),
                        AttributeValue::Null,
                    ],
                ),
                Feature::new(
                    MultiPolygon::new(vec![holed]),
                    vec![
                        AttributeValue::Integer(2022),
                        AttributeValue::Null,
                        AttributeValue::Text("queimada ção".to_string()),
                        AttributeValue::Null,
                        AttributeValue::Bool(false),
                        AttributeValue::Null,
                    ],
                ),
            ],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_names_and_extensions() {
        assert_eq!("shp".parse::<ExportFormat>().unwrap(), ExportFormat::Shapefile);
        assert_eq!("FlatGeobuf".parse::<ExportFormat>().unwrap(), ExportFormat::FlatGeobuf);
        assert_eq!(ExportFormat::FlatGeobuf.to_string(), "flatgeobuf");
        assert_eq!(
            ExportFormat::from_path(Path::new("out/layer.SHP")),
            Some(ExportFormat::Shapefile)
        );
        assert_eq!(ExportFormat::from_path(Path::new("out/layer.gpkg")), None);
    }

    #[test]
    fn export_appends_a_log_entry() {
        let dir = tempfile::tempdir().unwrap();
        let log = ProcessingLog::new();
        let summary = export(
            &test_utils::sample(),
            &dir.path().join("layer.fgb"),
            ExportFormat::FlatGeobuf,
            &log,
        )
        .unwrap();

        assert_eq!(summary.features, 2);
        assert_eq!(summary.files, vec![dir.path().join("layer.fgb")]);
        assert_eq!(log.last().unwrap().operation, OPERATION);
    }

    #[test]
    fn missing_directory_is_a_write_error() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("missing").join("layer.shp");
        let err = export(
            &test_utils::sample(),
            &target,
            ExportFormat::Shapefile,
            &ProcessingLog::new(),
        )
        .unwrap_err();
        assert!(matches!(err, ExportError::Write { .. }));
        assert!(!target.exists());
    }
}
