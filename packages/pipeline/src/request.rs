//! Run requests.
//!
//! A [`PipelineRequest`] is an immutable description of one harvest run,
//! normally read from a TOML file:
//!
//! ```toml
//! [[datasets]]
//! family = "prodes"
//! region = "cerrado"
//! kind = "yearly"
//!
//! [filter]
//! temporal = { by = "years", start = 2019, end = 2022 }
//!
//! [cut]
//! type = "service"
//! family = "boundaries"
//! region = "brazil"
//! kind = "states"
//! field = "sigla"
//! value = "GO"
//!
//! [output]
//! path = "out/prodes_go.shp"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use geo::{Rect, coord};
use geoharvest_export::ExportFormat;
use geoharvest_feature_models::{Crs, PIPELINE_CRS};
use geoharvest_service::fetch::{FetchConfig, FetchStrategy};
use geoharvest_service::planner::TemporalRange;
use geoharvest_service::registry::LayerKind;
use geoharvest_service::resolve::EndpointQuery;
use geoharvest_spatial::{DissolveOptions, RepairOptions};
use serde::Deserialize;

use crate::StageError;

/// One dataset to download.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DatasetConfig {
    /// Dataset family.
    pub family: String,
    /// Region within the family.
    pub region: String,
    /// Sub-layer kind.
    pub kind: LayerKind,
    /// Service URL overriding the registry.
    #[serde(default)]
    pub url: Option<String>,
}

impl DatasetConfig {
    /// Returns the resolver query for this dataset.
    #[must_use]
    pub fn query(&self) -> EndpointQuery {
        EndpointQuery {
            family: self.family.clone(),
            region: self.region.clone(),
            kind: self.kind,
            url: self.url.clone(),
        }
    }

    /// Short label for logs and events.
    #[must_use]
    pub fn label(&self) -> String {
        format!("{}/{}/{}", self.family, self.region, self.kind)
    }
}

/// Attribute constraints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterConfig {
    /// Temporal range.
    #[serde(default)]
    pub temporal: Option<TemporalRange>,
    /// Class values to keep.
    #[serde(default)]
    pub classes: Vec<String>,
}

/// Where the cut boundary comes from.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CutConfig {
    /// A rectangle.
    Rectangle {
        /// West edge.
        min_x: f64,
        /// South edge.
        min_y: f64,
        /// East edge.
        max_x: f64,
        /// North edge.
        max_y: f64,
        /// CRS of the corners.
        #[serde(default = "default_crs")]
        crs: Crs,
    },
    /// A `GeoJSON` boundary file on disk.
    File {
        /// File path.
        path: PathBuf,
        /// Unit selection field; with no field the whole layer is the mask.
        #[serde(default)]
        field: Option<String>,
        /// Unit identifier to keep.
        #[serde(default)]
        value: Option<String>,
    },
    /// A boundary layer downloaded from a registered endpoint.
    Service {
        /// Boundary family (usually `"boundaries"`).
        family: String,
        /// Region.
        region: String,
        /// Layer kind (`states`, `border`).
        kind: LayerKind,
        /// Unit selection field.
        #[serde(default)]
        field: Option<String>,
        /// Unit identifier to keep.
        #[serde(default)]
        value: Option<String>,
    },
}

const fn default_crs() -> Crs {
    PIPELINE_CRS
}

impl CutConfig {
    /// Returns the rectangle of a [`CutConfig::Rectangle`].
    #[must_use]
    pub fn rect(&self) -> Option<(Rect<f64>, Crs)> {
        match self {
            Self::Rectangle {
                min_x,
                min_y,
                max_x,
                max_y,
                crs,
            } => Some((
                Rect::new(coord! { x: *min_x, y: *min_y }, coord! { x: *max_x, y: *max_y }),
                *crs,
            )),
            Self::File { .. } | Self::Service { .. } => None,
        }
    }

    /// Unit selection, if both the field and the value are given.
    #[must_use]
    pub fn unit(&self) -> Option<(&str, &str)> {
        match self {
            Self::File { field, value, .. } | Self::Service { field, value, .. } => {
                Some((field.as_deref()?, value.as_deref()?))
            }
            Self::Rectangle { .. } => None,
        }
    }
}

/// Dissolve settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DissolveConfig {
    /// Group-by field.
    #[serde(default)]
    pub group_by: Option<String>,
    /// Split results into single parts.
    #[serde(default)]
    pub single_part: bool,
}

impl From<&DissolveConfig> for DissolveOptions {
    fn from(config: &DissolveConfig) -> Self {
        Self {
            group_by: config.group_by.clone(),
            single_part: config.single_part,
        }
    }
}

/// Geometry processing settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessingConfig {
    /// Run geometry repair.
    #[serde(default = "default_true")]
    pub repair: bool,
    /// Split repaired multi-part geometries.
    #[serde(default)]
    pub explode_multipart: bool,
    /// Export unclipped data when clipping fails.
    #[serde(default)]
    pub allow_unclipped: bool,
    /// Dissolve after clipping.
    #[serde(default)]
    pub dissolve: Option<DissolveConfig>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            repair: true,
            explode_multipart: false,
            allow_unclipped: false,
            dissolve: None,
        }
    }
}

impl ProcessingConfig {
    /// Repair options derived from these settings.
    #[must_use]
    pub const fn repair_options(&self) -> RepairOptions {
        RepairOptions {
            explode_multipart: self.explode_multipart,
        }
    }
}

const fn default_true() -> bool {
    true
}

/// Fetcher overrides. Unset values keep the fetcher defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FetchSettings {
    /// Features per page.
    #[serde(default)]
    pub page_size: Option<u64>,
    /// Page ceiling.
    #[serde(default)]
    pub max_pages: Option<u32>,
    /// Page timeout in seconds.
    #[serde(default)]
    pub page_timeout_secs: Option<u64>,
    /// Metadata timeout in seconds.
    #[serde(default)]
    pub metadata_timeout_secs: Option<u64>,
    /// Issue a hit-count request first.
    #[serde(default)]
    pub count_first: Option<bool>,
    /// Protocol strategies, in order.
    #[serde(default)]
    pub strategies: Option<Vec<FetchStrategy>>,
    /// Directory for page files.
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
}

impl FetchSettings {
    /// Applies the overrides to the fetcher defaults.
    #[must_use]
    pub fn to_config(&self) -> FetchConfig {
        let defaults = FetchConfig::default();
        FetchConfig {
            page_size: self.page_size.unwrap_or(defaults.page_size),
            max_pages: self.max_pages.unwrap_or(defaults.max_pages),
            page_timeout: self
                .page_timeout_secs
                .map_or(defaults.page_timeout, Duration::from_secs),
            metadata_timeout: self
                .metadata_timeout_secs
                .map_or(defaults.metadata_timeout, Duration::from_secs),
            count_first: self.count_first.unwrap_or(defaults.count_first),
            strategies: self.strategies.clone().unwrap_or(defaults.strategies),
            work_dir: self.work_dir.clone().or(defaults.work_dir),
            retry_delay: defaults.retry_delay,
        }
    }
}

/// Output destination.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    /// Destination file (`.shp` or `.fgb`).
    pub path: PathBuf,
    /// Format; guessed from the extension when absent.
    #[serde(default)]
    pub format: Option<ExportFormat>,
}

impl OutputConfig {
    /// The format to write.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::Config`] if no format is given and the
    /// extension is not recognised.
    pub fn resolved_format(&self) -> Result<ExportFormat, StageError> {
        self.format
            .or_else(|| ExportFormat::from_path(&self.path))
            .ok_or_else(|| StageError::Config {
                message: format!(
                    "cannot tell the output format of {}; set output.format",
                    self.path.display()
                ),
            })
    }
}

/// A complete run description.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineRequest {
    /// Datasets to download and merge.
    pub datasets: Vec<DatasetConfig>,
    /// Attribute constraints applied to every dataset.
    #[serde(default)]
    pub filter: FilterConfig,
    /// Cut boundary. With none, full regions are exported.
    #[serde(default)]
    pub cut: Option<CutConfig>,
    /// Geometry settings.
    #[serde(default)]
    pub processing: ProcessingConfig,
    /// Fetcher overrides.
    #[serde(default)]
    pub fetch: FetchSettings,
    /// Output destination.
    pub output: OutputConfig,
}

impl PipelineRequest {
    /// Parses a request from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::Config`] if the text is not a valid request.
    pub fn from_toml_str(text: &str) -> Result<Self, StageError> {
        let request: Self = toml::from_str(text).map_err(|e| StageError::Config {
            message: e.to_string(),
        })?;
        request.validate()?;
        Ok(request)
    }

    /// Reads a request file. Relative boundary paths are resolved against
    /// the file's directory.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::Io`] if the file cannot be read, or
    /// [`StageError::Config`] if it is invalid.
    pub async fn load(path: &Path) -> Result<Self, StageError> {
        let text = tokio::fs::read_to_string(path).await?;
        let mut request = Self::from_toml_str(&text)?;
        if let Some(CutConfig::File { path: boundary, .. }) = &mut request.cut
            && boundary.is_relative()
            && let Some(dir) = path.parent()
        {
            *boundary = dir.join(&*boundary);
        }
        Ok(request)
    }

    fn validate(&self) -> Result<(), StageError> {
        if self.datasets.is_empty() {
            return Err(StageError::Config {
                message: "at least one [[datasets]] entry is required".to_string(),
            });
        }
        if let Some(cut) = &self.cut {
            if let Some((rect, _)) = cut.rect()
                && (rect.width() <= 0.0 || rect.height() <= 0.0)
            {
                log::warn!("Cut rectangle has no area; the server box will be padded");
            }
            if let CutConfig::File { field, value, .. } | CutConfig::Service { field, value, .. } =
                cut
                && field.is_some() != value.is_some()
            {
                return Err(StageError::Config {
                    message: "cut.field and cut.value must be given together".to_string(),
                });
            }
        }
        self.output.resolved_format()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
        [[datasets]]
        family = "prodes"
        region = "cerrado"
        kind = "yearly"

        [[datasets]]
        family = "prodes"
        region = "pantanal"
        kind = "yearly"
        url = "https://example.org/geoserver/prodes-pantanal-nb/yearly_deforestation/ows"

        [filter]
        temporal = { by = "years", start = 2019, end = 2022 }
        classes = ["desmatamento"]

        [cut]
        type = "rectangle"
        min_x = -50.0
        min_y = -16.0
        max_x = -48.0
        max_y = -14.0

        [processing]
        explode_multipart = true
        dissolve = { group_by = "main_class" }

        [fetch]
        page_size = 10000
        page_timeout_secs = 60

        [output]
        path = "out/prodes.fgb"
    "#;

    #[test]
    fn parses_a_full_request() {
        let request = PipelineRequest::from_toml_str(FULL).unwrap();

        assert_eq!(request.datasets.len(), 2);
        assert_eq!(request.datasets[0].kind, LayerKind::Yearly);
        assert_eq!(request.datasets[1].label(), "prodes/pantanal/yearly");
        assert_eq!(
            request.filter.temporal,
            Some(TemporalRange::Years {
                start: 2019,
                end: 2022
            })
        );

        let (rect, crs) = request.cut.as_ref().unwrap().rect().unwrap();
        assert_eq!(crs, PIPELINE_CRS);
        assert!((rect.width() - 2.0).abs() < f64::EPSILON);

        assert!(request.processing.repair);
        assert!(request.processing.repair_options().explode_multipart);
        assert_eq!(
            request.processing.dissolve.as_ref().unwrap().group_by.as_deref(),
            Some("main_class")
        );

        let config = request.fetch.to_config();
        assert_eq!(config.page_size, 10_000);
        assert_eq!(config.page_timeout, Duration::from_secs(60));
        assert_eq!(config.max_pages, FetchConfig::default().max_pages);

        assert_eq!(request.output.resolved_format().unwrap(), ExportFormat::FlatGeobuf);
    }

    #[test]
    fn minimal_request_uses_defaults() {
        let request = PipelineRequest::from_toml_str(
            r#"
            datasets = [{ family = "deter", region = "legal_amazon", kind = "public_alerts" }]
            output = { path = "alerts.shp" }
            "#,
        )
        .unwrap();
        assert!(request.cut.is_none());
        assert_eq!(request.processing, ProcessingConfig::default());
        assert_eq!(request.fetch.to_config(), FetchConfig::default());
    }

    #[test]
    fn service_cut_with_unit() {
        let request = PipelineRequest::from_toml_str(
            r#"
            datasets = [{ family = "prodes", region = "cerrado", kind = "yearly" }]
            output = { path = "go.shp" }

            [cut]
            type = "service"
            family = "boundaries"
            region = "brazil"
            kind = "states"
            field = "sigla"
            value = "GO"
            "#,
        )
        .unwrap();
        assert_eq!(request.cut.unwrap().unit(), Some(("sigla", "GO")));
    }

    #[test]
    fn invalid_requests_are_rejected() {
        let no_datasets = r#"
            datasets = []
            output = { path = "x.shp" }
        "#;
        assert!(matches!(
            PipelineRequest::from_toml_str(no_datasets),
            Err(StageError::Config { .. })
        ));

        let unknown_format = r#"
            datasets = [{ family = "prodes", region = "cerrado", kind = "yearly" }]
            output = { path = "x.gpkg" }
        "#;
        assert!(PipelineRequest::from_toml_str(unknown_format).is_err());

        let half_unit = r#"
            datasets = [{ family = "prodes", region = "cerrado", kind = "yearly" }]
            output = { path = "x.shp" }
            cut = { type = "file", path = "states.geojson", field = "uf" }
        "#;
        assert!(PipelineRequest::from_toml_str(half_unit).is_err());
    }
}
