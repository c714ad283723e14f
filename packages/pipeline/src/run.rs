//! The run orchestrator.
//!
//! Stage order for a request with two datasets and a cut:
//!
//! ```text
//! boundary ─┐
//!           ├─ dataset 1: resolve → plan → fetch → assemble → [reproject] → [post_filter] → repair ─┐
//!           └─ dataset 2: resolve → plan → fetch → assemble → [reproject] → [post_filter] → repair ─┴─ merge → clip → [repair] → [dissolve] → export
//! ```
//!
//! Geometry stages run on the blocking pool. The token is checked before
//! every stage and again after every geometry stage.

use std::sync::Arc;

use geo::Rect;
use geoharvest_export::{ExportFormat, export};
use geoharvest_feature_models::{
    CancellationToken, Crs, FeatureCollection, FilterSpec, PIPELINE_CRS, ProcessingLog,
    ProcessingLogEntry,
};
use geoharvest_service::assemble::assemble;
use geoharvest_service::fetch::{FetchOutcome, FetchRequest, PaginatedFetcher};
use geoharvest_service::planner::{PlanInput, plan};
use geoharvest_service::post_filter::{PostFilterOutcome, post_filter};
use geoharvest_service::progress::{ProgressCallback, null_progress};
use geoharvest_service::resolve::{EndpointQuery, EndpointResolver, ResolvedEndpoint};
use geoharvest_service::transport::FeatureTransport;
use geoharvest_spatial::repair::count_invalid;
use geoharvest_spatial::{
    DissolveOptions, clip, dissolve, merge, prepare_mask, repair, reproject_collection,
};
use tokio::sync::mpsc;

use crate::boundary::{cut_boundary, mask_extent, read_layer};
use crate::events::PipelineEvent;
use crate::request::{CutConfig, DatasetConfig, PipelineRequest};
use crate::{PipelineError, RunOutcome, RunReport, Stage, StageError};

/// Runs [`PipelineRequest`]s against a feature service.
pub struct Pipeline {
    resolver: EndpointResolver,
    transport: Arc<dyn FeatureTransport>,
    progress: Arc<dyn ProgressCallback>,
    events: Option<mpsc::Sender<PipelineEvent>>,
}

impl Pipeline {
    /// Creates a pipeline over the built-in endpoint registry.
    #[must_use]
    pub fn new(transport: Arc<dyn FeatureTransport>) -> Self {
        Self {
            resolver: EndpointResolver::builtin(),
            transport,
            progress: null_progress(),
            events: None,
        }
    }

    /// Replaces the endpoint resolver.
    #[must_use]
    pub fn with_resolver(mut self, resolver: EndpointResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Reports page downloads to `progress`.
    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    /// Sends stage events to `tx`. Events are dropped once the receiver
    /// is gone; a receiver that stops reading stalls the run.
    #[must_use]
    pub fn with_events(mut self, tx: mpsc::Sender<PipelineEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Executes `request`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] for every fatal failure: unresolvable
    /// datasets, network failures past the protocol fallback, schema drift,
    /// boundary selection errors, clip failures (unless the request allows
    /// unclipped output), dissolve failures and write errors. Cancellation
    /// is reported as [`RunOutcome::Cancelled`].
    pub async fn run(
        &self,
        request: &PipelineRequest,
        token: &CancellationToken,
    ) -> Result<RunOutcome, PipelineError> {
        let mut run = Run {
            pipeline: self,
            request,
            token,
            log: ProcessingLog::new(),
            warnings: Vec::new(),
            requests: 0,
        };

        match run.execute().await {
            Ok(report) => {
                log::info!(
                    "Run finished: {} features in {} files, {} page requests",
                    report.features,
                    report.output.files.len(),
                    report.requests
                );
                Ok(RunOutcome::Completed(report))
            }
            Err(Halt::Cancelled(stage)) => {
                log::info!("Run cancelled during {stage}");
                Ok(RunOutcome::Cancelled { stage })
            }
            Err(Halt::Failed(e)) => {
                log::error!("{e}");
                Err(e)
            }
        }
    }
}

enum Halt {
    Cancelled(Stage),
    Failed(PipelineError),
}

impl From<PipelineError> for Halt {
    fn from(e: PipelineError) -> Self {
        Self::Failed(e)
    }
}

/// Runs `f` on the blocking pool.
async fn blocking<T, F>(stage: Stage, input_features: usize, f: F) -> Result<T, Halt>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        Halt::Failed(PipelineError::new(
            stage,
            input_features,
            StageError::Join {
                message: e.to_string(),
            },
        ))
    })
}

struct Run<'a> {
    pipeline: &'a Pipeline,
    request: &'a PipelineRequest,
    token: &'a CancellationToken,
    log: ProcessingLog,
    warnings: Vec<String>,
    requests: u32,
}

impl Run<'_> {
    fn checkpoint(&self, stage: Stage) -> Result<(), Halt> {
        self.token
            .checkpoint()
            .map_err(|_| Halt::Cancelled(stage))
    }

    async fn emit(&self, event: PipelineEvent) {
        if let Some(tx) = &self.pipeline.events {
            let _ = tx.send(event).await;
        }
    }

    async fn started(&self, stage: Stage, dataset: Option<&str>) {
        match dataset {
            Some(dataset) => log::info!("{stage}: {dataset}"),
            None => log::info!("{stage}"),
        }
        self.emit(PipelineEvent::StageStarted {
            stage,
            dataset: dataset.map(ToString::to_string),
        })
        .await;
    }

    async fn finished(&self, stage: Stage, features: usize) {
        log::debug!("{stage} done: {features} features");
        self.emit(PipelineEvent::StageFinished { stage, features })
            .await;
    }

    async fn warn(&mut self, message: String) {
        log::warn!("{message}");
        self.warnings.push(message.clone());
        self.emit(PipelineEvent::Warning { message }).await;
    }

    async fn execute(&mut self) -> Result<RunReport, Halt> {
        let request = self.request;
        let format = request
            .output
            .resolved_format()
            .map_err(|e| PipelineError::new(Stage::Export, 0, e))?;

        let mask = match &request.cut {
            Some(cut) => Some(self.prepare_cut(cut).await?),
            None => None,
        };
        let extent = mask.as_ref().and_then(mask_extent);

        let mut layers = Vec::with_capacity(request.datasets.len());
        for dataset in &request.datasets {
            layers.push(self.harvest(dataset, extent).await?);
        }

        let mut data = self.run_merge(layers).await?;
        if let Some(mask) = mask {
            data = self.run_clip(data, mask).await?;
        }
        if let Some(config) = &request.processing.dissolve {
            data = self.run_dissolve(data, config.into()).await?;
        }
        self.run_export(data, format).await
    }

    // ── Boundary ───────────────────────────────────────────────────────

    async fn prepare_cut(&mut self, cut: &CutConfig) -> Result<FeatureCollection, Halt> {
        let fail = |e: StageError| Halt::Failed(PipelineError::new(Stage::Boundary, 0, e));

        self.checkpoint(Stage::Boundary)?;
        self.started(Stage::Boundary, None).await;

        let layer = match cut {
            CutConfig::Rectangle { .. } => None,
            CutConfig::File { path, .. } => Some(read_layer(path).await.map_err(fail)?),
            CutConfig::Service {
                family,
                region,
                kind,
                ..
            } => {
                let query = EndpointQuery {
                    family: family.clone(),
                    region: region.clone(),
                    kind: *kind,
                    url: None,
                };
                let endpoint = self
                    .pipeline
                    .resolver
                    .resolve(&query)
                    .map_err(|e| fail(e.into()))?;
                Some(
                    self.download(&endpoint, FilterSpec::None, Stage::Boundary, Stage::Boundary)
                        .await?,
                )
            }
        };

        let boundary = cut_boundary(cut, layer).map_err(fail)?;
        log::info!("Cut boundary: {}", boundary.describe());

        let mask = blocking(Stage::Boundary, 0, move || {
            prepare_mask(&boundary, PIPELINE_CRS)
        })
        .await?
        .map_err(|e| fail(e.into()))?;

        if mask.is_empty() {
            self.warn("Cut boundary is empty; the output will be empty".to_string())
                .await;
        }
        self.checkpoint(Stage::Boundary)?;
        self.finished(Stage::Boundary, mask.len()).await;
        Ok(mask)
    }

    // ── Acquisition ────────────────────────────────────────────────────

    async fn download(
        &mut self,
        endpoint: &ResolvedEndpoint,
        filter: FilterSpec,
        fetch_stage: Stage,
        assemble_stage: Stage,
    ) -> Result<FeatureCollection, Halt> {
        self.checkpoint(fetch_stage)?;

        let fetcher = PaginatedFetcher::new(
            self.pipeline.transport.clone(),
            self.request.fetch.to_config(),
        )
        .with_progress(self.pipeline.progress.clone());
        let fetch_request = FetchRequest {
            endpoint: endpoint.clone(),
            filter,
            srs_name: PIPELINE_CRS,
        };

        let pages = match fetcher.fetch(&fetch_request, self.token).await {
            Ok(FetchOutcome::Completed(pages)) => pages,
            Ok(FetchOutcome::Cancelled { requests }) => {
                self.requests += requests;
                return Err(Halt::Cancelled(fetch_stage));
            }
            Err(e) => return Err(PipelineError::new(fetch_stage, 0, e).into()),
        };
        self.requests += pages.requests;
        log::info!(
            "Downloaded {} features of {} in {} pages ({})",
            pages.total_features(),
            endpoint.type_name,
            pages.len(),
            pages.strategy
        );

        self.checkpoint(assemble_stage)?;
        let fetched = pages.total_features();
        assemble(pages, PIPELINE_CRS, &self.log)
            .await
            .map_err(|e| PipelineError::new(assemble_stage, fetched, e).into())
    }

    async fn harvest(
        &mut self,
        dataset: &DatasetConfig,
        extent: Option<(Rect<f64>, Crs)>,
    ) -> Result<FeatureCollection, Halt> {
        let label = dataset.label();
        let request = self.request;
        let filter = &request.filter;

        self.checkpoint(Stage::Resolve)?;
        self.started(Stage::Resolve, Some(label.as_str())).await;
        let endpoint = self
            .pipeline
            .resolver
            .resolve(&dataset.query())
            .map_err(|e| PipelineError::new(Stage::Resolve, 0, e))?;

        self.checkpoint(Stage::Plan)?;
        let filter_plan = plan(&PlanInput {
            endpoint: &endpoint,
            cut_extent: extent,
            temporal: filter.temporal,
            classes: filter.classes.clone(),
            service_crs: endpoint.native_crs.unwrap_or(PIPELINE_CRS),
        })
        .map_err(|e| PipelineError::new(Stage::Plan, 0, e))?;

        self.started(Stage::Fetch, Some(label.as_str())).await;
        let mut collection = self
            .download(&endpoint, filter_plan.spec, Stage::Fetch, Stage::Assemble)
            .await?;
        self.finished(Stage::Assemble, collection.len()).await;

        if collection.crs != PIPELINE_CRS {
            self.checkpoint(Stage::Reproject)?;
            let input = collection.len();
            let source = collection;
            collection = blocking(Stage::Reproject, input, move || {
                reproject_collection(&source, PIPELINE_CRS)
            })
            .await?
            .map_err(|e| PipelineError::new(Stage::Reproject, input, e))?;
        }

        if let Some(expression) = &filter_plan.deferred {
            self.checkpoint(Stage::PostFilter)?;
            collection = match post_filter(&collection, expression, &self.log) {
                PostFilterOutcome::Filtered(filtered) => filtered,
                PostFilterOutcome::NotApplied { collection, reason } => {
                    self.warn(format!("{label}: filter {expression} not applied: {reason}"))
                        .await;
                    collection
                }
            };
            self.finished(Stage::PostFilter, collection.len()).await;
        }

        if self.request.processing.repair {
            collection = self.run_repair(collection).await?;
        }
        Ok(collection)
    }

    // ── Geometry ───────────────────────────────────────────────────────

    async fn run_repair(
        &mut self,
        collection: FeatureCollection,
    ) -> Result<FeatureCollection, Halt> {
        self.checkpoint(Stage::Repair)?;
        let input = collection.len();
        let options = self.request.processing.repair_options();
        let log = self.log.clone();

        let (collection, result) = blocking(Stage::Repair, input, move || {
            let result = repair(&collection, options, &log);
            (collection, result)
        })
        .await?;

        let repaired = match result {
            Ok(repaired) => repaired,
            Err(e) => {
                self.log.append(ProcessingLogEntry::note(
                    repair::OPERATION,
                    format!("skipped: {e}"),
                ));
                self.warn(format!("Geometry repair skipped, keeping input: {e}"))
                    .await;
                collection
            }
        };
        self.checkpoint(Stage::Repair)?;
        self.finished(Stage::Repair, repaired.len()).await;
        Ok(repaired)
    }

    async fn run_merge(
        &mut self,
        mut layers: Vec<FeatureCollection>,
    ) -> Result<FeatureCollection, Halt> {
        if layers.len() == 1
            && let Some(only) = layers.pop()
        {
            return Ok(only);
        }

        self.checkpoint(Stage::Merge)?;
        self.started(Stage::Merge, None).await;
        let input: usize = layers.iter().map(FeatureCollection::len).sum();
        let log = self.log.clone();

        let merged = blocking(Stage::Merge, input, move || merge(&layers, &log))
            .await?
            .map_err(|e| PipelineError::new(Stage::Merge, input, e))?;

        self.checkpoint(Stage::Merge)?;
        self.finished(Stage::Merge, merged.len()).await;
        Ok(merged)
    }

    async fn run_clip(
        &mut self,
        data: FeatureCollection,
        mask: FeatureCollection,
    ) -> Result<FeatureCollection, Halt> {
        self.checkpoint(Stage::Clip)?;
        self.started(Stage::Clip, None).await;
        let input = data.len();
        let log = self.log.clone();

        let (data, result) = blocking(Stage::Clip, input, move || {
            let result = clip(&data, &mask, &log);
            (data, result)
        })
        .await?;

        let clipped = match result {
            Ok(clipped) => clipped,
            Err(e) if self.request.processing.allow_unclipped => {
                self.log.append(ProcessingLogEntry::note(
                    clip::OPERATION,
                    format!("bypassed: {e}"),
                ));
                self.warn(format!("Clip failed, exporting unclipped data: {e}"))
                    .await;
                data
            }
            Err(e) => return Err(PipelineError::new(Stage::Clip, input, e).into()),
        };
        self.checkpoint(Stage::Clip)?;
        self.finished(Stage::Clip, clipped.len()).await;

        self.repair_if_invalid(clipped).await
    }

    /// Repairs `collection` again if it holds invalid geometry.
    async fn repair_if_invalid(
        &mut self,
        collection: FeatureCollection,
    ) -> Result<FeatureCollection, Halt> {
        if !self.request.processing.repair {
            return Ok(collection);
        }
        let input = collection.len();
        let (collection, invalid) = blocking(Stage::Repair, input, move || {
            let invalid = count_invalid(&collection);
            (collection, invalid)
        })
        .await?;
        if invalid == 0 {
            return Ok(collection);
        }
        log::info!("Clip left {invalid} invalid geometries; repairing");
        self.run_repair(collection).await
    }

    async fn run_dissolve(
        &mut self,
        data: FeatureCollection,
        options: DissolveOptions,
    ) -> Result<FeatureCollection, Halt> {
        self.checkpoint(Stage::Dissolve)?;
        self.started(Stage::Dissolve, None).await;
        let input = data.len();
        let log = self.log.clone();

        let dissolved = blocking(Stage::Dissolve, input, move || {
            dissolve(&data, &options, &log)
        })
        .await?
        .map_err(|e| PipelineError::new(Stage::Dissolve, input, e))?;

        self.checkpoint(Stage::Dissolve)?;
        self.finished(Stage::Dissolve, dissolved.len()).await;
        Ok(dissolved)
    }

    // ── Output ─────────────────────────────────────────────────────────

    async fn run_export(
        &mut self,
        data: FeatureCollection,
        format: ExportFormat,
    ) -> Result<RunReport, Halt> {
        self.checkpoint(Stage::Export)?;
        self.started(Stage::Export, None).await;
        let input = data.len();
        let dest = self.request.output.path.clone();

        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PipelineError::new(Stage::Export, input, e))?;
        }

        let log = self.log.clone();
        let summary = blocking(Stage::Export, input, move || {
            export(&data, &dest, format, &log)
        })
        .await?
        .map_err(|e| PipelineError::new(Stage::Export, input, e))?;
        self.finished(Stage::Export, summary.features).await;

        Ok(RunReport {
            features: summary.features,
            output: summary,
            log: self.log.entries(),
            requests: self.requests,
            warnings: std::mem::take(&mut self.warnings),
        })
    }
}
