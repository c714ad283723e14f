//! Paginated feature download with protocol fallback.
//!
//! A fetch walks an ordered list of [`FetchStrategy`] candidates. Each
//! strategy requests page *n* with `count = P` and `startIndex = n * P`
//! until one of the terminal conditions holds:
//!
//! - the page is empty,
//! - the page is a service exception report,
//! - the page holds fewer than `P` features,
//! - the running total reaches the server's `numberMatched`,
//! - the hard page ceiling is hit.
//!
//! Only a failure of the *first* page moves on to the next strategy
//! (typically the legacy unpaginated protocol, which returns everything in
//! one response). Later pages get one local retry and then fail the fetch.
//!
//! Page bodies are spooled to files in a per-fetch temporary directory so
//! that only one page is held in memory at a time. The directory is removed
//! when the returned [`PageSet`] is closed or dropped, and before returning
//! on cancellation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use geoharvest_feature_models::{CancellationToken, Crs, FilterSpec};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use crate::ServiceError;
use crate::page::{detect_exception, parse_hits, summarize};
use crate::progress::{ProgressCallback, null_progress};
use crate::resolve::ResolvedEndpoint;
use crate::retry::{RetryOutcome, RetryPolicy, with_retry};
use crate::transport::{FeatureTransport, GetFeatureParams, WfsVersion};

/// Default page size.
pub const DEFAULT_PAGE_SIZE: u64 = 50_000;

/// Hard ceiling on pages per fetch.
pub const MAX_PAGES: u32 = 100;

/// Timeout for metadata requests (hit counts).
pub const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for page requests.
pub const PAGE_TIMEOUT: Duration = Duration::from_secs(120);

/// Backoff before retrying a failed page.
pub const RETRY_DELAY: Duration = Duration::from_secs(2);

const TEMP_PREFIX: &str = "geoharvest-pages-";

/// How pages are requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FetchStrategy {
    /// `count` / `startIndex` paging.
    Paginated {
        /// Protocol version.
        version: WfsVersion,
    },
    /// One request for the whole collection.
    Unpaginated {
        /// Protocol version.
        version: WfsVersion,
    },
}

impl FetchStrategy {
    /// The default candidate order: paged 2.0.0, then unpaged 1.0.0.
    #[must_use]
    pub fn default_candidates() -> Vec<Self> {
        vec![
            Self::Paginated {
                version: WfsVersion::V2_0_0,
            },
            Self::Unpaginated {
                version: WfsVersion::V1_0_0,
            },
        ]
    }

    /// Protocol version used by the strategy.
    #[must_use]
    pub const fn version(self) -> WfsVersion {
        match self {
            Self::Paginated { version } | Self::Unpaginated { version } => version,
        }
    }

    /// Whether the strategy requests more than one page.
    #[must_use]
    pub const fn is_paginated(self) -> bool {
        matches!(self, Self::Paginated { .. })
    }
}

impl std::fmt::Display for FetchStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Paginated { version } => write!(f, "paginated {version}"),
            Self::Unpaginated { version } => write!(f, "unpaginated {version}"),
        }
    }
}

/// Fetcher tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchConfig {
    /// Features per page.
    pub page_size: u64,
    /// Maximum number of pages per strategy.
    pub max_pages: u32,
    /// Timeout for the pre-flight hit count.
    pub metadata_timeout: Duration,
    /// Timeout for each page request.
    pub page_timeout: Duration,
    /// Backoff before retrying a failed page.
    pub retry_delay: Duration,
    /// Issue a `resultType=hits` request first to learn the total.
    pub count_first: bool,
    /// Ordered strategy candidates.
    pub strategies: Vec<FetchStrategy>,
    /// Directory for page files. Defaults to the system temp directory.
    pub work_dir: Option<PathBuf>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_pages: MAX_PAGES,
            metadata_timeout: METADATA_TIMEOUT,
            page_timeout: PAGE_TIMEOUT,
            retry_delay: RETRY_DELAY,
            count_first: true,
            strategies: FetchStrategy::default_candidates(),
            work_dir: None,
        }
    }
}

/// One downloaded page on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadPage {
    /// Zero-based page index.
    pub index: u32,
    /// Features on the page.
    pub feature_count: usize,
    /// Location of the raw body.
    pub path: PathBuf,
}

/// The pages of one completed fetch, in ascending index order.
#[derive(Debug)]
pub struct PageSet {
    dir: TempDir,
    pages: BTreeMap<u32, DownloadPage>,
    /// Strategy that produced the pages.
    pub strategy: FetchStrategy,
    /// Page requests issued, across all strategies tried.
    pub requests: u32,
    /// Server-reported match count, if any.
    pub number_matched: Option<u64>,
}

impl PageSet {
    /// Pages in ascending index order.
    pub fn pages(&self) -> impl Iterator<Item = &DownloadPage> {
        self.pages.values()
    }

    /// Number of stored pages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Whether the fetch completed with no features.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Features across all pages.
    #[must_use]
    pub fn total_features(&self) -> usize {
        self.pages.values().map(|p| p.feature_count).sum()
    }

    /// Directory holding the page files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Reads a page body back.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Io`] if the file cannot be read.
    pub async fn read_page(&self, page: &DownloadPage) -> Result<String, ServiceError> {
        Ok(tokio::fs::read_to_string(&page.path).await?)
    }

    /// Deletes the page directory.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Io`] if the directory cannot be removed.
    pub fn close(self) -> Result<(), ServiceError> {
        Ok(self.dir.close()?)
    }
}

/// Result of a fetch that did not fail.
#[derive(Debug)]
pub enum FetchOutcome {
    /// All pages downloaded (possibly none).
    Completed(PageSet),
    /// Cancellation was observed; no temporary files remain.
    Cancelled {
        /// Page requests issued before stopping.
        requests: u32,
    },
}

/// What to download.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    /// Resolved service endpoint.
    pub endpoint: ResolvedEndpoint,
    /// Server-side filter.
    pub filter: FilterSpec,
    /// CRS to request geometries in.
    pub srs_name: Crs,
}

enum StrategyError {
    /// The first page failed; the next strategy may be tried.
    FirstPage(ServiceError),
    /// A later page failed; the fetch fails.
    Fatal(ServiceError),
}

/// Downloads a feature collection page by page.
pub struct PaginatedFetcher {
    transport: Arc<dyn FeatureTransport>,
    config: FetchConfig,
    progress: Arc<dyn ProgressCallback>,
}

impl PaginatedFetcher {
    /// Creates a fetcher with silent progress.
    #[must_use]
    pub fn new(transport: Arc<dyn FeatureTransport>, config: FetchConfig) -> Self {
        Self {
            transport,
            config,
            progress: null_progress(),
        }
    }

    /// Replaces the progress reporter.
    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    /// Returns the configuration in use.
    #[must_use]
    pub const fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Runs the fetch.
    ///
    /// # Errors
    ///
    /// Returns the last strategy's first-page error if every strategy
    /// failed on its first page, or the error of a later page that failed
    /// twice. Returns [`ServiceError::Io`] if the page directory cannot be
    /// created or written.
    pub async fn fetch(
        &self,
        request: &FetchRequest,
        token: &CancellationToken,
    ) -> Result<FetchOutcome, ServiceError> {
        let mut requests = 0u32;
        let mut last_error = None;

        log::info!(
            "Fetching {} from {} ({})",
            request.endpoint.type_name,
            request.endpoint.url,
            request.filter
        );

        for (i, strategy) in self.config.strategies.iter().enumerate() {
            if token.is_cancelled() {
                return Ok(FetchOutcome::Cancelled { requests });
            }
            if i > 0 {
                log::warn!("Falling back to {strategy} for {}", request.endpoint.type_name);
            }

            match self
                .run_strategy(*strategy, request, token, &mut requests)
                .await
            {
                Ok(outcome) => return Ok(outcome),
                Err(StrategyError::Fatal(e)) => return Err(e),
                Err(StrategyError::FirstPage(e)) => {
                    log::warn!("First page with {strategy} failed: {e}");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| ServiceError::Resolution {
            message: "no fetch strategy configured".to_string(),
        }))
    }

    fn base_params(&self, strategy: FetchStrategy, request: &FetchRequest) -> GetFeatureParams {
        let mut params = GetFeatureParams::new(
            request.endpoint.url.clone(),
            strategy.version(),
            request.endpoint.type_name.clone(),
            request.srs_name,
        );
        params.bbox = request.filter.server_bbox().copied();
        params.cql_filter = request.filter.server_expression().map(ToString::to_string);
        params
    }

    /// Asks the server for the number of matches. Failures are logged and
    /// ignored.
    async fn count_hits(&self, params: &GetFeatureParams) -> Option<u64> {
        let mut hits = params.clone();
        hits.hits_only = true;
        match self
            .transport
            .get_feature(&hits, self.config.metadata_timeout)
            .await
        {
            Ok(body) => {
                let total = parse_hits(&body);
                if total.is_none() {
                    log::debug!("Hit count response carried no total");
                }
                total
            }
            Err(e) => {
                log::debug!("Hit count request failed (non-fatal): {e}");
                None
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    async fn run_strategy(
        &self,
        strategy: FetchStrategy,
        request: &FetchRequest,
        token: &CancellationToken,
        requests: &mut u32,
    ) -> Result<FetchOutcome, StrategyError> {
        let base = self.base_params(strategy, request);
        let page_size = self.config.page_size.max(1);
        let max_pages = if strategy.is_paginated() {
            self.config.max_pages.max(1)
        } else {
            1
        };

        let mut number_matched = None;
        if self.config.count_first && strategy.is_paginated() {
            number_matched = self.count_hits(&base).await;
            if let Some(total) = number_matched {
                log::info!("Server reports {total} matching features");
                self.progress.set_total(total);
            }
            tokio::task::yield_now().await;
        }

        let dir = self
            .temp_dir()
            .map_err(|e| StrategyError::Fatal(ServiceError::Io(e)))?;
        let mut pages = BTreeMap::new();
        let mut fetched: u64 = 0;

        for index in 0..max_pages {
            if token.is_cancelled() {
                return Ok(cancelled(dir, *requests));
            }

            let mut params = base.clone();
            if strategy.is_paginated() {
                params.count = Some(page_size);
                params.start_index = Some(u64::from(index) * page_size);
            }

            self.progress
                .set_message(format!("{}: page {}", request.endpoint.layer_name(), index + 1));

            let body = if index == 0 {
                *requests += 1;
                match self
                    .transport
                    .get_feature(&params, self.config.page_timeout)
                    .await
                {
                    Ok(body) => body,
                    Err(e) => return Err(first_page_failure(dir, e)),
                }
            } else {
                let label = format!("page {}", index + 1);
                let outcome = with_retry(
                    RetryPolicy::once(self.config.retry_delay),
                    token,
                    &label,
                    |_| {
                        *requests += 1;
                        self.transport.get_feature(&params, self.config.page_timeout)
                    },
                )
                .await;
                match outcome {
                    RetryOutcome::Success { value, .. } => value,
                    RetryOutcome::Cancelled { .. } => return Ok(cancelled(dir, *requests)),
                    RetryOutcome::Failed { error, attempts } => {
                        log::error!("{label} failed after {attempts} attempts: {error}");
                        close_quietly(dir);
                        return Err(StrategyError::Fatal(error));
                    }
                }
            };

            tokio::task::yield_now().await;

            if token.is_cancelled() {
                return Ok(cancelled(dir, *requests));
            }

            if let Some(message) = detect_exception(&body) {
                if index == 0 {
                    return Err(first_page_failure(
                        dir,
                        ServiceError::ServiceException { message },
                    ));
                }
                log::warn!(
                    "Service exception on page {} ends the fetch: {message}",
                    index + 1
                );
                break;
            }

            let summary = match summarize(&body) {
                Ok(summary) => summary,
                Err(e) if index == 0 => return Err(first_page_failure(dir, e)),
                Err(e) => {
                    close_quietly(dir);
                    return Err(StrategyError::Fatal(e));
                }
            };

            if index == 0 && number_matched.is_none() {
                number_matched = summary.number_matched;
                if let Some(total) = number_matched {
                    self.progress.set_total(total);
                }
            }

            if summary.feature_count == 0 {
                log::debug!("Page {} is empty, fetch complete", index + 1);
                break;
            }

            let path = dir.path().join(format!("page_{index:05}.json"));
            if let Err(e) = tokio::fs::write(&path, body.as_bytes()).await {
                close_quietly(dir);
                return Err(StrategyError::Fatal(ServiceError::Io(e)));
            }
            pages.insert(
                index,
                DownloadPage {
                    index,
                    feature_count: summary.feature_count,
                    path,
                },
            );
            fetched += summary.feature_count as u64;
            self.progress.page_received(index, summary.feature_count as u64);
            log::debug!(
                "Page {}: {} features ({fetched} total)",
                index + 1,
                summary.feature_count
            );

            if !strategy.is_paginated() || (summary.feature_count as u64) < page_size {
                break;
            }
            if number_matched.is_some_and(|total| fetched >= total) {
                log::debug!("Reached the reported total of {fetched} features");
                break;
            }
            if index + 1 == max_pages {
                log::warn!(
                    "Stopped after the {max_pages}-page ceiling with {fetched} features; \
                     the collection may be truncated"
                );
            }
        }

        self.progress.finish(format!(
            "{}: {fetched} features in {} pages",
            request.endpoint.layer_name(),
            pages.len()
        ));

        Ok(FetchOutcome::Completed(PageSet {
            dir,
            pages,
            strategy,
            requests: *requests,
            number_matched,
        }))
    }

    fn temp_dir(&self) -> std::io::Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(TEMP_PREFIX);
        match &self.config.work_dir {
            Some(dir) => builder.tempdir_in(dir),
            None => builder.tempdir(),
        }
    }
}

fn cancelled(dir: TempDir, requests: u32) -> FetchOutcome {
    log::info!("Fetch cancelled after {requests} requests");
    close_quietly(dir);
    FetchOutcome::Cancelled { requests }
}

fn first_page_failure(dir: TempDir, error: ServiceError) -> StrategyError {
    close_quietly(dir);
    StrategyError::FirstPage(error)
}

fn close_quietly(dir: TempDir) {
    let path = dir.path().to_path_buf();
    if let Err(e) = dir.close() {
        log::warn!("Failed to remove page directory {}: {e}", path.display());
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use geoharvest_feature_models::PIPELINE_CRS;

    use super::*;

    /// Serves a synthetic collection of `total` features and records every
    /// request.
    pub struct StubTransport {
        pub total: u64,
        pub report_total: bool,
        pub fail_first_paged: bool,
        pub reject_hits: bool,
        pub scripted: Mutex<VecDeque<Result<String, u16>>>,
        pub cancel_on_page: Option<(u64, CancellationToken)>,
        pub calls: Mutex<Vec<GetFeatureParams>>,
    }

    impl StubTransport {
        pub fn new(total: u64) -> Self {
            Self {
                total,
                report_total: true,
                fail_first_paged: false,
                reject_hits: false,
                scripted: Mutex::new(VecDeque::new()),
                cancel_on_page: None,
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn page_calls(&self) -> Vec<GetFeatureParams> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|p| !p.hits_only)
                .cloned()
                .collect()
        }
    }

    /// A `GeoJSON` page of `count` unit squares numbered from `first`.
    pub fn page_body(first: u64, count: u64, number_matched: Option<u64>) -> String {
        let features: Vec<String> = (first..first + count)
            .map(|i| {
                #[allow(clippy::cast_precision_loss)]
                let x = (i % 1000) as f64;
                format!(
                    r#"{{"type":"Feature","geometry":{{"type":"Polygon","coordinates":[[[{x},0],[{x1},0],[{x1},1],[{x},1],[{x},0]]]}},"properties":{{"fid":{i},"year":{year}}}}}"#,
                    x1 = x + 1.0,
                    year = 2000 + (i % 20),
                )
            })
            .collect();
        let matched = number_matched.map_or_else(String::new, |n| format!(r#""numberMatched":{n},"#));
        format!(
            r#"{{"type":"FeatureCollection",{matched}"features":[{}]}}"#,
            features.join(",")
        )
    }

    #[async_trait]
    impl FeatureTransport for StubTransport {
        async fn get_feature(
            &self,
            params: &GetFeatureParams,
            _timeout: Duration,
        ) -> Result<String, ServiceError> {
            self.calls.lock().unwrap().push(params.clone());

            if params.hits_only {
                if self.reject_hits {
                    return Err(ServiceError::Status {
                        status: 400,
                        url: params.url.clone(),
                    });
                }
                return Ok(format!(r#"{{"numberMatched":{},"features":[]}}"#, self.total));
            }

            if let Some(scripted) = self.scripted.lock().unwrap().pop_front() {
                return scripted.map_err(|status| ServiceError::Status {
                    status,
                    url: params.url.clone(),
                });
            }

            let start = params.start_index.unwrap_or(0);
            let size = params.count.unwrap_or(self.total);

            if let Some((page, token)) = &self.cancel_on_page
                && start / size.max(1) + 1 == *page
            {
                token.cancel();
            }

            if params.version.supports_paging() && self.fail_first_paged && start == 0 {
                return Err(ServiceError::Status {
                    status: 500,
                    url: params.url.clone(),
                });
            }

            let count = size.min(self.total.saturating_sub(start));
            let matched = self.report_total.then_some(self.total);
            Ok(page_body(start, count, matched))
        }
    }

    pub fn request() -> FetchRequest {
        FetchRequest {
            endpoint: crate::resolve::EndpointResolver::resolve_url(
                "https://host/geoserver/prodes-cerrado-nb/yearly_deforestation/ows",
            )
            .unwrap(),
            filter: FilterSpec::None,
            srs_name: PIPELINE_CRS,
        }
    }

    pub fn config(page_size: u64) -> FetchConfig {
        FetchConfig {
            page_size,
            retry_delay: Duration::ZERO,
            count_first: false,
            ..FetchConfig::default()
        }
    }

    async fn run(stub: Arc<StubTransport>, config: FetchConfig) -> FetchOutcome {
        PaginatedFetcher::new(stub, config)
            .fetch(&request(), &CancellationToken::new())
            .await
            .unwrap()
    }

    fn completed(outcome: FetchOutcome) -> PageSet {
        match outcome {
            FetchOutcome::Completed(set) => set,
            FetchOutcome::Cancelled { .. } => panic!("fetch was cancelled"),
        }
    }

    #[tokio::test]
    async fn partial_last_page_needs_ceil_requests() {
        let stub = Arc::new(StubTransport::new(25));
        let set = completed(run(stub.clone(), config(10)).await);
        assert_eq!(set.total_features(), 25);
        assert_eq!(set.len(), 3);
        assert_eq!(stub.page_calls().len(), 3);
        assert_eq!(set.requests, 3);
        let indices: Vec<u32> = set.pages().map(|p| p.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn exact_multiple_stops_on_number_matched() {
        let stub = Arc::new(StubTransport::new(30));
        let set = completed(run(stub.clone(), config(10)).await);
        assert_eq!(set.total_features(), 30);
        assert_eq!(stub.page_calls().len(), 3);
    }

    #[tokio::test]
    async fn exact_multiple_without_total_stops_on_empty_page() {
        let mut stub = StubTransport::new(30);
        stub.report_total = false;
        let stub = Arc::new(stub);
        let set = completed(run(stub.clone(), config(10)).await);
        assert_eq!(set.total_features(), 30);
        assert_eq!(set.len(), 3);
        assert_eq!(stub.page_calls().len(), 4);
    }

    #[tokio::test]
    async fn large_collection_with_small_tail_takes_two_requests() {
        let stub = Arc::new(StubTransport::new(51_200));
        let set = completed(run(stub.clone(), config(DEFAULT_PAGE_SIZE)).await);
        assert_eq!(set.total_features(), 51_200);
        let calls = stub.page_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].start_index, Some(50_000));
    }

    #[tokio::test]
    async fn empty_collection_completes_empty() {
        let stub = Arc::new(StubTransport::new(0));
        let set = completed(run(stub.clone(), config(10)).await);
        assert!(set.is_empty());
        assert_eq!(stub.page_calls().len(), 1);
    }

    #[tokio::test]
    async fn first_page_failure_falls_back_to_one_legacy_request() {
        let mut stub = StubTransport::new(120);
        stub.fail_first_paged = true;
        let stub = Arc::new(stub);
        let set = completed(run(stub.clone(), config(50)).await);

        assert_eq!(set.total_features(), 120);
        assert_eq!(set.strategy.version(), WfsVersion::V1_0_0);
        let calls = stub.page_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].version, WfsVersion::V1_0_0);
        assert_eq!(calls[1].start_index, None);
    }

    #[tokio::test]
    async fn first_page_exception_falls_back() {
        let stub = StubTransport::new(5);
        stub.scripted.lock().unwrap().push_back(Ok(
            "<ows:ExceptionReport><ows:ExceptionText>paging not supported</ows:ExceptionText></ows:ExceptionReport>"
                .to_string(),
        ));
        let stub = Arc::new(stub);
        let set = completed(run(stub.clone(), config(10)).await);
        assert_eq!(set.total_features(), 5);
        assert_eq!(set.strategy.version(), WfsVersion::V1_0_0);
    }

    #[tokio::test]
    async fn every_strategy_failing_returns_the_last_error() {
        let stub = StubTransport::new(5);
        {
            let mut scripted = stub.scripted.lock().unwrap();
            scripted.push_back(Err(500));
            scripted.push_back(Err(404));
        }
        let err = PaginatedFetcher::new(Arc::new(stub), config(10))
            .fetch(&request(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Status { status: 404, .. }));
        assert!(err.is_network());
    }

    #[tokio::test]
    async fn later_page_is_retried_once() {
        let stub = StubTransport::new(15);
        let stub = Arc::new(stub);
        let fetcher = PaginatedFetcher::new(stub.clone(), config(10));

        // First call goes through, second fails once, then succeeds.
        let token = CancellationToken::new();
        stub.scripted
            .lock()
            .unwrap()
            .push_back(Ok(page_body(0, 10, Some(15))));
        stub.scripted.lock().unwrap().push_back(Err(503));

        let set = match fetcher.fetch(&request(), &token).await.unwrap() {
            FetchOutcome::Completed(set) => set,
            FetchOutcome::Cancelled { .. } => panic!("cancelled"),
        };
        assert_eq!(set.total_features(), 15);
        assert_eq!(set.requests, 3);
    }

    #[tokio::test]
    async fn later_page_failing_twice_fails_the_fetch() {
        let stub = StubTransport::new(15);
        {
            let mut scripted = stub.scripted.lock().unwrap();
            scripted.push_back(Ok(page_body(0, 10, Some(15))));
            scripted.push_back(Err(503));
            scripted.push_back(Err(503));
        }
        let err = PaginatedFetcher::new(Arc::new(stub), config(10))
            .fetch(&request(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Status { status: 503, .. }));
    }

    #[tokio::test]
    async fn later_page_exception_ends_fetch_with_pages_so_far() {
        let stub = StubTransport::new(25);
        {
            let mut scripted = stub.scripted.lock().unwrap();
            scripted.push_back(Ok(page_body(0, 10, None)));
            scripted.push_back(Ok(
                "<ServiceExceptionReport><ServiceException>timeout</ServiceException></ServiceExceptionReport>"
                    .to_string(),
            ));
        }
        let set = completed(run(Arc::new(stub), config(10)).await);
        assert_eq!(set.total_features(), 10);
    }

    #[tokio::test]
    async fn cancel_during_page_three_of_ten() {
        let work = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        let mut stub = StubTransport::new(100);
        stub.cancel_on_page = Some((3, token.clone()));
        let stub = Arc::new(stub);

        let mut cfg = config(10);
        cfg.work_dir = Some(work.path().to_path_buf());
        let outcome = PaginatedFetcher::new(stub.clone(), cfg)
            .fetch(&request(), &token)
            .await
            .unwrap();

        match outcome {
            FetchOutcome::Cancelled { requests } => assert!(requests <= 3),
            FetchOutcome::Completed(_) => panic!("expected cancellation"),
        }
        assert!(stub.page_calls().len() <= 3);
        assert_eq!(std::fs::read_dir(work.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn cancelled_before_start_issues_no_requests() {
        let token = CancellationToken::new();
        token.cancel();
        let stub = Arc::new(StubTransport::new(10));
        let outcome = PaginatedFetcher::new(stub.clone(), config(10))
            .fetch(&request(), &token)
            .await
            .unwrap();
        assert!(matches!(outcome, FetchOutcome::Cancelled { requests: 0 }));
        assert!(stub.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn page_ceiling_is_enforced() {
        let stub = Arc::new(StubTransport::new(1_000));
        let mut cfg = config(10);
        cfg.max_pages = 4;
        let set = completed(run(stub.clone(), cfg).await);
        assert_eq!(set.len(), 4);
        assert_eq!(set.total_features(), 40);
    }

    #[tokio::test]
    async fn hit_count_failure_is_not_fatal() {
        let mut stub = StubTransport::new(12);
        stub.reject_hits = true;
        let stub = Arc::new(stub);
        let mut cfg = config(10);
        cfg.count_first = true;
        let set = completed(run(stub.clone(), cfg).await);
        assert_eq!(set.total_features(), 12);
        assert_eq!(stub.page_calls().len(), 2);
    }

    #[tokio::test]
    async fn page_files_are_removed_on_close() {
        let stub = Arc::new(StubTransport::new(15));
        let set = completed(run(stub, config(10)).await);
        let dir = set.dir().to_path_buf();
        assert!(dir.exists());
        let first = set.pages().next().unwrap().clone();
        assert!(set.read_page(&first).await.unwrap().contains("FeatureCollection"));
        set.close().unwrap();
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn server_filter_goes_into_the_request() {
        let stub = Arc::new(StubTransport::new(3));
        let mut req = request();
        req.filter = FilterSpec::AttributeExpression {
            expression: "\"year\" = 2005".to_string(),
        };
        PaginatedFetcher::new(stub.clone(), config(10))
            .fetch(&req, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            stub.page_calls()[0].cql_filter.as_deref(),
            Some("\"year\" = 2005")
        );
    }
}
