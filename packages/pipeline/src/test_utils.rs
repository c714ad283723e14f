use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use geoharvest_feature_models::{CancellationToken, FeatureCollection, PIPELINE_CRS};
use geoharvest_service::ServiceError;
use geoharvest_service::page::parse_features;
use geoharvest_service::transport::{FeatureTransport, GetFeatureParams};

use crate::PipelineRequest;

const GO: &str = r#"{"type":"Feature","geometry":{"type":"Polygon","coordinates":[[[-50,-20],[-40,-20],[-40,-10],[-50,-10],[-50,-20]]]},"properties":{"uf":"GO","name":"Goiás"}}"#;
const MT: &str = r#"{"type":"Feature","geometry":{"type":"Polygon","coordinates":[[[-60,-20],[-50,-20],[-50,-10],[-60,-10],[-60,-20]]]},"properties":{"uf":"MT","name":"Mato Grosso"}}"#;

fn collection(features: &[&str], number_matched: Option<usize>) -> String {
    let matched = number_matched.map_or_else(String::new, |n| format!(r#""numberMatched":{n},"#));
    format!(
        r#"{{"type":"FeatureCollection",{matched}"features":[{}]}}"#,
        features.join(",")
    )
}

/// Two adjacent 10° states, GO east of MT, split at 50°W.
pub fn states_geojson() -> String {
    collection(&[GO, MT], None)
}

pub fn states() -> FeatureCollection {
    let parsed = parse_features(&states_geojson()).unwrap();
    FeatureCollection::new(parsed.schema, PIPELINE_CRS, parsed.features)
}

/// Unit square `i` spans x = -55 + (i mod 10) .. +1 at y = -15 .. -14,
/// with year 2015 + (i mod 10) and alternating classes.
fn deforestation(i: usize, with_class: bool) -> String {
    let step = i % 10;
    #[allow(clippy::cast_precision_loss)]
    let x = -55.0 + step as f64;
    let class = if step % 2 == 0 { "desmatamento" } else { "vegetacao" };
    let class = if with_class {
        format!(r#","main_class":"{class}""#)
    } else {
        String::new()
    };
    format!(
        r#"{{"type":"Feature","geometry":{{"type":"Polygon","coordinates":[[[{x},-15],[{x1},-15],[{x1},-14],[{x},-14],[{x},-15]]]}},"properties":{{"fid":{i},"year":{year}{class}}}}}"#,
        x1 = x + 1.0,
        year = 2015 + step,
    )
}

/// Serves the `states` boundary layer and a synthetic deforestation layer
/// for every other type name, honouring `startIndex` / `count`.
pub struct HarvestStub {
    count: usize,
    with_class: bool,
    cancel_at: Option<(u64, CancellationToken)>,
    pub calls: Mutex<Vec<GetFeatureParams>>,
}

impl HarvestStub {
    pub fn new(count: usize) -> Self {
        Self {
            count,
            with_class: true,
            cancel_at: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub const fn without_class(mut self) -> Self {
        self.with_class = false;
        self
    }

    /// Cancels `token` while serving data page `page` (1-based).
    pub fn cancel_at_page(mut self, page: u64, token: CancellationToken) -> Self {
        self.cancel_at = Some((page, token));
        self
    }

    fn is_boundary(params: &GetFeatureParams) -> bool {
        params.type_name.ends_with(":states")
    }

    /// Page requests against the data layer.
    pub fn data_calls(&self) -> Vec<GetFeatureParams> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|p| !p.hits_only && !Self::is_boundary(p))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl FeatureTransport for HarvestStub {
    async fn get_feature(
        &self,
        params: &GetFeatureParams,
        _timeout: Duration,
    ) -> Result<String, ServiceError> {
        self.calls.lock().unwrap().push(params.clone());

        let layer: Vec<String> = if Self::is_boundary(params) {
            vec![GO.to_string(), MT.to_string()]
        } else {
            (0..self.count)
                .map(|i| deforestation(i, self.with_class))
                .collect()
        };
        let total = layer.len();

        if params.hits_only {
            return Ok(collection(&[], Some(total)));
        }

        let start = usize::try_from(params.start_index.unwrap_or(0)).unwrap();
        let size = params
            .count
            .map_or(total, |c| usize::try_from(c).unwrap());

        if let Some((page, token)) = &self.cancel_at
            && !Self::is_boundary(params)
            && (start / size.max(1) + 1) as u64 == *page
        {
            token.cancel();
        }

        let page: Vec<&str> = layer
            .iter()
            .skip(start)
            .take(size)
            .map(String::as_str)
            .collect();
        Ok(collection(&page, Some(total)))
    }
}

/// A one-dataset `prodes/cerrado/yearly` request with page size 4 writing
/// to `output`, followed by `extra` TOML tables.
pub fn request(output: &Path, extra: &str) -> PipelineRequest {
    let text = format!(
        r#"
        [[datasets]]
        family = "prodes"
        region = "cerrado"
        kind = "yearly"

        [fetch]
        page_size = 4

        [output]
        path = '{}'

        {extra}
        "#,
        output.display()
    );
    PipelineRequest::from_toml_str(&text).unwrap()
}
