//! HTTP transport for feature-service requests.
//!
//! The fetcher talks to the service through the [`FeatureTransport`] trait
//! so tests can swap in an in-memory stub. [`HttpTransport`] is the
//! production implementation on top of `reqwest`.

use std::time::Duration;

use async_trait::async_trait;
use geoharvest_feature_models::{BBox, Crs};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::ServiceError;

/// Output format requested from the service.
pub const OUTPUT_FORMAT: &str = "application/json";

const USER_AGENT: &str = concat!("geoharvest/", env!("CARGO_PKG_VERSION"));

/// Protocol version of a request.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
pub enum WfsVersion {
    /// Paging-capable version (`count` / `startIndex`).
    #[strum(serialize = "2.0.0")]
    #[serde(rename = "2.0.0")]
    V2_0_0,
    /// Legacy version without paging (`maxFeatures` only).
    #[strum(serialize = "1.0.0")]
    #[serde(rename = "1.0.0")]
    V1_0_0,
}

impl WfsVersion {
    /// Whether the version understands `startIndex`.
    #[must_use]
    pub const fn supports_paging(self) -> bool {
        matches!(self, Self::V2_0_0)
    }
}

/// Parameters of one `GetFeature` request.
#[derive(Debug, Clone, PartialEq)]
pub struct GetFeatureParams {
    /// Service base URL.
    pub url: String,
    /// Protocol version.
    pub version: WfsVersion,
    /// Qualified type name.
    pub type_name: String,
    /// CRS to return geometries in.
    pub srs_name: Crs,
    /// Page size, if any.
    pub count: Option<u64>,
    /// Offset of the first feature, if paging.
    pub start_index: Option<u64>,
    /// Server-side bounding box.
    pub bbox: Option<BBox>,
    /// Server-side attribute expression.
    pub cql_filter: Option<String>,
    /// Ask only for the number of matches.
    pub hits_only: bool,
}

impl GetFeatureParams {
    /// Creates a plain full-collection request.
    #[must_use]
    pub fn new(
        url: impl Into<String>,
        version: WfsVersion,
        type_name: impl Into<String>,
        srs_name: Crs,
    ) -> Self {
        Self {
            url: url.into(),
            version,
            type_name: type_name.into(),
            srs_name,
            count: None,
            start_index: None,
            bbox: None,
            cql_filter: None,
            hits_only: false,
        }
    }

    /// Builds the query string pairs for this request.
    ///
    /// Never emits both `bbox` and `CQL_FILTER`: most servers reject the
    /// combination, so a bbox always wins and the expression is left to
    /// the caller to apply locally.
    #[must_use]
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let paging = self.version.supports_paging();
        let mut pairs = vec![
            ("service", "WFS".to_string()),
            ("version", self.version.to_string()),
            ("request", "GetFeature".to_string()),
            (
                if paging { "typeNames" } else { "typeName" },
                self.type_name.clone(),
            ),
            ("outputFormat", OUTPUT_FORMAT.to_string()),
            ("srsName", self.srs_name.to_string()),
        ];

        if self.hits_only && paging {
            pairs.push(("resultType", "hits".to_string()));
        } else if let Some(count) = self.count {
            pairs.push((if paging { "count" } else { "maxFeatures" }, count.to_string()));
        }

        if let Some(start) = self.start_index.filter(|_| paging) {
            pairs.push(("startIndex", start.to_string()));
        }

        if let Some(bbox) = &self.bbox {
            pairs.push(("bbox", bbox.to_query_value()));
        } else if let Some(cql) = &self.cql_filter {
            pairs.push(("CQL_FILTER", cql.clone()));
        }

        pairs
    }
}

/// Sends `GetFeature` requests and returns the raw response body.
#[async_trait]
pub trait FeatureTransport: Send + Sync {
    /// Performs one request with the given timeout.
    ///
    /// # Errors
    ///
    /// Returns a network-class [`ServiceError`] if the request fails or the
    /// service answers with a non-success status.
    async fn get_feature(
        &self,
        params: &GetFeatureParams,
        timeout: Duration,
    ) -> Result<String, ServiceError>;
}

/// `reqwest`-backed transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Builds a transport with its own connection pool.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Http`] if the TLS backend cannot be
    /// initialised.
    pub fn new() -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self { client })
    }

    /// Wraps an existing client.
    #[must_use]
    pub const fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl FeatureTransport for HttpTransport {
    async fn get_feature(
        &self,
        params: &GetFeatureParams,
        timeout: Duration,
    ) -> Result<String, ServiceError> {
        let response = self
            .client
            .get(&params.url)
            .query(&params.query_pairs())
            .timeout(timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ServiceError::Status {
                status: status.as_u16(),
                url: response.url().to_string(),
            });
        }

        Ok(response.text().await?)
    }
}

#[cfg(test)]
mod tests {
    use geoharvest_feature_models::PIPELINE_CRS;

    use super::*;

    fn params(version: WfsVersion) -> GetFeatureParams {
        GetFeatureParams::new("https://host/geoserver/ns/layer/ows", version, "ns:layer", PIPELINE_CRS)
    }

    fn value<'a>(pairs: &'a [(&'static str, String)], key: &str) -> Option<&'a str> {
        pairs.iter().find(|(k, _)| *k == key).map(|(_, v)| v.as_str())
    }

    #[test]
    fn paged_request_uses_count_and_start_index() {
        let mut p = params(WfsVersion::V2_0_0);
        p.count = Some(50_000);
        p.start_index = Some(100_000);
        let pairs = p.query_pairs();
        assert_eq!(value(&pairs, "version"), Some("2.0.0"));
        assert_eq!(value(&pairs, "typeNames"), Some("ns:layer"));
        assert_eq!(value(&pairs, "count"), Some("50000"));
        assert_eq!(value(&pairs, "startIndex"), Some("100000"));
        assert_eq!(value(&pairs, "srsName"), Some("EPSG:4674"));
        assert_eq!(value(&pairs, "outputFormat"), Some(OUTPUT_FORMAT));
    }

    #[test]
    fn legacy_request_has_no_paging() {
        let mut p = params(WfsVersion::V1_0_0);
        p.count = Some(10);
        p.start_index = Some(20);
        let pairs = p.query_pairs();
        assert_eq!(value(&pairs, "typeName"), Some("ns:layer"));
        assert_eq!(value(&pairs, "maxFeatures"), Some("10"));
        assert_eq!(value(&pairs, "startIndex"), None);
    }

    #[test]
    fn bbox_and_expression_are_never_combined() {
        let mut p = params(WfsVersion::V2_0_0);
        p.bbox = Some(BBox {
            min_x: -50.0,
            min_y: -15.0,
            max_x: -45.0,
            max_y: -10.0,
            crs: PIPELINE_CRS,
        });
        p.cql_filter = Some("\"year\" = 2020".to_string());
        let pairs = p.query_pairs();
        assert!(value(&pairs, "bbox").is_some());
        assert_eq!(value(&pairs, "CQL_FILTER"), None);

        p.bbox = None;
        let pairs = p.query_pairs();
        assert_eq!(value(&pairs, "CQL_FILTER"), Some("\"year\" = 2020"));
    }

    #[test]
    fn hits_request_asks_for_count_only() {
        let mut p = params(WfsVersion::V2_0_0);
        p.hits_only = true;
        p.count = Some(5);
        let pairs = p.query_pairs();
        assert_eq!(value(&pairs, "resultType"), Some("hits"));
        assert_eq!(value(&pairs, "count"), None);
    }
}
