//! Endpoint resolution.
//!
//! Maps a dataset selection onto the concrete service URL and the
//! `namespace:layer` type name to request. Static registry entries win;
//! otherwise the type name is parsed out of the URL path, which for
//! `GeoServer` layer-scoped endpoints has the form
//! `.../geoserver/<namespace>/<layer>/ows`.

use geoharvest_feature_models::Crs;

use crate::ServiceError;
use crate::registry::{EndpointDefinition, LayerKind, all_endpoints};

/// Path marker after which the namespace and layer segments appear.
pub const URL_MARKER: &str = "/geoserver/";

/// What the caller wants to download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointQuery {
    /// Dataset family (e.g. `"prodes"`).
    pub family: String,
    /// Region (e.g. `"cerrado"`).
    pub region: String,
    /// Sub-layer kind.
    pub kind: LayerKind,
    /// Explicit service URL. Overrides the registry URL and is used for
    /// type-name derivation when the registry has no explicit type name.
    pub url: Option<String>,
}

/// A fully resolved service endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEndpoint {
    /// Service base URL (no query string).
    pub url: String,
    /// Qualified type name (`namespace:layer`).
    pub type_name: String,
    /// Date attribute for date-range filters.
    pub date_field: Option<String>,
    /// Year attribute for year-range filters.
    pub year_field: Option<String>,
    /// Class attribute for class-set filters.
    pub class_field: Option<String>,
    /// CRS the layer is stored in.
    pub native_crs: Option<Crs>,
}

impl ResolvedEndpoint {
    /// Returns the layer part of the type name.
    #[must_use]
    pub fn layer_name(&self) -> &str {
        self.type_name
            .split_once(':')
            .map_or(self.type_name.as_str(), |(_, layer)| layer)
    }
}

/// Resolves dataset selections against a set of endpoint definitions.
pub struct EndpointResolver {
    definitions: Vec<EndpointDefinition>,
}

impl Default for EndpointResolver {
    fn default() -> Self {
        Self::builtin()
    }
}

impl EndpointResolver {
    /// Creates a resolver over the embedded registry.
    #[must_use]
    pub fn builtin() -> Self {
        Self::new(all_endpoints())
    }

    /// Creates a resolver over custom definitions.
    #[must_use]
    pub const fn new(definitions: Vec<EndpointDefinition>) -> Self {
        Self { definitions }
    }

    /// Returns every known definition.
    #[must_use]
    pub fn definitions(&self) -> &[EndpointDefinition] {
        &self.definitions
    }

    /// Looks up the registry entry for a (family, region, kind) triple.
    ///
    /// Family and region match case-insensitively, and `-` / `_` are
    /// interchangeable in region names.
    #[must_use]
    pub fn lookup(
        &self,
        family: &str,
        region: &str,
        kind: LayerKind,
    ) -> Option<&EndpointDefinition> {
        let region = normalize_region(region);
        self.definitions.iter().find(|d| {
            d.family.eq_ignore_ascii_case(family)
                && normalize_region(&d.entry.region) == region
                && d.entry.kind == kind
        })
    }

    /// Resolves a query to a concrete endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Resolution`] when there is neither a
    /// registry mapping with an explicit type name nor a URL whose path
    /// contains the [`URL_MARKER`] followed by two segments.
    pub fn resolve(&self, query: &EndpointQuery) -> Result<ResolvedEndpoint, ServiceError> {
        let definition = self.lookup(&query.family, &query.region, query.kind);

        let Some(url) = query
            .url
            .clone()
            .or_else(|| definition.map(|d| d.entry.url.clone()))
        else {
            return Err(ServiceError::Resolution {
                message: format!(
                    "no endpoint for {}/{}/{} and no URL given",
                    query.family, query.region, query.kind
                ),
            });
        };

        // An explicit URL override means the registry type name may not
        // apply; only trust it when the URLs agree.
        let explicit = definition
            .filter(|d| query.url.as_ref().is_none_or(|u| *u == d.entry.url))
            .and_then(|d| d.entry.type_name.clone());

        let type_name = match explicit {
            Some(name) => name,
            None => type_name_from_url(&url).ok_or_else(|| ServiceError::Resolution {
                message: format!(
                    "cannot derive a type name for {}/{}/{} from {url}",
                    query.family, query.region, query.kind
                ),
            })?,
        };

        log::debug!(
            "Resolved {}/{}/{} -> {type_name} at {url}",
            query.family,
            query.region,
            query.kind
        );

        Ok(ResolvedEndpoint {
            url: strip_query(&url).to_string(),
            type_name,
            date_field: definition.and_then(|d| d.entry.date_field.clone()),
            year_field: definition.and_then(|d| d.entry.year_field.clone()),
            class_field: definition.and_then(|d| d.entry.class_field.clone()),
            native_crs: definition.and_then(|d| d.entry.native_crs),
        })
    }

    /// Resolves a bare service URL with no registry context.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Resolution`] if no type name can be derived.
    pub fn resolve_url(url: &str) -> Result<ResolvedEndpoint, ServiceError> {
        let type_name = type_name_from_url(url).ok_or_else(|| ServiceError::Resolution {
            message: format!("cannot derive a type name from {url}"),
        })?;
        Ok(ResolvedEndpoint {
            url: strip_query(url).to_string(),
            type_name,
            date_field: None,
            year_field: None,
            class_field: None,
            native_crs: None,
        })
    }
}

/// Derives `namespace:layer` from the two path segments following
/// [`URL_MARKER`].
///
/// `https://host/geoserver/prodes-cerrado-nb/yearly_deforestation/ows`
/// → `prodes-cerrado-nb:yearly_deforestation`. Returns `None` when the
/// marker is missing or fewer than two segments follow it (the service-wide
/// `.../geoserver/ows` endpoint has no layer in its path).
#[must_use]
pub fn type_name_from_url(url: &str) -> Option<String> {
    let path = strip_query(url);
    let idx = path.find(URL_MARKER)?;
    let mut segments = path[idx + URL_MARKER.len()..]
        .split('/')
        .filter(|s| !s.is_empty());
    let namespace = segments.next()?;
    let layer = segments.next()?;
    if is_service_segment(namespace) || is_service_segment(layer) {
        return None;
    }
    Some(format!("{namespace}:{layer}"))
}

fn is_service_segment(segment: &str) -> bool {
    matches!(
        segment.to_ascii_lowercase().as_str(),
        "ows" | "wfs" | "wms" | "wcs" | "web"
    )
}

fn strip_query(url: &str) -> &str {
    url.split_once('?').map_or(url, |(base, _)| base)
}

fn normalize_region(region: &str) -> String {
    region.trim().to_ascii_lowercase().replace('-', "_")
}
