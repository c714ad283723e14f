//! Endpoint registry: static (family, region, kind) to service mappings.
//!
//! Each `.toml` file in `packages/service/endpoints/` describes one dataset
//! family and is baked into the binary at compile time via
//! [`include_str!`]. Adding a family means adding a TOML file and listing
//! it below.

use geoharvest_feature_models::Crs;
use serde::Deserialize;
use strum_macros::{AsRefStr, Display, EnumString};

/// TOML configs embedded at compile time.
const ENDPOINT_TOMLS: &[(&str, &str)] = &[
    ("prodes", include_str!("../endpoints/prodes.toml")),
    ("deter", include_str!("../endpoints/deter.toml")),
    ("boundaries", include_str!("../endpoints/boundaries.toml")),
];

/// Total number of configured endpoints (used in tests).
#[cfg(test)]
const EXPECTED_ENDPOINT_COUNT: usize = 26;

/// The sub-layer of a dataset family served by one endpoint.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum LayerKind {
    /// Deforestation increments, one polygon per mapping year.
    Yearly,
    /// Deforestation accumulated up to a base year.
    Accumulated,
    /// Residual deforestation detected late.
    Residual,
    /// Water bodies masked out of the mapping.
    Hydrography,
    /// Areas that were never forest.
    NoForest,
    /// Near-real-time alerts.
    Alerts,
    /// Publicly released (delayed) alerts.
    PublicAlerts,
    /// State boundaries.
    States,
    /// Region (biome) border.
    Border,
}

/// One family file as written in TOML.
#[derive(Debug, Deserialize)]
pub struct FamilyFile {
    /// Family identifier (e.g. `"prodes"`).
    pub family: String,
    /// Human-readable family description.
    pub description: String,
    /// Endpoints served for this family.
    pub endpoints: Vec<EndpointEntry>,
}

/// One endpoint entry as written in TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointEntry {
    /// Region identifier (e.g. `"cerrado"`).
    pub region: String,
    /// Sub-layer kind.
    pub kind: LayerKind,
    /// Service URL (usually the layer-scoped `ows` endpoint).
    pub url: String,
    /// Explicit `namespace:layer` type name. When absent, the type name is
    /// derived from `url`.
    pub type_name: Option<String>,
    /// Date attribute used for date-range filters.
    pub date_field: Option<String>,
    /// Integer year attribute used for year-range filters.
    pub year_field: Option<String>,
    /// Class attribute used for class-set filters.
    pub class_field: Option<String>,
    /// CRS the service stores the layer in.
    pub native_crs: Option<Crs>,
}

/// A registry entry together with the family it belongs to.
#[derive(Debug, Clone)]
pub struct EndpointDefinition {
    /// Family identifier.
    pub family: String,
    /// The entry itself.
    pub entry: EndpointEntry,
}

/// Parses one family file.
///
/// # Errors
///
/// Returns an error if the TOML is malformed or does not match the
/// expected structure.
pub fn parse_family_toml(toml_str: &str) -> Result<FamilyFile, toml::de::Error> {
    toml::from_str(toml_str)
}

/// Returns every embedded family file, parsed.
///
/// # Panics
///
/// Panics if an embedded TOML config is malformed (the configs are
/// compiled in and covered by tests).
#[must_use]
pub fn all_families() -> Vec<FamilyFile> {
    ENDPOINT_TOMLS
        .iter()
        .map(|(name, toml)| {
            parse_family_toml(toml).unwrap_or_else(|e| panic!("Failed to parse {name}.toml: {e}"))
        })
        .collect()
}

/// Returns every embedded endpoint definition, flattened across families.
#[must_use]
pub fn all_endpoints() -> Vec<EndpointDefinition> {
    flatten(all_families())
}

/// Flattens family files into definitions.
#[must_use]
pub fn flatten(families: Vec<FamilyFile>) -> Vec<EndpointDefinition> {
    families
        .into_iter()
        .flat_map(|file| {
            let family = file.family;
            file.endpoints.into_iter().map(move |entry| EndpointDefinition {
                family: family.clone(),
                entry,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_all_endpoints() {
        assert_eq!(all_endpoints().len(), EXPECTED_ENDPOINT_COUNT);
    }

    #[test]
    fn endpoint_triples_are_unique() {
        let endpoints = all_endpoints();
        let mut keys: Vec<String> = endpoints
            .iter()
            .map(|e| format!("{}/{}/{}", e.family, e.entry.region, e.entry.kind))
            .collect();
        keys.sort_unstable();
        keys.dedup();
        assert_eq!(keys.len(), EXPECTED_ENDPOINT_COUNT);
    }

    #[test]
    fn all_endpoints_have_urls() {
        for endpoint in all_endpoints() {
            assert!(
                endpoint.entry.url.starts_with("https://"),
                "{}/{}: bad url",
                endpoint.family,
                endpoint.entry.region
            );
        }
    }

    #[test]
    fn layer_kind_parses_case_insensitively() {
        assert_eq!("Yearly".parse::<LayerKind>(), Ok(LayerKind::Yearly));
        assert_eq!("no_forest".parse::<LayerKind>(), Ok(LayerKind::NoForest));
        assert_eq!(LayerKind::PublicAlerts.to_string(), "public_alerts");
    }
}
