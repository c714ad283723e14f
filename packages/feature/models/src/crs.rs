//! Coordinate reference system identifiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The geographic CRS every collection is normalized to before clipping
/// (SIRGAS 2000).
pub const PIPELINE_CRS: Crs = Crs::epsg(4674);

/// An EPSG-coded coordinate reference system.
///
/// Parses the spellings feature services use: `EPSG:4674`,
/// `urn:ogc:def:crs:EPSG::4674`, `urn:ogc:def:crs:EPSG:6.9:4674` and
/// `http://www.opengis.net/gml/srs/epsg.xml#4674`. Always displays as
/// `EPSG:<code>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Crs {
    code: u32,
}

impl Crs {
    /// Creates a CRS from an EPSG code.
    #[must_use]
    pub const fn epsg(code: u32) -> Self {
        Self { code }
    }

    /// Returns the EPSG code.
    #[must_use]
    pub const fn code(self) -> u32 {
        self.code
    }

    /// Returns `true` for geographic (longitude/latitude) systems this
    /// pipeline knows about.
    #[must_use]
    pub const fn is_geographic(self) -> bool {
        matches!(self.code, 4326 | 4674 | 4618 | 4269 | 4258)
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EPSG:{}", self.code)
    }
}

/// Error returned when a CRS identifier cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrsParseError {
    /// The identifier that failed to parse.
    pub input: String,
}

impl fmt::Display for CrsParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unrecognized CRS identifier \"{}\"", self.input)
    }
}

impl std::error::Error for CrsParseError {}

impl FromStr for Crs {
    type Err = CrsParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let upper = trimmed.to_ascii_uppercase();
        if !upper.contains("EPSG") {
            return Err(CrsParseError {
                input: trimmed.to_string(),
            });
        }
        // The code is always the trailing run of digits.
        let digits: String = trimmed
            .chars()
            .rev()
            .take_while(char::is_ascii_digit)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        digits
            .parse::<u32>()
            .ok()
            .filter(|code| *code > 0)
            .map(Self::epsg)
            .ok_or_else(|| CrsParseError {
                input: trimmed.to_string(),
            })
    }
}

impl TryFrom<String> for Crs {
    type Error = CrsParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Crs> for String {
    fn from(crs: Crs) -> Self {
        crs.to_string()
    }
}
