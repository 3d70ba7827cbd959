//! Core placement types shared by the evaluator, the selection engine and
//! the SelectiveDeployment resource.

use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Geographic granularity a SelectiveDeployment filters on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum RegionType {
    City,
    State,
    Country,
    Continent,
    Polygon,
    /// Any value this version does not know; every clause compiles to an error.
    #[serde(other)]
    #[schemars(skip)]
    Unsupported,
}

impl RegionType {
    /// Returns true for the named-region types matched by string comparison.
    pub fn is_named(&self) -> bool {
        matches!(self, Self::City | Self::State | Self::Country | Self::Continent)
    }
}

impl fmt::Display for RegionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::City => "City",
            Self::State => "State",
            Self::Country => "Country",
            Self::Continent => "Continent",
            Self::Polygon => "Polygon",
            Self::Unsupported => "Unsupported",
        };
        f.write_str(s)
    }
}

/// Inclusion or exclusion semantics of a selector clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum Operator {
    In,
    NotIn,
    /// Any value this version does not know; the clause compiles to an error.
    #[serde(other)]
    #[schemars(skip)]
    Unsupported,
}

/// One `(value, operator, count)` rule of a SelectiveDeployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SelectorClause {
    /// Region name, or a polygon literal `[[lon, lat], ...]` for `Polygon`.
    pub value: String,

    pub operator: Operator,

    /// Maximum number of nodes this clause contributes; `0` means unlimited.
    #[serde(default)]
    pub count: u32,
}

impl SelectorClause {
    pub fn new(value: impl Into<String>, operator: Operator, count: u32) -> Self {
        Self {
            value: value.into(),
            operator,
            count,
        }
    }

    /// Returns the cap as an `Option`, `None` meaning unlimited.
    pub fn limit(&self) -> Option<usize> {
        (self.count > 0).then_some(self.count as usize)
    }
}

/// A WGS84 position in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub longitude: f64,
    pub latitude: f64,
}

impl Coordinate {
    pub const fn new(longitude: f64, latitude: f64) -> Self {
        Self {
            longitude,
            latitude,
        }
    }

    /// Returns true when both components are finite and within WGS84 bounds.
    pub fn is_valid(&self) -> bool {
        self.longitude.is_finite()
            && self.latitude.is_finite()
            && (-180.0..=180.0).contains(&self.longitude)
            && (-90.0..=90.0).contains(&self.latitude)
    }
}

/// Which node address produced the geolocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionSource {
    ExternalIp,
    InternalIp,
}

impl ResolutionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExternalIp => "external-ip",
            Self::InternalIp => "internal-ip",
        }
    }
}

/// Physical location attributes of a cluster node.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeGeoInfo {
    pub node: String,
    pub internal_ip: Option<IpAddr>,
    pub external_ip: Option<IpAddr>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub continent: Option<String>,
    pub coordinate: Option<Coordinate>,
    pub source: Option<ResolutionSource>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl NodeGeoInfo {
    /// An unresolved record for `node`.
    pub fn unresolved(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            ..Default::default()
        }
    }

    /// True when a lookup succeeded for this node.
    pub fn is_resolved(&self) -> bool {
        self.source.is_some()
    }

    /// The named-region attribute for `region`, if any.
    pub fn region_name(&self, region: RegionType) -> Option<&str> {
        match region {
            RegionType::City => self.city.as_deref(),
            RegionType::State => self.state.as_deref(),
            RegionType::Country => self.country.as_deref(),
            RegionType::Continent => self.continent.as_deref(),
            RegionType::Polygon | RegionType::Unsupported => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clause_limit() {
        assert_eq!(SelectorClause::new("Paris", Operator::In, 0).limit(), None);
        assert_eq!(SelectorClause::new("Paris", Operator::In, 3).limit(), Some(3));
    }

    #[test]
    fn test_clause_count_defaults_to_unlimited() {
        let clause: SelectorClause =
            serde_json::from_str(r#"{"value":"Paris","operator":"NotIn"}"#).unwrap();
        assert_eq!(clause.count, 0);
        assert_eq!(clause.operator, Operator::NotIn);
    }

    #[test]
    fn test_unknown_values_deserialize_as_unsupported() {
        let clause: SelectorClause =
            serde_json::from_str(r#"{"value":"Lyon","operator":"Near"}"#).unwrap();
        assert_eq!(clause.operator, Operator::Unsupported);

        let region: RegionType = serde_json::from_str(r#""Galaxy""#).unwrap();
        assert_eq!(region, RegionType::Unsupported);
        assert!(!region.is_named());
    }

    #[test]
    fn test_coordinate_bounds() {
        assert!(Coordinate::new(2.35, 48.85).is_valid());
        assert!(!Coordinate::new(181.0, 0.0).is_valid());
        assert!(!Coordinate::new(0.0, f64::NAN).is_valid());
    }
}
