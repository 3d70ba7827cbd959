//! Selector clause evaluation against a single node.

use crate::error::ClauseError;
use crate::labels::sanitize_label_value;
use crate::polygon::Polygon;
use crate::types::{NodeGeoInfo, Operator, RegionType, SelectorClause};

/// Canonical form used on both sides of a named-region comparison.
///
/// Region names are stored on nodes as label values, so the clause value is
/// put through the same sanitisation before comparing case-insensitively.
pub fn normalize_region_name(name: &str) -> String {
    sanitize_label_value(name).to_lowercase()
}

/// Decide whether `node` matches a clause value for `region`.
///
/// A malformed polygon literal or an unsupported region type never matches.
pub fn matches(region: RegionType, clause_value: &str, node: &NodeGeoInfo) -> bool {
    match Matcher::compile(region, clause_value) {
        Ok(matcher) => matcher.matches(node),
        Err(_) => false,
    }
}

/// A clause value prepared for repeated evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum Matcher {
    Named { region: RegionType, name: String },
    Polygon(Polygon),
}

impl Matcher {
    pub fn compile(region: RegionType, value: &str) -> Result<Self, ClauseError> {
        match region {
            RegionType::Polygon => Ok(Self::Polygon(Polygon::parse(value)?)),
            RegionType::Unsupported => Err(ClauseError::UnsupportedRegionType),
            named => Ok(Self::Named {
                region: named,
                name: normalize_region_name(value),
            }),
        }
    }

    pub fn matches(&self, node: &NodeGeoInfo) -> bool {
        match self {
            Self::Named { region, name } => node
                .region_name(*region)
                .map(normalize_region_name)
                .is_some_and(|n| !n.is_empty() && n == *name),
            Self::Polygon(polygon) => node
                .coordinate
                .is_some_and(|c| c.is_valid() && polygon.contains(c)),
        }
    }
}

/// A selector clause after validation.
///
/// An invalid clause keeps its error so it can be surfaced in status; it
/// selects nothing regardless of its operator.
#[derive(Debug, Clone)]
pub struct CompiledClause {
    pub operator: Operator,
    pub limit: Option<usize>,
    pub matcher: Result<Matcher, ClauseError>,
}

impl CompiledClause {
    pub fn compile(region: RegionType, clause: &SelectorClause) -> Self {
        let matcher = match clause.operator {
            Operator::Unsupported => Err(ClauseError::UnsupportedOperator),
            Operator::In | Operator::NotIn => Matcher::compile(region, &clause.value),
        };
        Self {
            operator: clause.operator,
            limit: clause.limit(),
            matcher,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.matcher.is_ok()
    }
}
