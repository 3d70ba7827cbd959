//! Node selection: turns an ordered clause list into a target node set.
//!
//! Each clause is evaluated independently against the eligible inventory and
//! contributes up to `count` nodes; the target set is the union of all
//! contributions. Capped clauses keep the first nodes in ascending name order,
//! so identical input always yields identical output.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::debug;

use crate::error::ClauseError;
use crate::evaluator::CompiledClause;
use crate::types::{NodeGeoInfo, Operator, RegionType, SelectorClause};

/// Ordered (ascending), deduplicated node names.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(transparent)]
pub struct TargetNodeSet(Vec<String>);

impl TargetNodeSet {
    pub fn new<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set: BTreeSet<String> = nodes.into_iter().map(Into::into).collect();
        Self(set.into_iter().collect())
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, node: &str) -> bool {
        self.0
            .binary_search_by(|name| name.as_str().cmp(node))
            .is_ok()
    }

    pub fn into_vec(self) -> Vec<String> {
        self.0
    }
}

/// What one clause contributed during a selection pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ClauseOutcome {
    pub index: usize,
    /// Size of the raw match set before the operator and cap were applied.
    pub matched: usize,
    pub selected: Vec<String>,
    pub error: Option<ClauseError>,
}

/// Result of a selection pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub targets: TargetNodeSet,
    pub clauses: Vec<ClauseOutcome>,
    /// Number of resolved nodes that took part in the pass.
    pub eligible: usize,
}

impl Selection {
    /// Clauses rejected as malformed.
    pub fn invalid_clauses(&self) -> impl Iterator<Item = &ClauseOutcome> {
        self.clauses.iter().filter(|c| c.error.is_some())
    }
}

/// Select target nodes for `clauses` of the given region type.
///
/// Only nodes with a resolved geolocation are eligible; `NotIn` takes its
/// complement within that eligible set.
pub fn select(nodes: &[NodeGeoInfo], region: RegionType, clauses: &[SelectorClause]) -> Selection {
    let compiled: Vec<CompiledClause> = clauses
        .iter()
        .map(|c| CompiledClause::compile(region, c))
        .collect();
    select_compiled(nodes, &compiled)
}

pub fn select_compiled(nodes: &[NodeGeoInfo], clauses: &[CompiledClause]) -> Selection {
    let mut eligible: Vec<&NodeGeoInfo> = nodes.iter().filter(|n| n.is_resolved()).collect();
    eligible.sort_by(|a, b| a.node.cmp(&b.node));
    eligible.dedup_by(|a, b| a.node == b.node);

    let mut targets = BTreeSet::new();
    let mut outcomes = Vec::with_capacity(clauses.len());

    for (index, clause) in clauses.iter().enumerate() {
        let matcher = match &clause.matcher {
            Ok(matcher) => matcher,
            Err(e) => {
                debug!(clause = index, error = %e, "Skipping malformed clause");
                outcomes.push(ClauseOutcome {
                    index,
                    matched: 0,
                    selected: Vec::new(),
                    error: Some(e.clone()),
                });
                continue;
            }
        };

        let (hits, misses): (Vec<&NodeGeoInfo>, Vec<&NodeGeoInfo>) =
            eligible.iter().partition(|n| matcher.matches(n));
        let matched = hits.len();

        let candidates = match clause.operator {
            Operator::In => hits,
            Operator::NotIn => misses,
            // Compiled to an error above.
            Operator::Unsupported => Vec::new(),
        };

        let selected: Vec<String> = candidates
            .into_iter()
            .take(clause.limit.unwrap_or(usize::MAX))
            .map(|n| n.node.clone())
            .collect();

        targets.extend(selected.iter().cloned());
        outcomes.push(ClauseOutcome {
            index,
            matched,
            selected,
            error: None,
        });
    }

    Selection {
        targets: TargetNodeSet(targets.into_iter().collect()),
        clauses: outcomes,
        eligible: eligible.len(),
    }
}
