//! Selection scenarios and property tests over a synthetic inventory.

use std::collections::BTreeMap;

use edgeplane_geo::labels::{decode, label_patch};
use edgeplane_geo::{
    select, Coordinate, NodeGeoInfo, Operator, RegionType, ResolutionSource, SelectorClause,
};
use proptest::prelude::*;

const PARIS: &str = "[[2.215,48.895],[2.204,48.808],[2.339,48.784],[2.452,48.842],[2.393,48.917]]";

fn node(name: &str, city: &str, country: &str, lon: f64, lat: f64) -> NodeGeoInfo {
    NodeGeoInfo {
        city: Some(city.to_string()),
        country: Some(country.to_string()),
        coordinate: Some(Coordinate::new(lon, lat)),
        source: Some(ResolutionSource::ExternalIp),
        ..NodeGeoInfo::unresolved(name)
    }
}

/// Nodes as the selection engine sees them: read back from labels.
fn from_labels(info: &NodeGeoInfo) -> NodeGeoInfo {
    let labels: BTreeMap<String, String> = label_patch(info)
        .into_iter()
        .filter_map(|(k, v)| v.map(|v| (k, v)))
        .collect();
    decode(&info.node, &labels)
}

fn inventory() -> Vec<NodeGeoInfo> {
    vec![
        node("edge-par-1", "Paris", "FR", 2.30, 48.86),
        node("edge-par-2", "Paris", "FR", 2.35, 48.85),
        node("edge-lyo-1", "Lyon", "FR", 4.83, 45.76),
        node("edge-sfo-1", "San Francisco", "US", -122.41, 37.77),
        node("edge-nyc-1", "New York", "US", -74.00, 40.71),
        NodeGeoInfo::unresolved("edge-unknown-1"),
    ]
}

#[test]
fn test_paris_polygon_scenario() {
    let nodes: Vec<NodeGeoInfo> = inventory().iter().map(from_labels).collect();
    let selection = select(
        &nodes,
        RegionType::Polygon,
        &[SelectorClause::new(PARIS, Operator::In, 0)],
    );
    assert_eq!(selection.targets.as_slice(), ["edge-par-1", "edge-par-2"]);
}

#[test]
fn test_city_with_space_matches_label_form() {
    let nodes: Vec<NodeGeoInfo> = inventory().iter().map(from_labels).collect();
    let selection = select(
        &nodes,
        RegionType::City,
        &[SelectorClause::new("new york", Operator::In, 0)],
    );
    assert_eq!(selection.targets.as_slice(), ["edge-nyc-1"]);
}

#[test]
fn test_country_not_in_excludes_unresolved() {
    let nodes: Vec<NodeGeoInfo> = inventory().iter().map(from_labels).collect();
    let selection = select(
        &nodes,
        RegionType::Country,
        &[SelectorClause::new("US", Operator::NotIn, 0)],
    );
    assert_eq!(
        selection.targets.as_slice(),
        ["edge-lyo-1", "edge-par-1", "edge-par-2"]
    );
}

#[test]
fn test_mixed_clauses_union() {
    let nodes = inventory();
    let selection = select(
        &nodes,
        RegionType::Country,
        &[
            SelectorClause::new("FR", Operator::In, 1),
            SelectorClause::new("US", Operator::In, 1),
        ],
    );
    assert_eq!(selection.targets.as_slice(), ["edge-lyo-1", "edge-nyc-1"]);
}

#[test]
fn test_empty_selector_selects_nothing() {
    let selection = select(&inventory(), RegionType::City, &[]);
    assert!(selection.targets.is_empty());
    assert!(selection.clauses.is_empty());
}

fn arb_node() -> impl Strategy<Value = NodeGeoInfo> {
    (
        "[a-z]{1,3}-[0-9]{1,2}",
        prop::sample::select(vec!["Paris", "Lyon", "Berlin", "Oslo"]),
        -10.0f64..30.0,
        35.0f64..60.0,
        any::<bool>(),
    )
        .prop_map(|(name, city, lon, lat, resolved)| {
            let mut info = node(&name, city, "EU", lon, lat);
            if !resolved {
                info.source = None;
            }
            info
        })
}

fn arb_clause() -> impl Strategy<Value = SelectorClause> {
    (
        prop::sample::select(vec!["Paris", "lyon", "BERLIN", "Madrid"]),
        prop::sample::select(vec![Operator::In, Operator::NotIn]),
        0u32..4,
    )
        .prop_map(|(value, operator, count)| SelectorClause::new(value, operator, count))
}

/// Inventories with unique node names.
fn arb_inventory() -> impl Strategy<Value = Vec<NodeGeoInfo>> {
    prop::collection::vec(arb_node(), 0..24).prop_map(|mut nodes| {
        nodes.sort_by(|a, b| a.node.cmp(&b.node));
        nodes.dedup_by(|a, b| a.node == b.node);
        nodes
    })
}

proptest! {
    #[test]
    fn prop_selection_ignores_input_order(
        nodes in arb_inventory(),
        clauses in prop::collection::vec(arb_clause(), 0..4),
        seed in any::<u64>(),
    ) {
        let forward = select(&nodes, RegionType::City, &clauses);

        let mut shuffled = nodes.clone();
        let len = shuffled.len();
        if len > 1 {
            shuffled.rotate_left((seed as usize) % len);
            shuffled.reverse();
        }
        let again = select(&shuffled, RegionType::City, &clauses);

        prop_assert_eq!(forward.targets, again.targets);
    }

    #[test]
    fn prop_selection_is_sorted_resolved_and_capped(
        nodes in arb_inventory(),
        clauses in prop::collection::vec(arb_clause(), 1..4),
    ) {
        let selection = select(&nodes, RegionType::City, &clauses);

        let targets = selection.targets.as_slice();
        prop_assert!(targets.windows(2).all(|w| w[0] < w[1]));

        for name in targets {
            let info = nodes.iter().find(|n| &n.node == name);
            prop_assert!(info.is_some_and(NodeGeoInfo::is_resolved));
        }

        for (clause, outcome) in clauses.iter().zip(&selection.clauses) {
            if let Some(limit) = clause.limit() {
                prop_assert!(outcome.selected.len() <= limit);
            }
        }

        let bound: usize = selection.clauses.iter().map(|c| c.selected.len()).sum();
        prop_assert!(targets.len() <= bound);
    }
}
