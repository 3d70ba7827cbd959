//! Node label codec for geolocation records.
//!
//! The node labeler persists a [`NodeGeoInfo`] as labels on the Node object and
//! the selection engine reads it back from there. Coordinates carry a
//! hemisphere prefix (`e`/`w`, `n`/`s`) because label values must start with
//! an alphanumeric character.

use std::collections::BTreeMap;

use chrono::DateTime;

use crate::types::{Coordinate, NodeGeoInfo, ResolutionSource};

pub const CITY_LABEL: &str = "edgeplane.io/city";
pub const STATE_LABEL: &str = "edgeplane.io/state";
pub const COUNTRY_LABEL: &str = "edgeplane.io/country";
pub const CONTINENT_LABEL: &str = "edgeplane.io/continent";
pub const LONGITUDE_LABEL: &str = "edgeplane.io/lon";
pub const LATITUDE_LABEL: &str = "edgeplane.io/lat";
pub const SOURCE_LABEL: &str = "edgeplane.io/geo-source";
pub const RESOLVED_AT_LABEL: &str = "edgeplane.io/geo-resolved-at";

/// `geo-source` value recorded when no address could be resolved.
pub const SOURCE_NONE: &str = "none";

/// Every label owned by the node labeler.
pub const GEO_LABELS: [&str; 8] = [
    CITY_LABEL,
    STATE_LABEL,
    COUNTRY_LABEL,
    CONTINENT_LABEL,
    LONGITUDE_LABEL,
    LATITUDE_LABEL,
    SOURCE_LABEL,
    RESOLVED_AT_LABEL,
];

const MAX_LABEL_VALUE_LEN: usize = 63;

/// Coerce arbitrary text into Kubernetes label-value syntax.
pub fn sanitize_label_value(value: &str) -> String {
    let mapped: String = value
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let trimmed = mapped.trim_matches(|c: char| !c.is_ascii_alphanumeric());
    let truncated: String = trimmed.chars().take(MAX_LABEL_VALUE_LEN).collect();
    truncated
        .trim_end_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

pub fn format_longitude(longitude: f64) -> String {
    let hemisphere = if longitude < 0.0 { 'w' } else { 'e' };
    format!("{hemisphere}{:.6}", longitude.abs())
}

pub fn format_latitude(latitude: f64) -> String {
    let hemisphere = if latitude < 0.0 { 's' } else { 'n' };
    format!("{hemisphere}{:.6}", latitude.abs())
}

fn parse_signed(value: &str, positive: char, negative: char) -> Option<f64> {
    let mut chars = value.chars();
    let sign = match chars.next()? {
        c if c == positive => 1.0,
        c if c == negative => -1.0,
        _ => return None,
    };
    let magnitude: f64 = chars.as_str().parse().ok()?;
    magnitude.is_finite().then_some(sign * magnitude)
}

pub fn parse_longitude(value: &str) -> Option<f64> {
    parse_signed(value, 'e', 'w')
}

pub fn parse_latitude(value: &str) -> Option<f64> {
    parse_signed(value, 'n', 's')
}

/// Label patch for `info`: `Some` sets a label, `None` removes it.
///
/// Every geo label appears in the patch so stale values from an earlier
/// resolution are cleared.
pub fn label_patch(info: &NodeGeoInfo) -> BTreeMap<String, Option<String>> {
    let named = |v: &Option<String>| {
        v.as_deref()
            .map(sanitize_label_value)
            .filter(|s| !s.is_empty())
    };

    let mut patch = BTreeMap::new();
    patch.insert(CITY_LABEL.to_string(), named(&info.city));
    patch.insert(STATE_LABEL.to_string(), named(&info.state));
    patch.insert(COUNTRY_LABEL.to_string(), named(&info.country));
    patch.insert(CONTINENT_LABEL.to_string(), named(&info.continent));
    patch.insert(
        LONGITUDE_LABEL.to_string(),
        info.coordinate.map(|c| format_longitude(c.longitude)),
    );
    patch.insert(
        LATITUDE_LABEL.to_string(),
        info.coordinate.map(|c| format_latitude(c.latitude)),
    );
    patch.insert(
        SOURCE_LABEL.to_string(),
        Some(
            info.source
                .map(|s| s.as_str().to_string())
                .unwrap_or_else(|| SOURCE_NONE.to_string()),
        ),
    );
    patch.insert(
        RESOLVED_AT_LABEL.to_string(),
        info.resolved_at.map(|t| t.timestamp().to_string()),
    );
    patch
}

/// True once the labeler has processed the node, successfully or not.
pub fn is_labeled(labels: &BTreeMap<String, String>) -> bool {
    labels.contains_key(SOURCE_LABEL)
}

/// True when any label owned by the labeler differs between two label sets.
pub fn geo_labels_differ(a: &BTreeMap<String, String>, b: &BTreeMap<String, String>) -> bool {
    GEO_LABELS.iter().any(|key| a.get(*key) != b.get(*key))
}

/// Rebuild a geolocation record from node labels. Addresses are not stored in
/// labels and are left empty.
pub fn decode(node: &str, labels: &BTreeMap<String, String>) -> NodeGeoInfo {
    let source = match labels.get(SOURCE_LABEL).map(String::as_str) {
        Some("external-ip") => Some(ResolutionSource::ExternalIp),
        Some("internal-ip") => Some(ResolutionSource::InternalIp),
        _ => None,
    };

    let text = |key: &str| labels.get(key).filter(|v| !v.is_empty()).cloned();

    let coordinate = match (
        labels.get(LONGITUDE_LABEL).and_then(|v| parse_longitude(v)),
        labels.get(LATITUDE_LABEL).and_then(|v| parse_latitude(v)),
    ) {
        (Some(lon), Some(lat)) => Some(Coordinate::new(lon, lat)).filter(Coordinate::is_valid),
        _ => None,
    };

    let resolved_at = labels
        .get(RESOLVED_AT_LABEL)
        .and_then(|v| v.parse::<i64>().ok())
        .and_then(|secs| DateTime::from_timestamp(secs, 0));

    NodeGeoInfo {
        node: node.to_string(),
        internal_ip: None,
        external_ip: None,
        city: text(CITY_LABEL),
        state: text(STATE_LABEL),
        country: text(COUNTRY_LABEL),
        continent: text(CONTINENT_LABEL),
        coordinate,
        source,
        resolved_at,
    }
}
