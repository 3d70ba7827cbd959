//! Node geolocation resolution with external-first address fallback.

use std::net::IpAddr;

use chrono::Utc;
use edgeplane_geo::{Coordinate, NodeGeoInfo, ResolutionSource};
use thiserror::Error;
use tracing::{debug, warn};

use crate::geolookup::{GeoLookup, GeoRecord, LookupError};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ResolutionFailure {
    /// No address was available or every lookup answered "not found".
    #[error("node {0} has no resolvable address")]
    Unresolvable(String),

    /// At least one lookup failed in a way a later attempt may not.
    #[error("geolocation of node {node} unavailable: {reason}")]
    Transient { node: String, reason: String },
}

/// Resolve `node` from its addresses.
///
/// The external address is tried first and the internal one only if that
/// fails or is absent. Each address is looked up at most once per call.
pub async fn resolve(
    lookup: &dyn GeoLookup,
    node: &str,
    internal_ip: Option<IpAddr>,
    external_ip: Option<IpAddr>,
) -> Result<NodeGeoInfo, ResolutionFailure> {
    let candidates = [
        (external_ip, ResolutionSource::ExternalIp),
        (internal_ip, ResolutionSource::InternalIp),
    ];

    let mut transient = None;
    for (ip, source) in candidates {
        let Some(ip) = ip else { continue };
        match lookup.lookup(ip).await {
            Ok(record) => {
                debug!(node = %node, ip = %ip, source = source.as_str(), "Resolved node location");
                return Ok(to_geo_info(node, internal_ip, external_ip, source, record));
            }
            Err(LookupError::NotFound(_)) => {
                debug!(node = %node, ip = %ip, "No geolocation for address");
            }
            Err(LookupError::Transient(reason)) => {
                warn!(node = %node, ip = %ip, error = %reason, "Geolocation lookup failed");
                transient = Some(reason);
            }
        }
    }

    match transient {
        Some(reason) => Err(ResolutionFailure::Transient {
            node: node.to_string(),
            reason,
        }),
        None => Err(ResolutionFailure::Unresolvable(node.to_string())),
    }
}

fn to_geo_info(
    node: &str,
    internal_ip: Option<IpAddr>,
    external_ip: Option<IpAddr>,
    source: ResolutionSource,
    record: GeoRecord,
) -> NodeGeoInfo {
    let coordinate = match (record.longitude, record.latitude) {
        (Some(lon), Some(lat)) => Some(Coordinate::new(lon, lat)).filter(Coordinate::is_valid),
        _ => None,
    };

    NodeGeoInfo {
        node: node.to_string(),
        internal_ip,
        external_ip,
        city: record.city,
        state: record.state,
        country: record.country,
        continent: record.continent,
        coordinate,
        source: Some(source),
        resolved_at: Some(Utc::now()),
    }
}
