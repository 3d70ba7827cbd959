//! Labels nodes with their geolocation.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use edgeplane_geo::{labels, NodeGeoInfo};
use edgeplane_reconcile::{ChangeSet, Handler, HandlerError};
use k8s_openapi::api::core::v1::{Node, NodeAddress};
use kube::ResourceExt;
use tracing::{debug, info, instrument};

use super::handler_error;
use crate::cluster::{ApiError, NodeApi};
use crate::geolookup::GeoLookup;
use crate::resolver::{resolve, ResolutionFailure};

/// What changed on a node between two cached versions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeChanges {
    /// The reported address list changed.
    pub addresses: bool,
    /// A label owned by the labeler changed.
    pub geo_labels: bool,
    /// The node still carries no geo labels, e.g. after a lookup outage.
    pub unlabeled: bool,
}

impl ChangeSet for NodeChanges {
    fn merge(&mut self, other: Self) {
        self.addresses |= other.addresses;
        self.geo_labels |= other.geo_labels;
        self.unlabeled |= other.unlabeled;
    }

    fn is_empty(&self) -> bool {
        !(self.addresses || self.geo_labels || self.unlabeled)
    }
}

/// First internal and first external address reported by the node.
pub fn node_addresses(node: &Node) -> (Option<IpAddr>, Option<IpAddr>) {
    let addresses = address_list(node);
    let first = |kind: &str| {
        addresses
            .iter()
            .filter(|a| a.type_ == kind)
            .find_map(|a| a.address.parse::<IpAddr>().ok())
    };
    (first("InternalIP"), first("ExternalIP"))
}

fn address_list(node: &Node) -> &[NodeAddress] {
    node.status
        .as_ref()
        .and_then(|s| s.addresses.as_deref())
        .unwrap_or_default()
}

pub struct NodeLabeler {
    lookup: Arc<dyn GeoLookup>,
    nodes: Arc<dyn NodeApi>,
}

impl NodeLabeler {
    pub fn new(lookup: Arc<dyn GeoLookup>, nodes: Arc<dyn NodeApi>) -> Self {
        Self { lookup, nodes }
    }

    #[instrument(skip_all, fields(node = %node.name_any()))]
    async fn label(&self, node: &Node) -> Result<(), HandlerError> {
        let name = node.name_any();
        let (internal_ip, external_ip) = node_addresses(node);

        let info = match resolve(self.lookup.as_ref(), &name, internal_ip, external_ip).await {
            Ok(info) => info,
            Err(ResolutionFailure::Unresolvable(_)) => {
                info!("No geolocation for node, marking it unresolved");
                NodeGeoInfo::unresolved(&name)
            }
            Err(e @ ResolutionFailure::Transient { .. }) => return Err(HandlerError::transient(e)),
        };

        match self.nodes.patch_labels(&name, &labels::label_patch(&info)).await {
            Ok(()) => {
                info!(
                    city = ?info.city,
                    country = ?info.country,
                    source = info
                        .source
                        .map(|s| s.as_str())
                        .unwrap_or(labels::SOURCE_NONE),
                    "Labeled node"
                );
                Ok(())
            }
            Err(ApiError::NotFound(_)) => {
                debug!("Node disappeared before labeling");
                Ok(())
            }
            Err(e) => Err(handler_error(e)),
        }
    }
}

#[async_trait]
impl Handler for NodeLabeler {
    type Object = Node;
    type Changes = NodeChanges;

    fn changes(&self, old: &Node, new: &Node) -> NodeChanges {
        NodeChanges {
            addresses: address_list(old) != address_list(new),
            geo_labels: labels::geo_labels_differ(old.labels(), new.labels()),
            unlabeled: !labels::is_labeled(new.labels()),
        }
    }

    async fn on_create(&self, node: Arc<Node>) -> Result<(), HandlerError> {
        if labels::is_labeled(node.labels()) {
            debug!(node = %node.name_any(), "Node already labeled");
            return Ok(());
        }
        self.label(&node).await
    }

    async fn on_update(&self, node: Arc<Node>, changes: NodeChanges) -> Result<(), HandlerError> {
        // Our own label writes come back as geo-label-only updates.
        if !changes.addresses && !changes.unlabeled {
            return Ok(());
        }
        self.label(&node).await
    }

    async fn on_delete(&self, _node: Arc<Node>) -> Result<(), HandlerError> {
        Ok(())
    }
}
