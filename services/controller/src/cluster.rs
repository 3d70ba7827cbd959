//! Orchestrator API seams.
//!
//! Handlers talk to the cluster only through these traits. [`KubeCluster`]
//! implements them against a live API server; tests use in-memory fakes.
//!
//! [`KubeCluster`]: crate::kube_api::KubeCluster

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Affinity;
use thiserror::Error;

use crate::crd::{ControllerKind, SelectiveDeploymentStatus};

/// Errors returned by the API seams.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency check failed.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The server rejected the request as malformed.
    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("transient API failure: {0}")]
    Transient(String),
}

impl ApiError {
    /// True for errors a later attempt may not hit.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::Transient(_))
    }
}

impl From<kube::Error> for ApiError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) => match resp.code {
                404 => Self::NotFound(resp.message),
                409 => Self::Conflict(resp.message),
                400 | 422 => Self::Invalid(resp.message),
                _ => Self::Transient(format!("{} ({})", resp.message, resp.code)),
            },
            other => Self::Transient(other.to_string()),
        }
    }
}

/// A workload controller in a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkloadRef {
    pub namespace: String,
    pub kind: ControllerKind,
    pub name: String,
}

impl WorkloadRef {
    pub fn new(
        namespace: impl Into<String>,
        kind: ControllerKind,
        name: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.kind, self.name)
    }
}

/// The placement-relevant slice of a workload controller.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WorkloadPlacement {
    /// Version the placement was read at; writes are rejected if it moved.
    pub resource_version: Option<String>,

    /// Name of the SelectiveDeployment that pins this workload.
    pub owner: Option<String>,

    /// Affinity of the pod template.
    pub affinity: Option<Affinity>,
}

#[async_trait]
pub trait NodeApi: Send + Sync {
    /// Merge labels into a node. `None` values remove the label.
    async fn patch_labels(
        &self,
        node: &str,
        labels: &BTreeMap<String, Option<String>>,
    ) -> Result<(), ApiError>;
}

#[async_trait]
pub trait WorkloadApi: Send + Sync {
    /// Read a workload's placement, `None` if it does not exist.
    async fn get(&self, workload: &WorkloadRef) -> Result<Option<WorkloadPlacement>, ApiError>;

    /// Write the affinity and owner marker of `placement`.
    ///
    /// Fails with [`ApiError::Conflict`] when the workload changed since
    /// `placement.resource_version`.
    async fn update(
        &self,
        workload: &WorkloadRef,
        placement: &WorkloadPlacement,
    ) -> Result<(), ApiError>;
}

#[async_trait]
pub trait SelectiveDeploymentApi: Send + Sync {
    async fn update_status(
        &self,
        namespace: &str,
        name: &str,
        status: &SelectiveDeploymentStatus,
    ) -> Result<(), ApiError>;
}
