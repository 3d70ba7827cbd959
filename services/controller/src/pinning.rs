//! Workload pinning.
//!
//! A pinned workload carries a required node affinity restricting its pods to
//! the target nodes by name, plus an ownership annotation naming the
//! SelectiveDeployment that wrote it. Writes only happen when the stored
//! affinity diverges from the desired one.

use edgeplane_geo::TargetNodeSet;
use k8s_openapi::api::core::v1::{
    Affinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cluster::{ApiError, WorkloadApi, WorkloadPlacement, WorkloadRef};
use crate::crd::{ControllerState, ControllerStatus, TargetController};

/// Names the SelectiveDeployment that owns a workload's placement.
pub const OWNER_ANNOTATION: &str = "edgeplane.io/selective-deployment";

/// Node field matched by the pin; target sets hold node object names.
pub const NODE_NAME_FIELD: &str = "metadata.name";

/// Well-known node label, only used to express an empty pin.
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PinningError {
    #[error("{0} does not exist")]
    Missing(WorkloadRef),

    #[error("{workload} is pinned by SelectiveDeployment {owner}")]
    Conflict { workload: WorkloadRef, owner: String },

    #[error("updating {workload} failed: {source}")]
    Api {
        workload: WorkloadRef,
        #[source]
        source: ApiError,
    },
}

impl PinningError {
    fn api(workload: &WorkloadRef, source: ApiError) -> Self {
        match source {
            ApiError::NotFound(_) => Self::Missing(workload.clone()),
            source => Self::Api {
                workload: workload.clone(),
                source,
            },
        }
    }

    pub fn state(&self) -> ControllerState {
        match self {
            Self::Missing(_) => ControllerState::Missing,
            Self::Conflict { .. } => ControllerState::Conflict,
            Self::Api { .. } => ControllerState::Failed,
        }
    }

    /// True when a later pass may succeed without any spec change.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Api { source, .. } if source.is_retryable())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinningOutcome {
    /// At least one workload was written and none failed.
    Applied,
    /// Every workload already carried the desired affinity.
    NoopAlreadyCurrent,
    /// At least one workload could not be pinned.
    PartialFailure,
}

/// Per-controller result of one pinning pass, in spec order.
#[derive(Debug, Default)]
pub struct PinningReport {
    pub results: Vec<(TargetController, Result<ControllerState, PinningError>)>,
}

impl PinningReport {
    pub fn outcome(&self) -> PinningOutcome {
        let mut applied = false;
        for (_, result) in &self.results {
            match result {
                Err(_) => return PinningOutcome::PartialFailure,
                Ok(ControllerState::Applied) => applied = true,
                Ok(_) => {}
            }
        }
        if applied {
            PinningOutcome::Applied
        } else {
            PinningOutcome::NoopAlreadyCurrent
        }
    }

    /// Controllers that may carry this owner's restriction after the pass:
    /// everything except those claimed by another SelectiveDeployment.
    pub fn claimed(&self) -> impl Iterator<Item = &TargetController> {
        self.results
            .iter()
            .filter(|(_, result)| !matches!(result, Err(PinningError::Conflict { .. })))
            .map(|(controller, _)| controller)
    }

    pub fn errors(&self) -> impl Iterator<Item = &PinningError> {
        self.results.iter().filter_map(|(_, r)| r.as_ref().err())
    }

    pub fn statuses(&self) -> Vec<ControllerStatus> {
        self.results
            .iter()
            .map(|(controller, result)| {
                let (state, message) = match result {
                    Ok(state) => (*state, None),
                    Err(e) => (e.state(), Some(e.to_string())),
                };
                ControllerStatus {
                    kind: controller.kind,
                    name: controller.name.clone(),
                    state,
                    message,
                }
            })
            .collect()
    }
}

/// Required node-affinity terms for `targets`.
///
/// Terms are ORed and a field requirement takes exactly one value, so each
/// target gets its own `metadata.name` term. An empty target set yields a
/// single `DoesNotExist` term on the hostname label, which no registered node
/// satisfies; the API server rejects an empty term list.
pub fn node_selector(targets: &TargetNodeSet) -> NodeSelector {
    if targets.is_empty() {
        return NodeSelector {
            node_selector_terms: vec![NodeSelectorTerm {
                match_expressions: Some(vec![NodeSelectorRequirement {
                    key: HOSTNAME_LABEL.to_string(),
                    operator: "DoesNotExist".to_string(),
                    values: None,
                }]),
                match_fields: None,
            }],
        };
    }

    NodeSelector {
        node_selector_terms: targets
            .iter()
            .map(|node| NodeSelectorTerm {
                match_expressions: None,
                match_fields: Some(vec![NodeSelectorRequirement {
                    key: NODE_NAME_FIELD.to_string(),
                    operator: "In".to_string(),
                    values: Some(vec![node.to_string()]),
                }]),
            })
            .collect(),
    }
}

/// `current` with its required node affinity replaced by the pin for `targets`.
pub fn desired_affinity(current: Option<&Affinity>, targets: &TargetNodeSet) -> Affinity {
    let mut affinity = current.cloned().unwrap_or_default();
    affinity
        .node_affinity
        .get_or_insert_with(Default::default)
        .required_during_scheduling_ignored_during_execution = Some(node_selector(targets));
    affinity
}

/// `current` without a required node affinity, `None` if nothing else is left.
pub fn released_affinity(current: Option<&Affinity>) -> Option<Affinity> {
    let mut affinity = current?.clone();
    if let Some(node) = affinity.node_affinity.as_mut() {
        node.required_during_scheduling_ignored_during_execution = None;
    }
    if affinity
        .node_affinity
        .as_ref()
        .is_some_and(|node| *node == Default::default())
    {
        affinity.node_affinity = None;
    }
    (affinity != Affinity::default()).then_some(affinity)
}

/// Pin every controller in `controllers` to `targets` on behalf of `owner`.
///
/// A workload claimed by another SelectiveDeployment is left alone while
/// `is_live_owner` reports that owner as existing; a stale claim is taken over.
pub async fn apply(
    api: &dyn WorkloadApi,
    namespace: &str,
    owner: &str,
    controllers: &[TargetController],
    targets: &TargetNodeSet,
    is_live_owner: &(dyn Fn(&str) -> bool + Send + Sync),
) -> PinningReport {
    let mut report = PinningReport::default();
    for controller in controllers {
        let workload = WorkloadRef::new(namespace, controller.kind, &controller.name);
        let result = pin(api, &workload, owner, targets, is_live_owner).await;
        if let Err(e) = &result {
            warn!(workload = %workload, error = %e, "Failed to pin workload");
        }
        report.results.push((controller.clone(), result));
    }
    report
}

async fn pin(
    api: &dyn WorkloadApi,
    workload: &WorkloadRef,
    owner: &str,
    targets: &TargetNodeSet,
    is_live_owner: &(dyn Fn(&str) -> bool + Send + Sync),
) -> Result<ControllerState, PinningError> {
    let current = api
        .get(workload)
        .await
        .map_err(|e| PinningError::api(workload, e))?
        .ok_or_else(|| PinningError::Missing(workload.clone()))?;

    if let Some(other) = current.owner.as_deref().filter(|o| *o != owner) {
        if is_live_owner(other) {
            return Err(PinningError::Conflict {
                workload: workload.clone(),
                owner: other.to_string(),
            });
        }
        info!(workload = %workload, previous = %other, "Taking over workload from a deleted owner");
    }

    let affinity = desired_affinity(current.affinity.as_ref(), targets);
    if current.owner.as_deref() == Some(owner) && current.affinity.as_ref() == Some(&affinity) {
        debug!(workload = %workload, "Placement already current");
        return Ok(ControllerState::Current);
    }

    let placement = WorkloadPlacement {
        resource_version: current.resource_version,
        owner: Some(owner.to_string()),
        affinity: Some(affinity),
    };
    api.update(workload, &placement)
        .await
        .map_err(|e| PinningError::api(workload, e))?;

    info!(workload = %workload, nodes = targets.len(), "Pinned workload");
    Ok(ControllerState::Applied)
}

/// Remove the restriction `owner` placed on `workload`.
///
/// Returns false when there was nothing to release: the workload is gone or
/// is not owned by `owner`. The workload itself is never deleted.
pub async fn release(
    api: &dyn WorkloadApi,
    workload: &WorkloadRef,
    owner: &str,
) -> Result<bool, PinningError> {
    let Some(current) = api
        .get(workload)
        .await
        .map_err(|e| PinningError::api(workload, e))?
    else {
        return Ok(false);
    };

    if current.owner.as_deref() != Some(owner) {
        debug!(
            workload = %workload,
            owner = ?current.owner,
            "Workload not owned, leaving it alone"
        );
        return Ok(false);
    }

    let placement = WorkloadPlacement {
        resource_version: current.resource_version,
        owner: None,
        affinity: released_affinity(current.affinity.as_ref()),
    };
    match api.update(workload, &placement).await {
        Ok(()) => {
            info!(workload = %workload, "Released workload");
            Ok(true)
        }
        Err(ApiError::NotFound(_)) => Ok(false),
        Err(e) => Err(PinningError::api(workload, e)),
    }
}
