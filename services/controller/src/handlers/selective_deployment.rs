//! Reconciles SelectiveDeployments into pinned workloads.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use edgeplane_geo::{
    labels, select_compiled, ClauseError, CompiledClause, NodeGeoInfo, RegionType, Selection,
};
use edgeplane_reconcile::{
    ChangeSet, Handler, HandlerError, ObjectKey, Operation, OwnershipGraph, QueueHandle, Reader,
    ReconcileEvent, SpecHash,
};
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use super::handler_error;
use super::node_labeler::NodeChanges;
use crate::cluster::{ApiError, SelectiveDeploymentApi, WorkloadApi, WorkloadRef};
use crate::crd::{PlacementState, SelectiveDeployment, SelectiveDeploymentStatus};
use crate::notify::{NotificationKind, Notifier, Recipient, CONTACT_ANNOTATION};
use crate::pinning::{self, PinningError, PinningReport};

/// What changed on a SelectiveDeployment, or around it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SdChanges {
    pub controllers: bool,
    pub selector: bool,
    pub region_type: bool,
    /// Node inventory changed; set by external triggers only.
    pub inventory: bool,
    /// Another owner of a listed workload went away; set by external triggers only.
    pub claim_released: bool,
}

impl SdChanges {
    pub fn inventory() -> Self {
        Self {
            inventory: true,
            ..Default::default()
        }
    }

    pub fn claim_released() -> Self {
        Self {
            claim_released: true,
            ..Default::default()
        }
    }
}

impl ChangeSet for SdChanges {
    fn merge(&mut self, other: Self) {
        self.controllers |= other.controllers;
        self.selector |= other.selector;
        self.region_type |= other.region_type;
        self.inventory |= other.inventory;
        self.claim_released |= other.claim_released;
    }

    fn is_empty(&self) -> bool {
        !(self.controllers
            || self.selector
            || self.region_type
            || self.inventory
            || self.claim_released)
    }
}

/// Vertices of the ownership graph.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Owned {
    Owner(ObjectKey),
    Workload(WorkloadRef),
}

pub struct SelectiveDeploymentHandler {
    nodes: Reader<Node>,
    deployments: Reader<SelectiveDeployment>,
    workloads: Arc<dyn WorkloadApi>,
    status: Arc<dyn SelectiveDeploymentApi>,
    notifier: Arc<dyn Notifier>,
    graph: Mutex<OwnershipGraph<Owned>>,
}

impl SelectiveDeploymentHandler {
    pub fn new(
        nodes: Reader<Node>,
        deployments: Reader<SelectiveDeployment>,
        workloads: Arc<dyn WorkloadApi>,
        status: Arc<dyn SelectiveDeploymentApi>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            nodes,
            deployments,
            workloads,
            status,
            notifier,
            graph: Mutex::new(OwnershipGraph::new()),
        }
    }

    /// Workloads currently recorded as owned by `sd`.
    pub fn owned_workloads(&self, namespace: &str, name: &str) -> Vec<WorkloadRef> {
        let owner = Owned::Owner(ObjectKey::namespaced(namespace, name));
        self.graph
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .dependents_of(&owner)
            .into_iter()
            .filter_map(|dep| match dep {
                Owned::Workload(w) => Some(w),
                Owned::Owner(_) => None,
            })
            .collect()
    }

    fn inventory(&self) -> Vec<NodeGeoInfo> {
        self.nodes
            .list()
            .iter()
            .map(|node| labels::decode(&node.name_any(), node.labels()))
            .collect()
    }

    #[instrument(skip_all, fields(sd = %ObjectKey::from_object(sd)))]
    async fn reconcile(&self, sd: &SelectiveDeployment) -> Result<(), HandlerError> {
        let namespace = sd.namespace().unwrap_or_default();
        let name = sd.name_any();
        let key = ObjectKey::namespaced(&namespace, &name);

        let compiled: Vec<CompiledClause> = sd
            .spec
            .selector
            .iter()
            .map(|clause| CompiledClause::compile(sd.spec.region_type, clause))
            .collect();
        let selection = select_compiled(&self.inventory(), &compiled);
        debug!(
            eligible = selection.eligible,
            targets = selection.targets.len(),
            "Selected target nodes"
        );

        let deployments = self.deployments.clone();
        let live_namespace = namespace.clone();
        let is_live_owner = move |owner: &str| {
            deployments
                .get(&ObjectKey::namespaced(&live_namespace, owner))
                .is_some()
        };
        let report = pinning::apply(
            self.workloads.as_ref(),
            &namespace,
            &name,
            &sd.spec.controllers,
            &selection.targets,
            &is_live_owner,
        )
        .await;

        let claimed: Vec<Owned> = report
            .claimed()
            .map(|c| Owned::Workload(WorkloadRef::new(&namespace, c.kind, &c.name)))
            .collect();
        let orphaned = self
            .graph
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .set_dependents(Owned::Owner(key), claimed);
        let mut release_errors = self.release_all(orphaned, &name).await;

        let status = build_status(
            sd.spec.region_type,
            &selection,
            &report,
            release_errors.len(),
        );
        self.write_status(sd, &namespace, &name, status).await?;

        let mut retryable = report.errors().filter(|e| e.is_retryable()).count();
        release_errors.retain(PinningError::is_retryable);
        retryable += release_errors.len();
        if retryable > 0 {
            return Err(HandlerError::transient(format!(
                "{retryable} workload update(s) failed and will be retried"
            )));
        }
        Ok(())
    }

    /// Release every orphaned workload, returning the failures.
    async fn release_all(&self, orphaned: Vec<Owned>, owner: &str) -> Vec<PinningError> {
        let mut errors = Vec::new();
        for dep in orphaned {
            let Owned::Workload(workload) = dep else {
                continue;
            };
            if let Err(e) = pinning::release(self.workloads.as_ref(), &workload, owner).await {
                warn!(workload = %workload, error = %e, "Failed to release workload");
                errors.push(e);
            }
        }
        errors
    }

    async fn write_status(
        &self,
        sd: &SelectiveDeployment,
        namespace: &str,
        name: &str,
        status: SelectiveDeploymentStatus,
    ) -> Result<(), HandlerError> {
        if sd.status.as_ref() == Some(&status) {
            debug!("Status unchanged");
            return Ok(());
        }

        let previous = sd.status.as_ref().map(|s| s.state).unwrap_or_default();
        match self.status.update_status(namespace, name, &status).await {
            Ok(()) => {}
            Err(ApiError::NotFound(_)) => {
                debug!("SelectiveDeployment deleted before status write");
                return Ok(());
            }
            Err(e) => return Err(handler_error(e)),
        }

        info!(
            state = ?status.state,
            ready = status.ready,
            nodes = status.nodes.len(),
            "Updated status"
        );

        if status.state != previous {
            let kind = match status.state {
                PlacementState::Success => None,
                PlacementState::Partial => Some(NotificationKind::PlacementPartial),
                PlacementState::Failure => Some(NotificationKind::PlacementFailed),
            };
            if let Some(kind) = kind {
                let recipient = Recipient {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                    contact: sd.annotations().get(CONTACT_ANNOTATION).cloned(),
                };
                self.notifier.notify(kind, &recipient);
            }
        }
        Ok(())
    }
}

/// Derive the status of one pass.
fn build_status(
    region: RegionType,
    selection: &Selection,
    report: &PinningReport,
    release_failures: usize,
) -> SelectiveDeploymentStatus {
    let unsupported_region = region == RegionType::Unsupported;
    let mut message: Vec<String> = Vec::new();
    if unsupported_region {
        message.push(ClauseError::UnsupportedRegionType.to_string());
    }
    message.extend(
        selection
            .invalid_clauses()
            .filter_map(|c| c.error.as_ref().map(|e| format!("selector[{}]: {e}", c.index))),
    );
    message.extend(report.errors().map(ToString::to_string));
    if release_failures > 0 {
        message.push(format!("{release_failures} dropped controller(s) could not be released"));
    }
    if selection.targets.is_empty() {
        message.push("no node matches the selector".to_string());
    }

    let controllers = report.statuses();
    let all_clauses_invalid = !selection.clauses.is_empty()
        && selection.invalid_clauses().count() == selection.clauses.len();
    let none_pinned = !controllers.is_empty() && controllers.iter().all(|c| !c.state.is_ok());

    let state = if unsupported_region || all_clauses_invalid || none_pinned {
        PlacementState::Failure
    } else if report.errors().next().is_some()
        || selection.invalid_clauses().next().is_some()
        || release_failures > 0
    {
        PlacementState::Partial
    } else {
        PlacementState::Success
    };

    SelectiveDeploymentStatus {
        ready: state == PlacementState::Success && !selection.targets.is_empty(),
        state,
        message,
        nodes: selection.targets.as_slice().to_vec(),
        controllers,
        placement_hash: SpecHash::from_json(&json!(selection.targets)).to_string(),
    }
}

#[async_trait]
impl Handler for SelectiveDeploymentHandler {
    type Object = SelectiveDeployment;
    type Changes = SdChanges;

    fn changes(&self, old: &SelectiveDeployment, new: &SelectiveDeployment) -> SdChanges {
        SdChanges {
            controllers: old.spec.controllers != new.spec.controllers,
            selector: old.spec.selector != new.spec.selector,
            region_type: old.spec.region_type != new.spec.region_type,
            ..Default::default()
        }
    }

    /// Selection is meaningless against a half-listed node cache.
    async fn init(&self) -> Result<(), HandlerError> {
        if self.nodes.wait_synced().await {
            Ok(())
        } else {
            Err(HandlerError::transient("node cache closed before syncing"))
        }
    }

    async fn on_create(&self, sd: Arc<SelectiveDeployment>) -> Result<(), HandlerError> {
        self.reconcile(&sd).await
    }

    async fn on_update(
        &self,
        sd: Arc<SelectiveDeployment>,
        changes: SdChanges,
    ) -> Result<(), HandlerError> {
        debug!(sd = %ObjectKey::from_object(sd.as_ref()), ?changes, "SelectiveDeployment changed");
        self.reconcile(&sd).await
    }

    #[instrument(skip_all, fields(sd = %ObjectKey::from_object(sd.as_ref())))]
    async fn on_delete(&self, sd: Arc<SelectiveDeployment>) -> Result<(), HandlerError> {
        let namespace = sd.namespace().unwrap_or_default();
        let name = sd.name_any();

        let mut orphaned = self
            .graph
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove_owner(&Owned::Owner(ObjectKey::namespaced(&namespace, &name)));

        // The graph is rebuilt from passes since startup; the last known spec
        // covers workloads pinned before that.
        let known: BTreeSet<Owned> = orphaned.iter().cloned().collect();
        orphaned.extend(
            sd.spec
                .controllers
                .iter()
                .map(|c| Owned::Workload(WorkloadRef::new(&namespace, c.kind, &c.name)))
                .filter(|w| !known.contains(w)),
        );

        let errors = self.release_all(orphaned, &name).await;
        if errors.iter().any(PinningError::is_retryable) {
            return Err(HandlerError::transient(format!(
                "{} workload(s) could not be released",
                errors.len()
            )));
        }
        if !errors.is_empty() {
            error!(failures = errors.len(), "Some workloads could not be released");
        }
        info!("SelectiveDeployment removed");
        Ok(())
    }
}

/// Hook for the node engine: re-run every SelectiveDeployment when the set of
/// nodes or their geolocation changes.
pub fn inventory_trigger(
    deployments: Reader<SelectiveDeployment>,
    queue: QueueHandle<SelectiveDeployment, SdChanges>,
) -> impl Fn(&ReconcileEvent<Node, NodeChanges>) + Send + Sync + 'static {
    move |event| {
        let relevant = match &event.op {
            Operation::Created | Operation::Deleted(_) => true,
            Operation::Updated(changes) => changes.geo_labels,
        };
        if !relevant {
            return;
        }
        for key in deployments.keys() {
            queue.update(key, SdChanges::inventory());
        }
    }
}

/// Hook for the SelectiveDeployment engine: when a SelectiveDeployment goes
/// away, re-run the others in its namespace that list one of its workloads so
/// they can claim it.
pub fn release_trigger(
    deployments: Reader<SelectiveDeployment>,
    queue: QueueHandle<SelectiveDeployment, SdChanges>,
) -> impl Fn(&ReconcileEvent<SelectiveDeployment, SdChanges>) + Send + Sync + 'static {
    move |event| {
        let Operation::Deleted(gone) = &event.op else {
            return;
        };
        let namespace = gone.namespace();
        for other in deployments.list() {
            if other.namespace() != namespace || other.name_any() == gone.name_any() {
                continue;
            }
            let shared = other
                .spec
                .controllers
                .iter()
                .any(|c| gone.spec.controllers.contains(c));
            if shared {
                debug!(
                    sd = %ObjectKey::from_object(other.as_ref()),
                    released_by = %event.key,
                    "Re-running SelectiveDeployment for released workloads"
                );
                queue.update(ObjectKey::from_object(other.as_ref()), SdChanges::claim_released());
            }
        }
    }
}
