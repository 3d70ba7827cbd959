//! In-memory fakes of the cluster seams and object fixtures.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use edgeplane_controller::cluster::{
    ApiError, NodeApi, SelectiveDeploymentApi, WorkloadApi, WorkloadPlacement, WorkloadRef,
};
use edgeplane_controller::crd::{
    SelectiveDeployment, SelectiveDeploymentSpec, SelectiveDeploymentStatus,
};
use edgeplane_controller::notify::{NotificationKind, Notifier, Recipient};
use edgeplane_geo::{labels, Coordinate, NodeGeoInfo, ResolutionSource};
use edgeplane_reconcile::{Reader, Store, WatchEvent};
use edgeplane_controller::pinning::NODE_NAME_FIELD;
use k8s_openapi::api::core::v1::{Affinity, Node};
use kube::api::ObjectMeta;
use kube::Resource;

/// Workloads keyed by reference, with a resourceVersion bumped on every write.
#[derive(Default)]
pub struct FakeWorkloads {
    objects: Mutex<BTreeMap<WorkloadRef, WorkloadPlacement>>,
    failures: Mutex<Vec<ApiError>>,
    writes: Mutex<Vec<WorkloadRef>>,
}

impl FakeWorkloads {
    pub fn insert(&self, workload: WorkloadRef, owner: Option<&str>, affinity: Option<Affinity>) {
        self.objects.lock().unwrap().insert(
            workload,
            WorkloadPlacement {
                resource_version: Some("1".to_string()),
                owner: owner.map(str::to_string),
                affinity,
            },
        );
    }

    pub fn placement(&self, workload: &WorkloadRef) -> Option<WorkloadPlacement> {
        self.objects.lock().unwrap().get(workload).cloned()
    }

    /// Fail the next writes with these errors, in order.
    pub fn fail_writes(&self, errors: impl IntoIterator<Item = ApiError>) {
        self.failures.lock().unwrap().extend(errors);
    }

    /// Simulate a concurrent writer moving the resourceVersion.
    pub fn touch(&self, workload: &WorkloadRef) {
        if let Some(p) = self.objects.lock().unwrap().get_mut(workload) {
            p.resource_version = Some(bump(&p.resource_version));
        }
    }

    pub fn writes(&self) -> Vec<WorkloadRef> {
        self.writes.lock().unwrap().clone()
    }
}

fn bump(version: &Option<String>) -> String {
    let n: u64 = version.as_deref().and_then(|v| v.parse().ok()).unwrap_or(0);
    (n + 1).to_string()
}

#[async_trait]
impl WorkloadApi for FakeWorkloads {
    async fn get(&self, workload: &WorkloadRef) -> Result<Option<WorkloadPlacement>, ApiError> {
        Ok(self.objects.lock().unwrap().get(workload).cloned())
    }

    async fn update(
        &self,
        workload: &WorkloadRef,
        placement: &WorkloadPlacement,
    ) -> Result<(), ApiError> {
        {
            let mut failures = self.failures.lock().unwrap();
            if !failures.is_empty() {
                return Err(failures.remove(0));
            }
        }

        let mut objects = self.objects.lock().unwrap();
        let current = objects
            .get_mut(workload)
            .ok_or_else(|| ApiError::NotFound(workload.to_string()))?;
        if placement.resource_version.is_some()
            && placement.resource_version != current.resource_version
        {
            return Err(ApiError::Conflict(workload.to_string()));
        }

        current.owner = placement.owner.clone();
        current.affinity = placement.affinity.clone();
        current.resource_version = Some(bump(&current.resource_version));
        self.writes.lock().unwrap().push(workload.clone());
        Ok(())
    }
}

/// Records label patches per node.
#[derive(Default)]
pub struct FakeNodes {
    patches: Mutex<Vec<(String, BTreeMap<String, Option<String>>)>>,
}

impl FakeNodes {
    pub fn patches(&self) -> Vec<(String, BTreeMap<String, Option<String>>)> {
        self.patches.lock().unwrap().clone()
    }
}

#[async_trait]
impl NodeApi for FakeNodes {
    async fn patch_labels(
        &self,
        node: &str,
        labels: &BTreeMap<String, Option<String>>,
    ) -> Result<(), ApiError> {
        self.patches
            .lock()
            .unwrap()
            .push((node.to_string(), labels.clone()));
        Ok(())
    }
}

/// Records every status write.
#[derive(Default)]
pub struct FakeStatus {
    writes: Mutex<Vec<(String, String, SelectiveDeploymentStatus)>>,
}

impl FakeStatus {
    pub fn writes(&self) -> Vec<(String, String, SelectiveDeploymentStatus)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn last(&self) -> Option<SelectiveDeploymentStatus> {
        self.writes().pop().map(|(_, _, status)| status)
    }
}

#[async_trait]
impl SelectiveDeploymentApi for FakeStatus {
    async fn update_status(
        &self,
        namespace: &str,
        name: &str,
        status: &SelectiveDeploymentStatus,
    ) -> Result<(), ApiError> {
        self.writes
            .lock()
            .unwrap()
            .push((namespace.to_string(), name.to_string(), status.clone()));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(NotificationKind, Recipient)>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<(NotificationKind, Recipient)> {
        self.sent.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, kind: NotificationKind, recipient: &Recipient) {
        self.sent.lock().unwrap().push((kind, recipient.clone()));
    }
}

/// A node whose labels encode `city` at the given position.
pub fn geo_node(name: &str, city: &str, country: &str, lon: f64, lat: f64) -> Node {
    let info = NodeGeoInfo {
        city: Some(city.to_string()),
        country: Some(country.to_string()),
        coordinate: Some(Coordinate::new(lon, lat)),
        source: Some(ResolutionSource::ExternalIp),
        ..NodeGeoInfo::unresolved(name)
    };
    let labels = labels::label_patch(&info)
        .into_iter()
        .filter_map(|(k, v)| v.map(|v| (k, v)))
        .collect();
    node(name, labels)
}

pub fn node(name: &str, labels: BTreeMap<String, String>) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            resource_version: Some("1".to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn sd(namespace: &str, name: &str, spec: SelectiveDeploymentSpec) -> SelectiveDeployment {
    let mut sd = SelectiveDeployment::new(name, spec);
    sd.meta_mut().namespace = Some(namespace.to_string());
    sd.meta_mut().resource_version = Some("1".to_string());
    sd
}

/// A synced cache holding `objects`.
pub fn synced_store<K: Resource + Clone>(
    objects: impl IntoIterator<Item = K>,
) -> (Store<K>, Reader<K>) {
    let mut store = Store::new();
    for obj in objects {
        store.apply(WatchEvent::Applied(obj));
    }
    store.apply(WatchEvent::Synced);
    let reader = store.reader();
    (store, reader)
}

/// Node names a pinned affinity admits, `None` when there is no pin.
pub fn pinned_nodes(affinity: Option<&Affinity>) -> Option<Vec<String>> {
    let terms = &affinity?
        .node_affinity
        .as_ref()?
        .required_during_scheduling_ignored_during_execution
        .as_ref()?
        .node_selector_terms;
    let hosts = terms
        .iter()
        .filter_map(|term| term.match_fields.as_ref())
        .flatten()
        .filter(|field| field.key == NODE_NAME_FIELD)
        .flat_map(|field| field.values.clone().unwrap_or_default())
        .collect();
    Some(hosts)
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}
