//! [`kube`] implementations of the API seams and watch streams.

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use edgeplane_reconcile::WatchEvent;
use futures_util::{Stream, StreamExt};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Node, PodTemplateSpec};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::cluster::{
    ApiError, NodeApi, SelectiveDeploymentApi, WorkloadApi, WorkloadPlacement, WorkloadRef,
};
use crate::crd::{ControllerKind, SelectiveDeployment, SelectiveDeploymentStatus};
use crate::pinning::OWNER_ANNOTATION;

/// Cluster access over a live API server.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn workloads<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl NodeApi for KubeCluster {
    async fn patch_labels(
        &self,
        node: &str,
        labels: &BTreeMap<String, Option<String>>,
    ) -> Result<(), ApiError> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = json!({ "metadata": { "labels": labels } });
        api.patch(node, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        debug!(node = %node, labels = labels.len(), "Patched node labels");
        Ok(())
    }
}

#[async_trait]
impl WorkloadApi for KubeCluster {
    async fn get(&self, workload: &WorkloadRef) -> Result<Option<WorkloadPlacement>, ApiError> {
        let ns = workload.namespace.as_str();
        match workload.kind {
            ControllerKind::Deployment => {
                read_placement(self.workloads::<Deployment>(ns), &workload.name).await
            }
            ControllerKind::DaemonSet => {
                read_placement(self.workloads::<DaemonSet>(ns), &workload.name).await
            }
            ControllerKind::StatefulSet => {
                read_placement(self.workloads::<StatefulSet>(ns), &workload.name).await
            }
        }
    }

    async fn update(
        &self,
        workload: &WorkloadRef,
        placement: &WorkloadPlacement,
    ) -> Result<(), ApiError> {
        let ns = workload.namespace.as_str();
        match workload.kind {
            ControllerKind::Deployment => {
                write_placement(self.workloads::<Deployment>(ns), &workload.name, placement).await
            }
            ControllerKind::DaemonSet => {
                write_placement(self.workloads::<DaemonSet>(ns), &workload.name, placement).await
            }
            ControllerKind::StatefulSet => {
                write_placement(self.workloads::<StatefulSet>(ns), &workload.name, placement).await
            }
        }
    }
}

#[async_trait]
impl SelectiveDeploymentApi for KubeCluster {
    async fn update_status(
        &self,
        namespace: &str,
        name: &str,
        status: &SelectiveDeploymentStatus,
    ) -> Result<(), ApiError> {
        let api: Api<SelectiveDeployment> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "status": status });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Workload kinds whose pods come from a single pod template.
trait PodTemplated:
    Resource<Scope = NamespaceResourceScope, DynamicType = ()>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    fn template(&self) -> Option<&PodTemplateSpec>;
    fn template_mut(&mut self) -> Option<&mut PodTemplateSpec>;
}

impl PodTemplated for Deployment {
    fn template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|s| &s.template)
    }

    fn template_mut(&mut self) -> Option<&mut PodTemplateSpec> {
        self.spec.as_mut().map(|s| &mut s.template)
    }
}

impl PodTemplated for DaemonSet {
    fn template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|s| &s.template)
    }

    fn template_mut(&mut self) -> Option<&mut PodTemplateSpec> {
        self.spec.as_mut().map(|s| &mut s.template)
    }
}

impl PodTemplated for StatefulSet {
    fn template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|s| &s.template)
    }

    fn template_mut(&mut self) -> Option<&mut PodTemplateSpec> {
        self.spec.as_mut().map(|s| &mut s.template)
    }
}

fn placement_of<K: PodTemplated>(obj: &K) -> WorkloadPlacement {
    WorkloadPlacement {
        resource_version: obj.resource_version(),
        owner: obj.annotations().get(OWNER_ANNOTATION).cloned(),
        affinity: obj
            .template()
            .and_then(|t| t.spec.as_ref())
            .and_then(|s| s.affinity.clone()),
    }
}

async fn read_placement<K: PodTemplated>(
    api: Api<K>,
    name: &str,
) -> Result<Option<WorkloadPlacement>, ApiError> {
    Ok(api.get_opt(name).await?.as_ref().map(placement_of))
}

async fn write_placement<K: PodTemplated>(
    api: Api<K>,
    name: &str,
    placement: &WorkloadPlacement,
) -> Result<(), ApiError> {
    let mut obj = api
        .get_opt(name)
        .await?
        .ok_or_else(|| ApiError::NotFound(name.to_string()))?;

    if placement.resource_version.is_some() && obj.resource_version() != placement.resource_version
    {
        return Err(ApiError::Conflict(format!(
            "{name} changed since it was read"
        )));
    }

    match &placement.owner {
        Some(owner) => {
            obj.annotations_mut()
                .insert(OWNER_ANNOTATION.to_string(), owner.clone());
        }
        None => {
            obj.annotations_mut().remove(OWNER_ANNOTATION);
        }
    }

    let template = obj
        .template_mut()
        .ok_or_else(|| ApiError::Invalid(format!("{name} has no pod template")))?;
    template.spec.get_or_insert_with(Default::default).affinity = placement.affinity.clone();

    // The object still carries the resourceVersion read above, so a write
    // racing with ours is rejected with 409.
    api.replace(name, &PostParams::default(), &obj).await?;
    Ok(())
}

/// Watch `api` and translate the watcher protocol into [`WatchEvent`]s.
///
/// Watch errors are logged and the watcher backs off and relists on its own.
pub fn watch_stream<K>(api: Api<K>) -> impl Stream<Item = WatchEvent<K>> + Send + 'static
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    watcher(api, watcher::Config::default())
        .default_backoff()
        .filter_map(|event| async move {
            match event {
                Ok(watcher::Event::Apply(obj)) | Ok(watcher::Event::InitApply(obj)) => {
                    Some(WatchEvent::Applied(obj))
                }
                Ok(watcher::Event::Delete(obj)) => Some(WatchEvent::Deleted(obj)),
                Ok(watcher::Event::Init) => Some(WatchEvent::Restarted),
                Ok(watcher::Event::InitDone) => Some(WatchEvent::Synced),
                Err(err) => {
                    warn!(error = %err, "Watch stream error");
                    None
                }
            }
        })
}
