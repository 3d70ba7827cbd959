//! The SelectiveDeployment custom resource.

use std::fmt;

use edgeplane_geo::{RegionType, SelectorClause};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Pins a set of workload controllers to the nodes inside a geographic region.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "apps.edgeplane.io",
    version = "v1alpha",
    kind = "SelectiveDeployment",
    namespaced,
    shortname = "sd",
    status = "SelectiveDeploymentStatus",
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SelectiveDeploymentSpec {
    /// Workload controllers kept on the selected nodes.
    #[serde(default)]
    pub controllers: Vec<TargetController>,

    /// Region granularity shared by every selector clause.
    #[serde(rename = "type")]
    pub region_type: RegionType,

    #[serde(default)]
    pub selector: Vec<SelectorClause>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
pub enum ControllerKind {
    Deployment,
    DaemonSet,
    StatefulSet,
}

impl ControllerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deployment => "Deployment",
            Self::DaemonSet => "DaemonSet",
            Self::StatefulSet => "StatefulSet",
        }
    }
}

impl fmt::Display for ControllerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to a workload controller in the SelectiveDeployment's namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
pub struct TargetController {
    pub kind: ControllerKind,
    pub name: String,
}

impl TargetController {
    pub fn new(kind: ControllerKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub enum PlacementState {
    #[default]
    Success,
    Partial,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ControllerState {
    /// Affinity was written during the last pass.
    Applied,
    /// Affinity already matched.
    Current,
    /// The controller does not exist.
    Missing,
    /// The controller is pinned by another SelectiveDeployment.
    Conflict,
    /// The write failed.
    Failed,
}

impl ControllerState {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Applied | Self::Current)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ControllerStatus {
    pub kind: ControllerKind,
    pub name: String,
    pub state: ControllerState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Observed placement of a SelectiveDeployment.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SelectiveDeploymentStatus {
    pub ready: bool,
    pub state: PlacementState,
    #[serde(default)]
    pub message: Vec<String>,
    #[serde(default)]
    pub nodes: Vec<String>,
    #[serde(default)]
    pub controllers: Vec<ControllerStatus>,
    #[serde(default)]
    pub placement_hash: String,
}
