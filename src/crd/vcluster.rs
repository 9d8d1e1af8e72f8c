//! VirtualCluster Custom Resource Definitions
//!
//! Two kinds share one schema: the infrastructure provider flavour
//! (`infrastructure.cluster.x-k8s.io`) and the control plane provider flavour
//! (`controlplane.cluster.x-k8s.io`). Both are named `VCluster` on the wire and
//! are reconciled by the same generic controller through
//! [`VirtualClusterResource`].

use std::fmt::Debug;
use std::ops::{Deref, DerefMut};

use k8s_openapi::NamespaceResourceScope;
use kube::{CustomResource, Resource};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::types::{ApiEndpoint, Condition, HelmRelease, VirtualClusterPhase};

/// Specification for a virtual cluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1alpha1",
    kind = "VCluster",
    plural = "vclusters",
    status = "VClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VClusterSpec {
    /// Endpoint used to reach the virtual cluster API server. Discovered
    /// automatically from the virtual cluster Service when left empty.
    #[serde(default)]
    pub control_plane_endpoint: ApiEndpoint,

    /// Helm release that deploys the virtual cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm_release: Option<HelmRelease>,
}

/// Specification for the control plane provider flavour of a virtual cluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "controlplane.cluster.x-k8s.io",
    version = "v1alpha1",
    kind = "VCluster",
    root = "ControlPlaneVCluster",
    plural = "vclusters",
    status = "VClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct ControlPlaneVClusterSpec {
    /// Shared virtual cluster fields
    #[serde(flatten)]
    pub inner: VClusterSpec,
}

impl Deref for ControlPlaneVClusterSpec {
    type Target = VClusterSpec;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for ControlPlaneVClusterSpec {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

/// Observed state of a virtual cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VClusterStatus {
    /// Virtual cluster answered its readiness endpoint on the last check
    #[serde(default)]
    pub ready: bool,

    /// Control plane has served at least one API request
    #[serde(default)]
    pub initialized: bool,

    /// Lifecycle phase derived from the conditions
    #[serde(default)]
    pub phase: VirtualClusterPhase,

    /// Machine-readable failure reason
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    /// Human-readable failure message
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Conditions representing the virtual cluster state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Generation last processed without error
    #[serde(default, skip_serializing_if = "is_zero")]
    pub observed_generation: i64,

    /// Tells Cluster API that the control plane is managed outside of it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_managed_control_plane: Option<bool>,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

/// Capability shared by both virtual cluster kinds
///
/// The reconciler is written once against this trait and instantiated per kind.
pub trait VirtualClusterResource:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Desired state
    fn vcluster_spec(&self) -> &VClusterSpec;

    /// Desired state, mutable (endpoint write-back)
    fn vcluster_spec_mut(&mut self) -> &mut VClusterSpec;

    /// Observed state, if any has been recorded
    fn vcluster_status(&self) -> Option<&VClusterStatus>;

    /// Observed state, created empty when missing
    fn vcluster_status_mut(&mut self) -> &mut VClusterStatus;

    /// Conditions, empty when there is no status yet
    fn conditions(&self) -> &[Condition] {
        self.vcluster_status()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }
}

impl VirtualClusterResource for VCluster {
    fn vcluster_spec(&self) -> &VClusterSpec {
        &self.spec
    }

    fn vcluster_spec_mut(&mut self) -> &mut VClusterSpec {
        &mut self.spec
    }

    fn vcluster_status(&self) -> Option<&VClusterStatus> {
        self.status.as_ref()
    }

    fn vcluster_status_mut(&mut self) -> &mut VClusterStatus {
        self.status.get_or_insert_with(Default::default)
    }
}

impl VirtualClusterResource for ControlPlaneVCluster {
    fn vcluster_spec(&self) -> &VClusterSpec {
        &self.spec
    }

    fn vcluster_spec_mut(&mut self) -> &mut VClusterSpec {
        &mut self.spec
    }

    fn vcluster_status(&self) -> Option<&VClusterStatus> {
        self.status.as_ref()
    }

    fn vcluster_status_mut(&mut self) -> &mut VClusterStatus {
        self.status.get_or_insert_with(Default::default)
    }
}
