//! Infrastructure cluster interop for Cluster API
//!
//! When a virtual cluster serves as the control plane of a Cluster API
//! `Cluster` whose infrastructure is provided by someone else, the provider's
//! infrastructure cluster object must learn the control plane endpoint. The
//! objects involved have provider-defined types, so they are handled untyped.

use kube::api::DynamicObject;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::controller::KubeClient;
use crate::crd::{ApiEndpoint, VirtualClusterResource};
use crate::finalizer::controller_owner;
use crate::Error;

/// Annotation that disables the infrastructure cluster patch when set to `true`
pub const SKIP_INFRASTRUCTURE_PATCH_ANNOTATION: &str =
    "vcluster.loft.sh/skip-infrastructure-cluster-patch";

/// API versions under which this operator serves `VCluster`
const VCLUSTER_API_VERSIONS: &[&str] = &[
    "infrastructure.cluster.x-k8s.io/v1alpha1",
    "controlplane.cluster.x-k8s.io/v1alpha1",
];

/// Providers with their own endpoint fields
const OPENSTACK_CLUSTER: &str = "OpenStackCluster";

/// Providers that never become ready on their own once the control plane is external
const FORCED_READY_KINDS: &[&str] = &["KubevirtCluster", "NutanixCluster", "PacketCluster"];

/// `spec.infrastructureRef` of a Cluster API `Cluster`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InfrastructureRef {
    /// apiVersion of the infrastructure cluster
    pub api_version: String,
    /// Kind of the infrastructure cluster
    pub kind: String,
    /// Name of the infrastructure cluster
    pub name: String,
}

impl InfrastructureRef {
    /// Read the reference from an untyped `Cluster`
    pub fn from_cluster(cluster: &DynamicObject) -> Result<Self, Error> {
        let cluster_name = cluster.metadata.name.as_deref().unwrap_or_default();
        let field = |name: &str| -> Result<String, Error> {
            match cluster.data.pointer(&format!("/spec/infrastructureRef/{name}")) {
                Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
                Some(Value::String(_)) | None => Err(Error::orchestration(format!(
                    "cluster {cluster_name} has no spec.infrastructureRef.{name}"
                ))),
                Some(other) => Err(Error::orchestration(format!(
                    "cluster {cluster_name} has a non-string spec.infrastructureRef.{name}: {other}"
                ))),
            }
        };

        Ok(Self {
            api_version: field("apiVersion")?,
            kind: field("kind")?,
            name: field("name")?,
        })
    }

    /// Whether the reference points at a virtual cluster served by this operator
    pub fn is_self_reference(&self) -> bool {
        self.kind == "VCluster" && VCLUSTER_API_VERSIONS.contains(&self.api_version.as_str())
    }
}

/// Merge patch that sets the control plane endpoint on an infrastructure cluster
pub fn endpoint_patch(kind: &str, endpoint: &ApiEndpoint) -> Value {
    if kind == OPENSTACK_CLUSTER {
        json!({
            "spec": {
                "apiServerFixedIP": endpoint.host,
                "apiServerPort": endpoint.port,
            }
        })
    } else {
        json!({
            "spec": {
                "controlPlaneEndpoint": {
                    "host": endpoint.host,
                    "port": endpoint.port,
                }
            }
        })
    }
}

/// Whether `status.ready` must be forced on the infrastructure cluster
pub fn requires_forced_ready(kind: &str) -> bool {
    FORCED_READY_KINDS.contains(&kind)
}

/// Whether the patch is enabled for this resource
pub fn patch_enabled<K: VirtualClusterResource>(obj: &K, cluster_kind_exists: bool) -> bool {
    let skipped = obj
        .meta()
        .annotations
        .as_ref()
        .and_then(|a| a.get(SKIP_INFRASTRUCTURE_PATCH_ANNOTATION))
        .is_some_and(|v| v == "true");
    cluster_kind_exists && !skipped
}

/// Publish the virtual cluster endpoint to the infrastructure cluster of the
/// owning Cluster.
///
/// Marks the control plane as externally managed on `obj` unless the Cluster's
/// infrastructure is a virtual cluster itself.
pub async fn patch_infrastructure_cluster<K: VirtualClusterResource>(
    kube: &dyn KubeClient,
    obj: &mut K,
) -> Result<(), Error> {
    let namespace = obj.meta().namespace.clone().unwrap_or_default();
    let owner = controller_owner(obj)
        .cloned()
        .ok_or_else(|| Error::orchestration("no controller owner reference found"))?;

    let cluster = kube
        .get_object(&owner.api_version, &owner.kind, &owner.name, &namespace)
        .await?
        .ok_or_else(|| {
            Error::orchestration(format!(
                "failed to get parent cluster {namespace}/{}: not found",
                owner.name
            ))
        })?;

    let infra = InfrastructureRef::from_cluster(&cluster)?;
    if infra.is_self_reference() {
        debug!(cluster = %owner.name, "infrastructure cluster is a virtual cluster, nothing to patch");
        return Ok(());
    }

    obj.vcluster_status_mut().external_managed_control_plane = Some(true);

    if kube
        .get_object(&infra.api_version, &infra.kind, &infra.name, &namespace)
        .await?
        .is_none()
    {
        return Err(Error::orchestration(format!(
            "failed to get infrastructure cluster {} {namespace}/{}: not found",
            infra.kind, infra.name
        )));
    }

    let endpoint = obj.vcluster_spec().control_plane_endpoint.clone();
    kube.patch_object(
        &infra.api_version,
        &infra.kind,
        &infra.name,
        &namespace,
        &endpoint_patch(&infra.kind, &endpoint),
    )
    .await?;

    if requires_forced_ready(&infra.kind) {
        kube.patch_object_status(
            &infra.api_version,
            &infra.kind,
            &infra.name,
            &namespace,
            &json!({ "status": { "ready": true } }),
        )
        .await?;
    }

    info!(
        kind = %infra.kind,
        name = %infra.name,
        namespace = %namespace,
        host = %endpoint.host,
        port = endpoint.port,
        "patched infrastructure cluster endpoint"
    );
    Ok(())
}
