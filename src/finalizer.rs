//! Finalizer and owner reference helpers
//!
//! Small set operations over string lists plus the lookups the reconciler needs
//! on owner references.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::Resource;

/// Finalizer guarding Helm release and volume cleanup
pub const CLEANUP_FINALIZER: &str = "vcluster.loft.sh/cleanup";

/// Kind of the orchestration layer aggregate that owns infrastructure objects
pub const CLUSTER_KIND: &str = "Cluster";

/// Whether `list` contains `value`
pub fn contains(list: &[String], value: &str) -> bool {
    list.iter().any(|v| v == value)
}

/// `list` with `value` appended if it was missing
pub fn with_added(list: &[String], value: &str) -> Vec<String> {
    let mut out = list.to_vec();
    if !contains(&out, value) {
        out.push(value.to_string());
    }
    out
}

/// `list` without any occurrence of `value`
pub fn without(list: &[String], value: &str) -> Vec<String> {
    list.iter().filter(|v| *v != value).cloned().collect()
}

/// Whether the resource carries the cleanup finalizer
pub fn has_cleanup_finalizer<K: Resource>(obj: &K) -> bool {
    obj.meta()
        .finalizers
        .as_deref()
        .is_some_and(|f| contains(f, CLEANUP_FINALIZER))
}

/// First owner reference of kind `Cluster`
pub fn cluster_owner<K: Resource>(obj: &K) -> Option<&OwnerReference> {
    obj.meta()
        .owner_references
        .as_deref()
        .and_then(|refs| refs.iter().find(|r| r.kind == CLUSTER_KIND))
}

/// Owner reference flagged as the managing controller
pub fn controller_owner<K: Resource>(obj: &K) -> Option<&OwnerReference> {
    obj.meta()
        .owner_references
        .as_deref()
        .and_then(|refs| refs.iter().find(|r| r.controller == Some(true)))
}

/// Name used for secrets consumed by the orchestration layer
///
/// Taken from the owning `Cluster` when one is set, otherwise the resource's
/// own name.
pub fn logical_cluster_name<K: Resource>(obj: &K) -> String {
    match cluster_owner(obj) {
        Some(owner) => owner.name.clone(),
        None => obj.meta().name.clone().unwrap_or_default(),
    }
}
