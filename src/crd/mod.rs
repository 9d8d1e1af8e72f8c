//! Custom Resource Definitions for virtual clusters
//!
//! This module contains the VirtualCluster kinds reconciled by the operator and
//! the condition helpers their status is built from.

pub mod conditions;
mod types;
mod vcluster;

pub use types::{
    ApiEndpoint, Condition, ConditionSeverity, ConditionStatus, HelmChart, HelmRelease,
    VirtualClusterPhase,
};
pub use vcluster::{
    ControlPlaneVCluster, ControlPlaneVClusterSpec, VCluster, VClusterSpec, VClusterStatus,
    VirtualClusterResource,
};
