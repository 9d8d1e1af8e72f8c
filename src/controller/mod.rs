//! Controllers for the virtual cluster CRDs
//!
//! One generic reconciler drives both `VCluster` kinds. Everything it touches
//! outside the process goes through the [`KubeClient`], [`HelmClient`] and
//! [`ControlPlaneProbe`] seams so the state machine is testable with mocks.
//!
//! [`HelmClient`]: crate::helm::HelmClient
//! [`ControlPlaneProbe`]: crate::probe::ControlPlaneProbe

mod client;
mod vcluster;

pub use client::{cluster_kind_exists, KubeClient, KubeClientImpl, FIELD_MANAGER};
pub use vcluster::{error_policy, reconcile, reconcile_phase, Context, ContextBuilder};

#[cfg(test)]
pub use client::MockKubeClient;
