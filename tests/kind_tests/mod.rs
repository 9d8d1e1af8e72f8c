//! Integration tests for the vcluster operator
//!
//! These tests require a Kubernetes cluster (kind) to run and tell the story
//! of how platform teams interact with virtual clusters.
//!
//! # Test Organization
//!
//! - `crd_operations`: Stories about creating, reading and updating VCluster
//!   resources through the Kubernetes API
//!
//! - `vcluster_lifecycle`: Stories about how the reconciler moves a virtual
//!   cluster through finalizer, deploy, status and deletion
//!
//! # Running These Tests
//!
//! These tests are ignored by default because they require a kind cluster:
//!
//! ```bash
//! cargo test --test kind -- --ignored
//! ```

mod crd_operations;
mod helpers;
mod vcluster_lifecycle;
