//! vcluster operator - Cluster API provider for virtual Kubernetes clusters
//!
//! A virtual cluster is a nested control plane deployed into a host namespace
//! as a Helm release. The operator reconciles `VCluster` resources of two kinds
//! (infrastructure and control plane provider) into such releases, publishes
//! their kubeconfig for Cluster API and reports readiness through conditions.
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (both VCluster kinds, conditions)
//! - [`controller`] - Kubernetes controller reconciliation logic
//! - [`helm`] - Helm driver, value resolution and release lookup
//! - [`kubeconfig`] - bootstrap kubeconfig handling and published secrets
//! - [`probe`] - initialization and readiness probes against the nested API server
//! - [`infrastructure`] - Cluster API infrastructure cluster patching
//! - [`endpoint`] - control plane endpoint discovery
//! - [`cidr`] - host service CIDR discovery
//! - [`config`] - controller configuration
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod cidr;
pub mod config;
pub mod controller;
pub mod crd;
pub mod endpoint;
pub mod error;
pub mod finalizer;
pub mod helm;
pub mod infrastructure;
pub mod kube_utils;
pub mod kubeconfig;
pub mod probe;

pub use error::Error;

/// Result type alias using the operator's Error type
pub type Result<T, E = Error> = std::result::Result<T, E>;
