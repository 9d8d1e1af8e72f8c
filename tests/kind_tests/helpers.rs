//! Test helpers for integration tests
//!
//! Provides utilities for managing kind clusters and Kubernetes resources.

use std::process::Command;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};
use kube::{Client, Config, CustomResourceExt};
use tokio::sync::OnceCell;
use tokio::time::sleep;

use vcluster_operator::crd::{ControlPlaneVCluster, VCluster};
use vcluster_operator::helm::{HelmClient, UpgradeOptions};
use vcluster_operator::Error;

/// Name of the kind cluster used for integration tests
pub const TEST_CLUSTER_NAME: &str = "vcluster-integration-test";

/// Global lock to ensure cluster is created only once
static CLUSTER_INIT: OnceLock<Result<(), String>> = OnceLock::new();

/// Track if CRDs have been installed (async-safe)
static CRD_INSTALLED: OnceCell<Result<(), String>> = OnceCell::const_new();

/// Check if a kind cluster with the given name exists
pub fn kind_cluster_exists(name: &str) -> bool {
    let output = Command::new("kind")
        .args(["get", "clusters"])
        .output()
        .expect("failed to run kind");

    let clusters = String::from_utf8_lossy(&output.stdout);
    clusters.lines().any(|line| line.trim() == name)
}

/// Create a kind cluster for testing
pub fn create_kind_cluster(name: &str) -> Result<(), String> {
    if kind_cluster_exists(name) {
        println!("Kind cluster '{name}' already exists, reusing it");
        return Ok(());
    }

    println!("Creating kind cluster '{name}'...");
    let output = Command::new("kind")
        .args(["create", "cluster", "--name", name, "--wait", "60s"])
        .output()
        .map_err(|e| format!("failed to run kind: {e}"))?;

    if !output.status.success() {
        return Err(format!(
            "failed to create kind cluster: {}",
            String::from_utf8_lossy(&output.stderr)
        ));
    }

    println!("Kind cluster '{name}' created successfully");
    Ok(())
}

/// Install both VCluster CRDs into the cluster, replacing stale versions
pub async fn install_crds(client: &Client) -> Result<(), kube::Error> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());

    for crd in [VCluster::crd(), ControlPlaneVCluster::crd()] {
        let name = crd.metadata.name.clone().unwrap_or_default();
        match crds.get(&name).await {
            Ok(_) => {
                println!("CRD {name} already installed, deleting and reinstalling...");
                crds.delete(&name, &DeleteParams::default()).await?;
                sleep(Duration::from_secs(2)).await;
            }
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(e) => return Err(e),
        }

        println!("Installing CRD {name}...");
        crds.create(&PostParams::default(), &crd).await?;
    }

    // Wait for CRDs to be established
    sleep(Duration::from_secs(2)).await;

    println!("CRDs installed successfully");
    Ok(())
}

/// Create a Kubernetes client connected to the test cluster
pub async fn create_test_client() -> Result<Client, String> {
    let context_name = format!("kind-{TEST_CLUSTER_NAME}");

    let config = Config::from_kubeconfig(&kube::config::KubeConfigOptions {
        context: Some(context_name),
        ..Default::default()
    })
    .await
    .map_err(|e| format!("failed to load kubeconfig: {e}"))?;

    Client::try_from(config).map_err(|e| format!("failed to create client: {e}"))
}

/// Ensure the test cluster is ready (thread-safe, cluster created once)
///
/// Returns a fresh Client for each call - clients should not be shared across test threads.
pub async fn ensure_test_cluster() -> Result<Client, String> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let cluster_result = CLUSTER_INIT.get_or_init(|| create_kind_cluster(TEST_CLUSTER_NAME));
    cluster_result.clone()?;

    let client = create_test_client().await?;

    let crd_result = CRD_INSTALLED
        .get_or_init(|| async {
            let client = create_test_client().await?;
            install_crds(&client)
                .await
                .map_err(|e| format!("failed to install CRDs: {e}"))
        })
        .await;
    crd_result.clone()?;

    Ok(client)
}

/// Create a namespace unless it already exists
pub async fn ensure_namespace(client: &Client, name: &str) -> Result<(), String> {
    let api: Api<Namespace> = Api::all(client.clone());
    let ns = Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    match api.create(&PostParams::default(), &ns).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 409 => Ok(()),
        Err(e) => Err(format!("failed to create namespace {name}: {e}")),
    }
}

/// Helm driver that records calls instead of running helm
///
/// The kind cluster has no chart repository access, so the e2e stories stop
/// at the Helm boundary and assert on what would have been deployed.
#[derive(Clone, Default)]
pub struct RecordingHelm {
    /// `(release, namespace, options)` per upgrade call
    pub upgrades: Arc<Mutex<Vec<(String, String, UpgradeOptions)>>>,
    /// `(release, namespace)` per delete call
    pub deletes: Arc<Mutex<Vec<(String, String)>>>,
}

impl RecordingHelm {
    /// Number of upgrade calls so far
    pub fn upgrade_count(&self) -> usize {
        self.upgrades.lock().unwrap().len()
    }
}

#[async_trait]
impl HelmClient for RecordingHelm {
    async fn install(
        &self,
        name: &str,
        namespace: &str,
        options: &UpgradeOptions,
    ) -> Result<(), Error> {
        self.upgrade(name, namespace, options).await
    }

    async fn upgrade(
        &self,
        name: &str,
        namespace: &str,
        options: &UpgradeOptions,
    ) -> Result<(), Error> {
        self.upgrades.lock().unwrap().push((
            name.to_string(),
            namespace.to_string(),
            options.clone(),
        ));
        Ok(())
    }

    async fn delete(&self, name: &str, namespace: &str) -> Result<(), Error> {
        self.deletes
            .lock()
            .unwrap()
            .push((name.to_string(), namespace.to_string()));
        Ok(())
    }

    async fn exists(&self, _name: &str, _namespace: &str) -> Result<bool, Error> {
        Ok(false)
    }
}
