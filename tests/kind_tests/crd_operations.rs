//! Integration tests for CRD operations
//!
//! These tests tell the story of how users interact with VCluster resources
//! through the Kubernetes API.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::Client;

use vcluster_operator::crd::{
    ApiEndpoint, ControlPlaneVCluster, ControlPlaneVClusterSpec, HelmChart, HelmRelease,
    VCluster, VClusterSpec, VClusterStatus, VirtualClusterPhase,
};

use super::helpers::{ensure_namespace, ensure_test_cluster};

const NAMESPACE: &str = "vcluster-crd-tests";

// =============================================================================
// Test Fixtures
// =============================================================================

fn sample_spec() -> VClusterSpec {
    VClusterSpec {
        control_plane_endpoint: ApiEndpoint::default(),
        helm_release: Some(HelmRelease {
            chart: HelmChart {
                version: "0.19.0".to_string(),
                ..Default::default()
            },
            values_object: Some(serde_json::json!({"sync": {"ingresses": {"enabled": true}}})),
            ..Default::default()
        }),
    }
}

fn sample_vcluster(name: &str) -> VCluster {
    VCluster {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        },
        spec: sample_spec(),
        status: None,
    }
}

async fn cleanup_vcluster(client: &Client, name: &str) {
    let api: Api<VCluster> = Api::namespaced(client.clone(), NAMESPACE);
    let _ = api.delete(name, &DeleteParams::default()).await;
}

// =============================================================================
// Stories
// =============================================================================

/// Story: A platform team declares a virtual cluster
///
/// Expected behavior:
/// - The VCluster resource is created in Kubernetes
/// - The chart settings, including free-form values, round-trip unchanged
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_team_declares_virtual_cluster() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    ensure_namespace(&client, NAMESPACE)
        .await
        .expect("failed to create namespace");
    let api: Api<VCluster> = Api::namespaced(client.clone(), NAMESPACE);
    let name = "test-vc-create";
    cleanup_vcluster(&client, name).await;

    let created = api
        .create(&PostParams::default(), &sample_vcluster(name))
        .await
        .expect("failed to create vcluster");
    assert_eq!(created.metadata.name.as_deref(), Some(name));

    let fetched = api.get(name).await.expect("failed to get vcluster");
    let release = fetched.spec.helm_release.expect("helm release should persist");
    assert_eq!(release.chart.version, "0.19.0");
    assert_eq!(
        release.values_object,
        Some(serde_json::json!({"sync": {"ingresses": {"enabled": true}}})),
        "free-form values must not be pruned"
    );

    cleanup_vcluster(&client, name).await;
}

/// Story: The controller reports progress through the status subresource
///
/// Expected behavior:
/// - Status written through the subresource is persisted with its conditions
/// - A spec update does not wipe the status
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_status_survives_spec_updates() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    ensure_namespace(&client, NAMESPACE)
        .await
        .expect("failed to create namespace");
    let api: Api<VCluster> = Api::namespaced(client.clone(), NAMESPACE);
    let name = "test-vc-status";
    cleanup_vcluster(&client, name).await;

    api.create(&PostParams::default(), &sample_vcluster(name))
        .await
        .expect("failed to create vcluster");

    let status = serde_json::json!({
        "status": {
            "phase": "Pending",
            "observedGeneration": 1,
            "conditions": [{
                "type": "HelmChartDeployed",
                "status": "True",
                "lastTransitionTime": "2024-01-01T00:00:00Z"
            }]
        }
    });
    api.patch_status(name, &PatchParams::default(), &Patch::Merge(&status))
        .await
        .expect("failed to patch status");

    let spec = serde_json::json!({
        "spec": {"controlPlaneEndpoint": {"host": "vc.example.com", "port": 443}}
    });
    api.patch(name, &PatchParams::default(), &Patch::Merge(&spec))
        .await
        .expect("failed to patch spec");

    let fetched = api.get(name).await.expect("failed to get vcluster");
    assert_eq!(fetched.spec.control_plane_endpoint.host, "vc.example.com");
    let status: VClusterStatus = fetched.status.expect("status should persist");
    assert_eq!(status.phase, VirtualClusterPhase::Pending);
    assert_eq!(status.observed_generation, 1);
    assert_eq!(status.conditions.len(), 1);

    cleanup_vcluster(&client, name).await;
}

/// Story: The same virtual cluster is offered as a control plane provider
///
/// Expected behavior:
/// - The control plane kind lives in its own API group next to the
///   infrastructure kind and shares the wire format
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_control_plane_kind_shares_schema() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    ensure_namespace(&client, NAMESPACE)
        .await
        .expect("failed to create namespace");
    let api: Api<ControlPlaneVCluster> = Api::namespaced(client.clone(), NAMESPACE);
    let name = "test-cp-vc";
    let _ = api.delete(name, &DeleteParams::default()).await;

    let vc = ControlPlaneVCluster {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        },
        spec: ControlPlaneVClusterSpec {
            inner: sample_spec(),
        },
        status: None,
    };
    api.create(&PostParams::default(), &vc)
        .await
        .expect("failed to create control plane vcluster");

    let fetched = api.get(name).await.expect("failed to get vcluster");
    assert_eq!(
        fetched.spec.helm_release.as_ref().map(|r| r.chart.version.as_str()),
        Some("0.19.0")
    );

    let _ = api.delete(name, &DeleteParams::default()).await;
}
