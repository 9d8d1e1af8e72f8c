//! Integration tests for the reconciliation lifecycle
//!
//! These tests drive the real reconciler against a kind cluster. Helm is
//! replaced by a recording driver, so the stories cover everything the
//! controller writes to the API server: finalizers, status and cleanup.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};
use kube::runtime::controller::Action;
use kube::Client;
use tokio::time::sleep;

use vcluster_operator::config::ControllerConfig;
use vcluster_operator::controller::{reconcile, Context};
use vcluster_operator::crd::conditions::{self, HELM_CHART_DEPLOYED_CONDITION, KUBECONFIG_READY_CONDITION};
use vcluster_operator::crd::{
    ConditionSeverity, HelmChart, HelmRelease, VCluster, VClusterSpec, VirtualClusterPhase,
};
use vcluster_operator::finalizer::CLEANUP_FINALIZER;

use super::helpers::{ensure_namespace, ensure_test_cluster, RecordingHelm};

const NAMESPACE: &str = "vcluster-lifecycle-tests";

fn sample_vcluster(name: &str) -> VCluster {
    VCluster {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        },
        spec: VClusterSpec {
            helm_release: Some(HelmRelease {
                chart: HelmChart {
                    version: "v0.19.0".to_string(),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        },
        status: None,
    }
}

fn context(client: &Client, helm: &RecordingHelm) -> Arc<Context> {
    Arc::new(
        Context::builder(client.clone(), Arc::new(helm.clone()))
            .config(ControllerConfig::default())
            .cluster_kind_exists(false)
            .build(),
    )
}

/// Story: A virtual cluster goes from creation to deletion
///
/// Expected behavior:
/// - The first pass only adds the cleanup finalizer
/// - The second pass deploys the chart and reports Pending while the virtual
///   cluster has not written its bootstrap kubeconfig
/// - Deleting the resource releases the finalizer and the resource goes away
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_virtual_cluster_lifecycle() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    ensure_namespace(&client, NAMESPACE)
        .await
        .expect("failed to create namespace");
    let api: Api<VCluster> = Api::namespaced(client.clone(), NAMESPACE);
    let name = "test-lifecycle";
    let _ = api.delete(name, &DeleteParams::default()).await;

    let helm = RecordingHelm::default();
    let ctx = context(&client, &helm);

    api.create(&PostParams::default(), &sample_vcluster(name))
        .await
        .expect("failed to create vcluster");

    // Act: first pass
    let vc = api.get(name).await.expect("failed to get vcluster");
    let action = reconcile(Arc::new(vc), ctx.clone())
        .await
        .expect("first pass should succeed");

    // Assert: finalizer persisted, nothing deployed yet
    assert_eq!(action, Action::requeue(Duration::from_secs(1)));
    let vc = api.get(name).await.expect("failed to get vcluster");
    assert!(vc
        .metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == CLEANUP_FINALIZER)));
    assert_eq!(helm.upgrade_count(), 0);

    // Act: second pass
    let action = reconcile(Arc::new(vc), ctx.clone())
        .await
        .expect("waiting for bootstrap is not an error");

    // Assert: chart deployed, status reflects the wait
    assert_eq!(action, Action::requeue(Duration::from_secs(5)));
    {
        let upgrades = helm.upgrades.lock().unwrap();
        assert_eq!(upgrades.len(), 1);
        let (release, namespace, options) = &upgrades[0];
        assert_eq!(release, name);
        assert_eq!(namespace, NAMESPACE);
        assert_eq!(options.chart, "vcluster");
        assert_eq!(options.version, "0.19.0");
    }

    let vc = api.get(name).await.expect("failed to get vcluster");
    let status = vc.status.clone().expect("status should be written");
    assert_eq!(status.phase, VirtualClusterPhase::Pending);
    assert_eq!(status.observed_generation, vc.metadata.generation.unwrap_or_default());
    assert!(conditions::is_true(&status.conditions, HELM_CHART_DEPLOYED_CONDITION));
    let kubeconfig = conditions::get(&status.conditions, KUBECONFIG_READY_CONDITION)
        .expect("kubeconfig condition should be set");
    assert_eq!(kubeconfig.severity, ConditionSeverity::Warning);

    // Act: third pass with the generation already observed
    reconcile(Arc::new(vc), ctx.clone())
        .await
        .expect("third pass should succeed");
    assert_eq!(helm.upgrade_count(), 1, "unchanged spec must not redeploy");

    // Act: delete
    api.delete(name, &DeleteParams::default())
        .await
        .expect("failed to delete vcluster");
    let vc = api.get(name).await.expect("finalizer should hold the resource");
    assert!(vc.metadata.deletion_timestamp.is_some());
    reconcile(Arc::new(vc), ctx)
        .await
        .expect("deletion pass should succeed");

    // Assert: resource released
    let mut gone = false;
    for _ in 0..10 {
        if api.get_opt(name).await.expect("failed to get vcluster").is_none() {
            gone = true;
            break;
        }
        sleep(Duration::from_millis(500)).await;
    }
    assert!(gone, "vcluster should be deleted after the finalizer is released");
}
