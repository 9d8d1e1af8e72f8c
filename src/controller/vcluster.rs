//! Virtual cluster reconciler
//!
//! A pass over a live resource runs these steps in order, each one depending on
//! the previous:
//!
//! 1. deploy or upgrade the Helm release when the spec changed
//! 2. read the bootstrap kubeconfig, probe the control plane once and publish
//!    the kubeconfig and CA secrets
//! 3. point the Cluster API infrastructure cluster at the control plane
//! 4. check `/readyz`
//!
//! Whatever happened, the phase is recomputed and the status is patched at the
//! end of the pass.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use serde_json::{json, Value};
use tracing::{debug, error, info, instrument, warn};

use super::client::{KubeClient, KubeClientImpl};
use crate::cidr::ServiceCidrCache;
use crate::config::ControllerConfig;
use crate::crd::conditions::{
    self, CONTROL_PLANE_INITIALIZED_CONDITION, HELM_CHART_DEPLOYED_CONDITION,
    INFRASTRUCTURE_CLUSTER_SYNCED_CONDITION, KUBECONFIG_READY_CONDITION, MAX_MESSAGE_LEN,
    OWNED_CONDITIONS, READY_CONDITION, READY_SUMMARY_INPUTS,
};
use crate::crd::{
    Condition, ConditionSeverity, VClusterStatus, VirtualClusterPhase, VirtualClusterResource,
};
use crate::endpoint::resolve_host;
use crate::finalizer::{
    self, cluster_owner, has_cleanup_finalizer, logical_cluster_name, CLEANUP_FINALIZER,
};
use crate::helm::{latest_release, resolve_values, ChartRef, HelmClient};
use crate::infrastructure::{patch_enabled, patch_infrastructure_cluster};
use crate::kubeconfig::{
    bootstrap_secret_name, ca_secret, certs_secret_name, kubeconfig_secret, server_url,
    BootstrapKubeconfig, VirtualClusterAccess, DEFAULT_CONTROL_PLANE_PORT,
};
use crate::probe::{ControlPlaneProbe, HttpsProbe};
use crate::Error;

/// Requeue delay while something is not ready yet
const REQUEUE_NOT_READY: Duration = Duration::from_secs(5);
/// Requeue delay after a fully successful pass
const REQUEUE_READY: Duration = Duration::from_secs(60);
/// Requeue delay after the finalizer was added
const REQUEUE_FINALIZER_ADDED: Duration = Duration::from_secs(1);

/// Shared state for both virtual cluster controllers
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```ignore
/// let ctx = Context::builder(client, helm)
///     .config(config)
///     .cluster_kind_exists(true)
///     .build();
/// ```
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Helm driver deploying the virtual cluster chart
    pub helm: Arc<dyn HelmClient>,
    /// Probes against the nested control plane
    pub probe: Arc<dyn ControlPlaneProbe>,
    /// Host service CIDR, present when discovery is enabled
    pub service_cidr: Option<Arc<ServiceCidrCache>>,
    /// Controller settings
    pub config: ControllerConfig,
    /// Whether the Cluster API `Cluster` kind is served; read once at startup
    pub cluster_kind_exists: bool,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client, helm: Arc<dyn HelmClient>) -> ContextBuilder {
        ContextBuilder::new(client, helm)
    }

    /// Create a context for testing with mock collaborators
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        helm: Arc<dyn HelmClient>,
        probe: Arc<dyn ControlPlaneProbe>,
        cluster_kind_exists: bool,
    ) -> Self {
        Self {
            kube,
            helm,
            probe,
            service_cidr: None,
            config: ControllerConfig {
                charts_dir: "/nonexistent-charts".into(),
                ..Default::default()
            },
            cluster_kind_exists,
        }
    }

    /// Name of the secrets consumed by the orchestration layer
    fn logical_name<K: VirtualClusterResource>(&self, obj: &K) -> String {
        if self.cluster_kind_exists {
            logical_cluster_name(obj)
        } else {
            obj.name_any()
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    helm: Arc<dyn HelmClient>,
    kube: Option<Arc<dyn KubeClient>>,
    probe: Option<Arc<dyn ControlPlaneProbe>>,
    config: ControllerConfig,
    cluster_kind_exists: bool,
}

impl ContextBuilder {
    fn new(client: Client, helm: Arc<dyn HelmClient>) -> Self {
        Self {
            client,
            helm,
            kube: None,
            probe: None,
            config: ControllerConfig::default(),
            cluster_kind_exists: false,
        }
    }

    /// Set the controller configuration
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Record whether the Cluster API `Cluster` kind exists
    pub fn cluster_kind_exists(mut self, exists: bool) -> Self {
        self.cluster_kind_exists = exists;
        self
    }

    /// Override the Kubernetes client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the control plane probe (primarily for testing)
    pub fn probe(mut self, probe: Arc<dyn ControlPlaneProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let service_cidr = self
            .config
            .discover_service_cidr
            .then(|| Arc::new(ServiceCidrCache::new()));
        Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone()))),
            helm: self.helm,
            probe: self.probe.unwrap_or_else(|| Arc::new(HttpsProbe)),
            service_cidr,
            config: self.config,
            cluster_kind_exists: self.cluster_kind_exists,
        }
    }
}

/// Reconcile a virtual cluster of either kind
#[instrument(
    skip(obj, ctx),
    fields(
        kind = %K::kind(&()),
        cluster = %obj.name_any(),
        namespace = %obj.namespace().unwrap_or_default(),
    )
)]
pub async fn reconcile<K: VirtualClusterResource>(
    obj: Arc<K>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    info!("reconciling virtual cluster");

    if obj.meta().deletion_timestamp.is_some() {
        return handle_deletion(obj.as_ref(), &ctx).await;
    }

    // Cluster API sets the owner reference on infrastructure objects; until it
    // does, the resource is not ours to act on.
    if ctx.cluster_kind_exists && cluster_owner(obj.as_ref()).is_none() {
        debug!("waiting for Cluster owner reference");
        return Ok(Action::await_change());
    }

    if !has_cleanup_finalizer(obj.as_ref()) {
        let finalizers = finalizer::with_added(obj.finalizers(), CLEANUP_FINALIZER);
        patch_finalizers(obj.as_ref(), &ctx, finalizers).await?;
        info!("added cleanup finalizer");
        return Ok(Action::requeue(REQUEUE_FINALIZER_ADDED));
    }

    let mut vc = (*obj).clone();
    let result = reconcile_normal(&mut vc, &ctx).await;

    reconcile_phase(&mut vc);
    conditions::set_summary(
        &mut vc.vcluster_status_mut().conditions,
        READY_CONDITION,
        READY_SUMMARY_INPUTS,
    );

    let patched = patch_vcluster(&ctx, obj.as_ref(), &vc, result.is_ok()).await;
    match (result, patched) {
        (Ok(action), Ok(())) => Ok(action),
        (result, patched) => {
            let errors = [result.err(), patched.err()].into_iter().flatten();
            Err(Error::aggregate(errors).unwrap_or_else(|| {
                Error::internal_with_context("reconcile", "failure without an error")
            }))
        }
    }
}

/// Error policy for the controllers
///
/// Every failure is retried after a short fixed delay.
pub fn error_policy<K: VirtualClusterResource>(
    obj: Arc<K>,
    error: &Error,
    _ctx: Arc<Context>,
) -> Action {
    error!(
        ?error,
        cluster = %obj.name_any(),
        namespace = %obj.namespace().unwrap_or_default(),
        "reconciliation failed"
    );
    Action::requeue(REQUEUE_NOT_READY)
}

async fn reconcile_normal<K: VirtualClusterResource>(
    vc: &mut K,
    ctx: &Context,
) -> Result<Action, Error> {
    if let Err(e) = redeploy_if_needed(vc, ctx).await {
        error!(error = %e, "error during virtual cluster deploy");
        conditions::mark_false(
            &mut vc.vcluster_status_mut().conditions,
            HELM_CHART_DEPLOYED_CONDITION,
            "HelmDeployFailed",
            ConditionSeverity::Error,
            &e.to_string(),
        );
        return Err(e);
    }

    let access = match sync_kubeconfig(vc, ctx).await {
        Ok(access) => access,
        Err(e) => {
            let severity = if e.is_configuration() {
                ConditionSeverity::Error
            } else {
                ConditionSeverity::Warning
            };
            conditions::mark_false(
                &mut vc.vcluster_status_mut().conditions,
                KUBECONFIG_READY_CONDITION,
                "CheckFailed",
                severity,
                &e.to_string(),
            );
            if e.is_transient() {
                info!(error = %e, "virtual cluster is not ready");
                return Ok(Action::requeue(REQUEUE_NOT_READY));
            }
            warn!(error = %e, "failed to sync kubeconfig");
            return Err(e);
        }
    };

    if patch_enabled(vc, ctx.cluster_kind_exists) {
        if let Err(e) = patch_infrastructure_cluster(ctx.kube.as_ref(), vc).await {
            error!(error = %e, "error during infrastructure cluster patch");
            conditions::mark_false(
                &mut vc.vcluster_status_mut().conditions,
                INFRASTRUCTURE_CLUSTER_SYNCED_CONDITION,
                "PatchFailed",
                ConditionSeverity::Error,
                &e.to_string(),
            );
            return Err(e);
        }
    }
    conditions::mark_true(
        &mut vc.vcluster_status_mut().conditions,
        INFRASTRUCTURE_CLUSTER_SYNCED_CONDITION,
    );

    Ok(check_readiness(vc, ctx, &access).await)
}

/// Install or upgrade the Helm release unless the current generation is
/// already deployed
async fn redeploy_if_needed<K: VirtualClusterResource>(
    vc: &mut K,
    ctx: &Context,
) -> Result<(), Error> {
    let generation = vc.meta().generation.unwrap_or_default();
    let observed = vc
        .vcluster_status()
        .map(|s| s.observed_generation)
        .unwrap_or_default();
    let deployed = conditions::is_true(vc.conditions(), HELM_CHART_DEPLOYED_CONDITION);
    if generation == observed && deployed {
        return Ok(());
    }

    let name = vc.name_any();
    let namespace = vc.namespace().unwrap_or_default();
    let release = vc.vcluster_spec().helm_release.as_ref();
    let chart = ChartRef::resolve(release, &ctx.config.chart_defaults())?;

    let service_cidr = match &ctx.service_cidr {
        Some(cache) => Some(
            cache
                .get_or_discover(ctx.kube.as_ref(), &ctx.config.cidr_probe_namespace)
                .await?,
        ),
        None => None,
    };
    let values = resolve_values(release, service_cidr.as_deref())?;

    info!(
        chart = %chart.name,
        repo = %chart.repo,
        version = %chart.version,
        "{} virtual cluster",
        if deployed { "upgrading" } else { "deploying" }
    );

    let options = chart.upgrade_options(&ctx.config.charts_dir, values);
    let outcome = match ctx.helm.exists(&name, &namespace).await {
        Ok(true) => ctx.helm.upgrade(&name, &namespace, &options).await,
        Ok(false) => ctx.helm.install(&name, &namespace, &options).await,
        Err(e) => Err(e),
    };
    outcome.map_err(|e| {
        Error::helm(format!(
            "error installing / upgrading vcluster: {}",
            conditions::truncate_message(&e.to_string(), MAX_MESSAGE_LEN)
        ))
    })?;

    let status = vc.vcluster_status_mut();
    conditions::mark_true(&mut status.conditions, HELM_CHART_DEPLOYED_CONDITION);
    conditions::delete(&mut status.conditions, KUBECONFIG_READY_CONDITION);
    status.ready = false;
    Ok(())
}

/// Publish the kubeconfig of the virtual cluster and return access to it
async fn sync_kubeconfig<K: VirtualClusterResource>(
    vc: &mut K,
    ctx: &Context,
) -> Result<VirtualClusterAccess, Error> {
    let name = vc.name_any();
    let namespace = vc.namespace().unwrap_or_default();

    let bootstrap_name = bootstrap_secret_name(&name);
    let bootstrap = ctx
        .kube
        .get_secret(&bootstrap_name, &namespace)
        .await?
        .ok_or_else(|| {
            Error::not_ready(format!("secret {namespace}/{bootstrap_name} not found"))
        })?;
    let mut kubeconfig = BootstrapKubeconfig::from_secret(&bootstrap)?;
    let access = VirtualClusterAccess::in_cluster(&name, &namespace, kubeconfig.credentials()?);

    if !conditions::is_true(vc.conditions(), CONTROL_PLANE_INITIALIZED_CONDITION) {
        ctx.probe.service_account_ready(&access).await?;
        conditions::mark_true(
            &mut vc.vcluster_status_mut().conditions,
            CONTROL_PLANE_INITIALIZED_CONDITION,
        );
        info!("virtual cluster control plane initialized");
    }
    // Older resources predate the field.
    vc.vcluster_status_mut().initialized = true;

    kubeconfig.ensure_single_cluster()?;

    if vc.vcluster_spec().control_plane_endpoint.host.is_empty() {
        let host = resolve_host(ctx.kube.as_ref(), &name, &namespace).await?;
        let endpoint = &mut vc.vcluster_spec_mut().control_plane_endpoint;
        endpoint.host = host;
        if endpoint.port == 0 {
            endpoint.port = DEFAULT_CONTROL_PLANE_PORT;
        }
    }
    let endpoint = &vc.vcluster_spec().control_plane_endpoint;
    kubeconfig.rewrite_server(&server_url(&endpoint.host, endpoint.port));

    let logical = ctx.logical_name(vc);
    ctx.kube
        .apply_secret(&kubeconfig_secret(&logical, &namespace, &kubeconfig.to_yaml()?))
        .await?;

    let certs_name = certs_secret_name(&name);
    let certs = ctx
        .kube
        .get_secret(&certs_name, &namespace)
        .await?
        .ok_or_else(|| {
            Error::internal_with_context(
                "sync ca secret",
                format!("can not get certs secret {namespace}/{certs_name}: not found"),
            )
        })?;
    ctx.kube
        .apply_secret(&ca_secret(&logical, &namespace, &certs)?)
        .await?;

    conditions::mark_true(
        &mut vc.vcluster_status_mut().conditions,
        KUBECONFIG_READY_CONDITION,
    );
    Ok(access)
}

/// Record the result of `/readyz` and pick the requeue delay
async fn check_readiness<K: VirtualClusterResource>(
    vc: &mut K,
    ctx: &Context,
    access: &VirtualClusterAccess,
) -> Action {
    let endpoint = vc.vcluster_spec().control_plane_endpoint.clone();
    let ready = match ctx.probe.readyz(access, &endpoint).await {
        Ok(ready) => ready,
        Err(e) => {
            debug!(error = %e, "readiness check failed");
            false
        }
    };
    vc.vcluster_status_mut().ready = ready;

    if ready {
        Action::requeue(REQUEUE_READY)
    } else {
        debug!("virtual cluster is not ready yet");
        Action::requeue(REQUEUE_NOT_READY)
    }
}

/// Derive the phase from the conditions
///
/// Any False condition with Error severity means Failed, with reason and
/// message taken from the first one. Otherwise the cluster is Deployed once
/// ready and initialized, and Pending before that.
pub fn reconcile_phase<K: VirtualClusterResource>(vc: &mut K) {
    let name = vc.name_any();
    let status = vc.vcluster_status_mut();
    let old_phase = status.phase.clone();

    if let Some(failed) = conditions::first_error(&status.conditions).cloned() {
        status.phase = VirtualClusterPhase::Failed;
        status.reason = failed.reason;
        status.message = failed.message;
    } else {
        let initialized =
            conditions::is_true(&status.conditions, CONTROL_PLANE_INITIALIZED_CONDITION);
        status.phase = if status.ready && initialized {
            VirtualClusterPhase::Deployed
        } else {
            VirtualClusterPhase::Pending
        };
        status.reason.clear();
        status.message.clear();
    }

    if old_phase != status.phase {
        info!(
            cluster = %name,
            old_phase = ?old_phase,
            new_phase = ?status.phase,
            reason = %status.reason,
            message = %status.message,
            "virtual cluster phase changed"
        );
    }
}

/// Tear down the Helm release and volume, then release the finalizer
async fn handle_deletion<K: VirtualClusterResource>(
    vc: &K,
    ctx: &Context,
) -> Result<Action, Error> {
    if !has_cleanup_finalizer(vc) {
        return Ok(Action::await_change());
    }

    let name = vc.name_any();
    let namespace = vc.namespace().unwrap_or_default();

    let ns = match ctx.kube.get_namespace(&namespace).await {
        Ok(Some(ns)) => ns,
        Ok(None) => {
            debug!("namespace is gone, nothing to clean up");
            return Ok(Action::await_change());
        }
        Err(e) => {
            warn!(error = %e, "failed to get namespace during deletion");
            return Err(e);
        }
    };

    if ns.metadata.deletion_timestamp.is_some() {
        info!("namespace is terminating, skipping release cleanup");
    } else {
        if let Some(record) = latest_release(ctx.kube.as_ref(), &name, &namespace).await? {
            if record.is_helm_owned() {
                info!(revision = record.release.version, "deleting virtual cluster helm release");
                ctx.helm.delete(&name, &namespace).await?;
            }
        }
        ctx.kube
            .delete_pvc(&format!("data-{name}-0"), &namespace)
            .await?;
    }

    let finalizers = finalizer::without(vc.finalizers(), CLEANUP_FINALIZER);
    patch_finalizers(vc, ctx, finalizers).await?;
    info!("removed cleanup finalizer");
    Ok(Action::await_change())
}

async fn patch_finalizers<K: VirtualClusterResource>(
    vc: &K,
    ctx: &Context,
    finalizers: Vec<String>,
) -> Result<(), Error> {
    let patch = json!({
        "metadata": {
            "finalizers": finalizers,
            "resourceVersion": vc.meta().resource_version,
        }
    });
    ctx.kube
        .patch_object(
            &K::api_version(&()),
            &K::kind(&()),
            &vc.name_any(),
            &vc.namespace().unwrap_or_default(),
            &patch,
        )
        .await
}

/// Persist the endpoint write-back and the status computed by this pass
async fn patch_vcluster<K: VirtualClusterResource>(
    ctx: &Context,
    original: &K,
    vc: &K,
    succeeded: bool,
) -> Result<(), Error> {
    let api_version = K::api_version(&());
    let kind = K::kind(&());
    let name = vc.name_any();
    let namespace = vc.namespace().unwrap_or_default();

    let endpoint = &vc.vcluster_spec().control_plane_endpoint;
    if endpoint != &original.vcluster_spec().control_plane_endpoint {
        let patch = json!({ "spec": { "controlPlaneEndpoint": endpoint } });
        ctx.kube
            .patch_object(&api_version, &kind, &name, &namespace, &patch)
            .await?;
        info!(host = %endpoint.host, port = endpoint.port, "recorded control plane endpoint");
    }

    let Some(latest) = ctx
        .kube
        .get_object(&api_version, &kind, &name, &namespace)
        .await?
    else {
        debug!("resource is gone, skipping status patch");
        return Ok(());
    };
    let latest_conditions: Vec<Condition> = match latest.data.pointer("/status/conditions") {
        Some(value) => serde_json::from_value(value.clone())?,
        None => Vec::new(),
    };

    let mut status = vc.vcluster_status().cloned().unwrap_or_default();
    status.conditions = conditions::merge_owned(
        original.conditions(),
        &status.conditions,
        &latest_conditions,
        OWNED_CONDITIONS,
    );
    let observed_generation = succeeded.then(|| vc.meta().generation.unwrap_or_default());

    let patch = status_patch(
        &status,
        latest.metadata.resource_version.as_deref(),
        observed_generation,
    )?;
    ctx.kube
        .patch_object_status(&api_version, &kind, &name, &namespace, &patch)
        .await
}

/// Merge patch for the status subresource
///
/// Cleared fields are sent as null so the merge removes them, and
/// `observedGeneration` is only sent when the pass succeeded.
fn status_patch(
    status: &VClusterStatus,
    resource_version: Option<&str>,
    observed_generation: Option<i64>,
) -> Result<Value, Error> {
    let mut body = serde_json::to_value(status)?;
    if let Some(map) = body.as_object_mut() {
        for key in ["reason", "message"] {
            map.entry(key).or_insert(Value::Null);
        }
        map.insert(
            "conditions".to_string(),
            serde_json::to_value(&status.conditions)?,
        );
        map.remove("observedGeneration");
        if let Some(generation) = observed_generation {
            map.insert("observedGeneration".to_string(), json!(generation));
        }
    }

    let mut patch = json!({ "status": body });
    if let Some(rv) = resource_version {
        patch["metadata"] = json!({ "resourceVersion": rv });
    }
    Ok(patch)
}
