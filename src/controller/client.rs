//! Kubernetes access used by the virtual cluster controller
//!
//! Everything the reconciler reads or writes in the host cluster goes through
//! [`KubeClient`] so the state machine can be tested against mocks.
//! Objects whose concrete type is unknown at compile time (the reconciled
//! resource itself, Cluster API clusters, provider infrastructure clusters) are
//! handled as [`DynamicObject`]s addressed by apiVersion and kind.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, PersistentVolumeClaim, Secret, Service};
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::core::GroupVersionKind;
use kube::discovery::ApiResource;
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::Error;

/// Field manager recorded on every write
pub const FIELD_MANAGER: &str = "vcluster-operator";

/// Trait abstracting Kubernetes client operations for the controller
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get a namespace, `None` when it does not exist
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, Error>;

    /// Get a secret, `None` when it does not exist
    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, Error>;

    /// List secrets matching a label selector
    async fn list_secrets(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Secret>, Error>;

    /// Create or update a secret with server-side apply
    async fn apply_secret(&self, secret: &Secret) -> Result<(), Error>;

    /// Get a service, `None` when it does not exist
    async fn get_service(&self, name: &str, namespace: &str) -> Result<Option<Service>, Error>;

    /// Create a service
    async fn create_service(&self, service: &Service) -> Result<(), Error>;

    /// Delete a persistent volume claim; a missing claim is not an error
    async fn delete_pvc(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// Get an object of any kind, `None` when it does not exist
    async fn get_object(
        &self,
        api_version: &str,
        kind: &str,
        name: &str,
        namespace: &str,
    ) -> Result<Option<DynamicObject>, Error>;

    /// Apply a JSON merge patch to an object of any kind
    async fn patch_object(
        &self,
        api_version: &str,
        kind: &str,
        name: &str,
        namespace: &str,
        patch: &serde_json::Value,
    ) -> Result<(), Error>;

    /// Apply a JSON merge patch to the status subresource of an object
    async fn patch_object_status(
        &self,
        api_version: &str,
        kind: &str,
        name: &str,
        namespace: &str,
        patch: &serde_json::Value,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Resolve the ApiResource for an apiVersion/kind pair.
    ///
    /// Asks the API server for the exact plural; falls back to local
    /// pluralization when discovery fails (e.g. the CRD was just installed).
    async fn api_resource(&self, api_version: &str, kind: &str) -> ApiResource {
        let (group, version) = parse_api_version(api_version);
        let gvk = GroupVersionKind::gvk(group, version, kind);
        match kube::discovery::pinned_kind(&self.client, &gvk).await {
            Ok((ar, _caps)) => ar,
            Err(e) => {
                debug!(
                    api_version = %api_version,
                    kind = %kind,
                    error = %e,
                    "Resource not found in discovery, using fallback pluralization"
                );
                ApiResource {
                    group: group.to_string(),
                    version: version.to_string(),
                    api_version: api_version.to_string(),
                    kind: kind.to_string(),
                    plural: pluralize_kind(kind),
                }
            }
        }
    }

    async fn dynamic_api(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
    ) -> Api<DynamicObject> {
        let ar = self.api_resource(api_version, kind).await;
        Api::namespaced_with(self.client.clone(), namespace, &ar)
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_secrets(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let list = api
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(list.items)
    }

    async fn apply_secret(&self, secret: &Secret) -> Result<(), Error> {
        let name = secret
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::validation("secret has no name"))?;
        let namespace = secret
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| Error::validation("secret has no namespace"))?;

        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(secret),
        )
        .await?;
        Ok(())
    }

    async fn get_service(&self, name: &str, namespace: &str) -> Result<Option<Service>, Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_service(&self, service: &Service) -> Result<(), Error> {
        let namespace = service.metadata.namespace.as_deref().unwrap_or("default");
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), service).await?;
        Ok(())
    }

    async fn delete_pvc(&self, name: &str, namespace: &str) -> Result<(), Error> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_object(
        &self,
        api_version: &str,
        kind: &str,
        name: &str,
        namespace: &str,
    ) -> Result<Option<DynamicObject>, Error> {
        let api = self.dynamic_api(api_version, kind, namespace).await;
        Ok(api.get_opt(name).await?)
    }

    async fn patch_object(
        &self,
        api_version: &str,
        kind: &str,
        name: &str,
        namespace: &str,
        patch: &serde_json::Value,
    ) -> Result<(), Error> {
        let api = self.dynamic_api(api_version, kind, namespace).await;
        api.patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn patch_object_status(
        &self,
        api_version: &str,
        kind: &str,
        name: &str,
        namespace: &str,
        patch: &serde_json::Value,
    ) -> Result<(), Error> {
        let api = self.dynamic_api(api_version, kind, namespace).await;
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }
}

/// Whether the Cluster API `Cluster` kind is served by the host cluster
///
/// Checked once at startup; the answer decides whether the controller waits
/// for Cluster owner references and patches infrastructure clusters.
pub async fn cluster_kind_exists(client: &Client) -> Result<bool, Error> {
    match client
        .list_api_group_resources("cluster.x-k8s.io/v1beta1")
        .await
    {
        Ok(list) => Ok(list.resources.iter().any(|r| r.kind == "Cluster")),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Parse API version into group and version components
fn parse_api_version(api_version: &str) -> (&str, &str) {
    if let Some(idx) = api_version.rfind('/') {
        (&api_version[..idx], &api_version[idx + 1..])
    } else {
        // Core API (e.g., "v1")
        ("", api_version)
    }
}

/// Plurals that do not follow the simple rules below
const KIND_PLURALS: &[(&str, &str)] = &[
    ("cluster", "clusters"),
    ("vcluster", "vclusters"),
    ("openstackcluster", "openstackclusters"),
    ("kubevirtcluster", "kubevirtclusters"),
    ("nutanixcluster", "nutanixclusters"),
    ("packetcluster", "packetclusters"),
    ("dockercluster", "dockerclusters"),
];

/// Convert a Kind to its plural form for Kubernetes API resources.
fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();

    for (singular, plural) in KIND_PLURALS {
        if *singular == lower {
            return (*plural).to_string();
        }
    }

    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}
