//! Probes against the nested control plane
//!
//! Two checks reach into the virtual cluster: a one-off initialization probe
//! that reads the `default/default` ServiceAccount, and the `/readyz` check
//! run on every pass. Both are bounded by [`PROBE_TIMEOUT`].

use std::time::{Duration, Instant};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ServiceAccount;
use kube::config::KubeConfigOptions;
use kube::{Api, Client};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::crd::ApiEndpoint;
use crate::kubeconfig::{server_url, VirtualClusterAccess};
use crate::Error;

/// Upper bound for a single probe
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Body the API server returns from `/readyz` when healthy
const READY_BODY: &[u8] = b"ok";

/// Checks run against a virtual cluster's API server
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ControlPlaneProbe: Send + Sync {
    /// Succeeds once the API server serves the `default` ServiceAccount.
    ///
    /// Any failure is reported as not ready.
    async fn service_account_ready(&self, access: &VirtualClusterAccess) -> Result<(), Error>;

    /// GET `/readyz` on the endpoint using the access credentials.
    ///
    /// A response other than `ok` is `Ok(false)`; only transport failures are
    /// errors.
    async fn readyz(
        &self,
        access: &VirtualClusterAccess,
        endpoint: &ApiEndpoint,
    ) -> Result<bool, Error>;
}

/// URL of the readiness endpoint
pub fn readyz_url(endpoint: &ApiEndpoint) -> String {
    format!("{}/readyz", server_url(&endpoint.host, endpoint.port))
}

/// Whether a `/readyz` body reports a healthy API server
pub fn is_ready_body(body: &[u8]) -> bool {
    body == READY_BODY
}

/// [`ControlPlaneProbe`] talking to the real API server
#[derive(Debug, Default, Clone)]
pub struct HttpsProbe;

impl HttpsProbe {
    fn http_client(access: &VirtualClusterAccess) -> Result<reqwest::Client, Error> {
        let mut pem = access.credentials.client_certificate.clone();
        if !pem.ends_with(b"\n") {
            pem.push(b'\n');
        }
        pem.extend_from_slice(&access.credentials.client_key);
        let identity = reqwest::Identity::from_pem(&pem)
            .map_err(|e| Error::kubeconfig(format!("invalid client certificate: {e}")))?;

        reqwest::Client::builder()
            .identity(identity)
            .danger_accept_invalid_certs(access.accept_invalid_certs)
            .timeout(PROBE_TIMEOUT)
            .build()
            .map_err(|e| Error::internal_with_context("build readiness client", e.to_string()))
    }
}

#[async_trait]
impl ControlPlaneProbe for HttpsProbe {
    async fn service_account_ready(&self, access: &VirtualClusterAccess) -> Result<(), Error> {
        let config =
            kube::Config::from_custom_kubeconfig(access.to_kubeconfig()?, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::kubeconfig(format!("invalid virtual cluster config: {e}")))?;
        let client = Client::try_from(config)?;
        let api: Api<ServiceAccount> = Api::namespaced(client, "default");

        match tokio::time::timeout(PROBE_TIMEOUT, api.get("default")).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(Error::not_ready(format!(
                "virtual cluster API server at {} is not serving: {e}",
                access.server
            ))),
            Err(_) => Err(Error::not_ready(format!(
                "virtual cluster API server at {} did not answer within {}s",
                access.server,
                PROBE_TIMEOUT.as_secs()
            ))),
        }
    }

    async fn readyz(
        &self,
        access: &VirtualClusterAccess,
        endpoint: &ApiEndpoint,
    ) -> Result<bool, Error> {
        let client = Self::http_client(access)?;
        let url = readyz_url(endpoint);
        let started = Instant::now();

        let result = async {
            let response = client.get(&url).send().await?;
            response.bytes().await
        }
        .await;
        debug!(url = %url, duration = ?started.elapsed(), "ready check done");

        let body = result.map_err(|e| Error::not_ready(format!("readiness check failed: {e}")))?;
        Ok(is_ready_body(&body))
    }
}
