//! Control plane endpoint discovery
//!
//! When the user leaves `spec.controlPlaneEndpoint.host` empty the controller
//! looks at the Service fronting the virtual cluster. A LoadBalancer Service is
//! waited on until it has an address; anything else falls back to the
//! in-cluster DNS name.

use std::time::Duration;

use k8s_openapi::api::core::v1::Service;
use tracing::{debug, info};

use crate::controller::KubeClient;
use crate::kube_utils::poll_until;
use crate::Result;

/// Time between Service lookups
pub const DISCOVERY_INTERVAL: Duration = Duration::from_secs(2);
/// Total time to wait for a load balancer address
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of inspecting the Service once
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceAddress {
    /// Lookup is finished; `None` means use the fallback host
    Resolved(Option<String>),
    /// LoadBalancer without an address yet
    Pending,
}

/// Read the externally reachable address from a Service
///
/// Ingress entries are scanned in order; within an entry an IP is preferred
/// over a hostname.
pub fn service_address(service: &Service) -> ServiceAddress {
    let is_load_balancer = service
        .spec
        .as_ref()
        .and_then(|s| s.type_.as_deref())
        .is_some_and(|t| t == "LoadBalancer");
    if !is_load_balancer {
        return ServiceAddress::Resolved(None);
    }

    let ingress = service
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_deref())
        .unwrap_or_default();

    ingress
        .iter()
        .find_map(|entry| {
            entry
                .ip
                .as_deref()
                .filter(|ip| !ip.is_empty())
                .or_else(|| entry.hostname.as_deref().filter(|h| !h.is_empty()))
        })
        .map(|host| ServiceAddress::Resolved(Some(host.to_string())))
        .unwrap_or(ServiceAddress::Pending)
}

/// Host used when no external address exists
pub fn fallback_host(name: &str, namespace: &str) -> String {
    format!("{name}.{namespace}")
}

/// Discover the host for the virtual cluster's Service.
///
/// Returns `Ok(None)` when the Service is missing or not a LoadBalancer.
/// Errors with a not-ready error when the load balancer gets no address within
/// [`DISCOVERY_TIMEOUT`].
pub async fn discover_host(
    kube: &dyn KubeClient,
    name: &str,
    namespace: &str,
) -> Result<Option<String>> {
    let host = poll_until(
        DISCOVERY_TIMEOUT,
        DISCOVERY_INTERVAL,
        format!("timed out waiting for load balancer address of service {namespace}/{name}"),
        move || async move {
            let Some(service) = kube.get_service(name, namespace).await? else {
                debug!(service = %name, "vcluster service not found, using fallback host");
                return Ok(Some(None));
            };
            match service_address(&service) {
                ServiceAddress::Resolved(host) => Ok(Some(host)),
                ServiceAddress::Pending => {
                    debug!(service = %name, "waiting for load balancer address");
                    Ok(None)
                }
            }
        },
    )
    .await?;

    if let Some(ref h) = host {
        info!(service = %name, host = %h, "discovered control plane host");
    }
    Ok(host)
}

/// Discover the host, falling back to `<name>.<namespace>`
pub async fn resolve_host(kube: &dyn KubeClient, name: &str, namespace: &str) -> Result<String> {
    Ok(discover_host(kube, name, namespace)
        .await?
        .unwrap_or_else(|| fallback_host(name, namespace)))
}
