//! Host service CIDR discovery
//!
//! Kubernetes does not expose the service CIDR through its API. Creating a
//! Service with a cluster IP outside the range is rejected with a message that
//! names the valid range, which is parsed here. The create never succeeds on a
//! correctly configured cluster, so the probe leaves nothing behind.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::controller::KubeClient;
use crate::{Error, Result};

/// Cluster IP outside any sane service range
pub const PROBE_CLUSTER_IP: &str = "4.4.4.4";

const RANGE_MARKER: &str = "The range of valid IPs is ";

/// Extract the CIDR from an API server rejection message
pub fn parse_service_cidr(message: &str) -> Option<String> {
    let idx = message.find(RANGE_MARKER)?;
    let rest = message[idx + RANGE_MARKER.len()..].trim();
    let cidr = rest
        .split(|c: char| c.is_whitespace() || c == '"' || c == ',')
        .next()
        .unwrap_or_default()
        .trim_end_matches([':', '.', ';']);
    (!cidr.is_empty()).then(|| cidr.to_string())
}

/// Message of the API server rejection, without the error chain around it
fn rejection_message(error: Error) -> String {
    match error {
        Error::Kube(kube::Error::Api(response)) => response.message,
        other => other.to_string(),
    }
}

fn probe_service(namespace: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            generate_name: Some("test-service-".to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                "app.kubernetes.io/managed-by".to_string(),
                "vcluster-operator".to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some(PROBE_CLUSTER_IP.to_string()),
            ports: Some(vec![ServicePort {
                port: 80,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Lazily discovered service CIDR, shared by all reconciliations
///
/// The lock is held across the probe so concurrent passes wait for the first
/// one instead of probing in parallel.
#[derive(Debug, Default)]
pub struct ServiceCidrCache {
    cidr: Mutex<Option<String>>,
}

impl ServiceCidrCache {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn with_value(cidr: impl Into<String>) -> Self {
        Self {
            cidr: Mutex::new(Some(cidr.into())),
        }
    }

    /// Cached CIDR, probing the API server on first use
    pub async fn get_or_discover(&self, kube: &dyn KubeClient, namespace: &str) -> Result<String> {
        let mut guard = self.cidr.lock().await;
        if let Some(cidr) = guard.as_ref() {
            return Ok(cidr.clone());
        }

        let message = match kube.create_service(&probe_service(namespace)).await {
            Ok(()) => {
                warn!(namespace = %namespace, "service CIDR probe was accepted by the API server");
                return Err(Error::internal_with_context(
                    "discover service cidr",
                    "couldn't find cluster service cidr",
                ));
            }
            Err(e) => rejection_message(e),
        };

        let cidr = parse_service_cidr(&message).ok_or_else(|| {
            Error::internal_with_context(
                "discover service cidr",
                format!("couldn't find cluster service cidr ({message})"),
            )
        })?;
        info!(cidr = %cidr, "discovered host service CIDR");
        *guard = Some(cidr.clone());
        Ok(cidr)
    }
}
