//! Kubeconfig handling for virtual clusters
//!
//! The virtual cluster writes its own admin kubeconfig into a bootstrap secret.
//! This module reads that document, pulls the client certificate out of it and
//! rewrites the server URL to the externally visible endpoint before it is
//! republished under the name Cluster API expects.
//!
//! The document is handled as an untyped YAML tree so fields this operator does
//! not know about pass through unchanged.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::config::Kubeconfig;
use serde_yaml::Value;

use crate::{Error, Result};

/// Prefix of the secret the virtual cluster writes its kubeconfig into
pub const BOOTSTRAP_SECRET_PREFIX: &str = "vc-";
/// Data key holding the bootstrap kubeconfig
pub const BOOTSTRAP_SECRET_KEY: &str = "config";
/// Data key of the published kubeconfig secret
pub const KUBECONFIG_SECRET_KEY: &str = "value";
/// Secret type used by Cluster API for cluster credentials
pub const CLUSTER_SECRET_TYPE: &str = "cluster.x-k8s.io/secret";
/// Label tying secrets to their Cluster API cluster
pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";
/// TLS certificate key in the published CA secret
pub const TLS_CRT_KEY: &str = "tls.crt";
/// TLS private key key in the published CA secret
pub const TLS_KEY_KEY: &str = "tls.key";
/// CA certificate key in the virtual cluster certs secret
pub const CA_CRT_KEY: &str = "ca.crt";
/// CA private key key in the virtual cluster certs secret
pub const CA_KEY_KEY: &str = "ca.key";
/// Port used when the endpoint does not specify one
pub const DEFAULT_CONTROL_PLANE_PORT: i32 = 443;

/// Name of the bootstrap kubeconfig secret for a virtual cluster
pub fn bootstrap_secret_name(name: &str) -> String {
    format!("{BOOTSTRAP_SECRET_PREFIX}{name}")
}

/// Name of the published kubeconfig secret
pub fn kubeconfig_secret_name(logical_name: &str) -> String {
    format!("{logical_name}-kubeconfig")
}

/// Name of the certs secret written by the virtual cluster
pub fn certs_secret_name(name: &str) -> String {
    format!("{name}-certs")
}

/// Name of the published CA secret
pub fn ca_secret_name(logical_name: &str) -> String {
    format!("{logical_name}-ca")
}

/// In-cluster address of the virtual cluster API server
pub fn in_cluster_server(name: &str, namespace: &str) -> String {
    format!("https://{name}.{namespace}:{DEFAULT_CONTROL_PLANE_PORT}")
}

/// `https://host:port`, keeping an explicit https scheme on `host`
pub fn server_url(host: &str, port: i32) -> String {
    let port = if port == 0 {
        DEFAULT_CONTROL_PLANE_PORT
    } else {
        port
    };
    let addr = format!("{host}:{port}");
    if addr.starts_with("https://") {
        addr
    } else {
        format!("https://{addr}")
    }
}

/// Client certificate and key used to talk to the virtual cluster
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// PEM encoded client certificate
    pub client_certificate: Vec<u8>,
    /// PEM encoded client key
    pub client_key: Vec<u8>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("client_certificate", &format!("{} bytes", self.client_certificate.len()))
            .field("client_key", &"<redacted>")
            .finish()
    }
}

/// Kubeconfig document written by the virtual cluster at bootstrap
#[derive(Clone, Debug, PartialEq)]
pub struct BootstrapKubeconfig {
    doc: Value,
}

impl BootstrapKubeconfig {
    /// Read the document out of the bootstrap secret
    pub fn from_secret(secret: &Secret) -> Result<Self> {
        let name = secret.metadata.name.as_deref().unwrap_or_default();
        let raw = secret
            .data
            .as_ref()
            .and_then(|d| d.get(BOOTSTRAP_SECRET_KEY))
            .ok_or_else(|| {
                Error::kubeconfig(format!(
                    "secret {name} has no '{BOOTSTRAP_SECRET_KEY}' key"
                ))
            })?;
        Self::parse(&raw.0)
    }

    /// Parse a kubeconfig document
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let doc: Value = serde_yaml::from_slice(raw)
            .map_err(|e| Error::kubeconfig(format!("failed to parse kubeconfig: {e}")))?;
        if !doc.is_mapping() {
            return Err(Error::kubeconfig("kubeconfig is not a mapping"));
        }
        Ok(Self { doc })
    }

    fn clusters(&self) -> &[Value] {
        self.doc
            .get("clusters")
            .and_then(Value::as_sequence)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Number of cluster entries
    pub fn cluster_count(&self) -> usize {
        self.clusters().len()
    }

    /// Reject documents that do not name exactly one cluster
    pub fn ensure_single_cluster(&self) -> Result<()> {
        match self.cluster_count() {
            1 => Ok(()),
            n => Err(Error::kubeconfig(format!(
                "unexpected kube config: expected 1 cluster, found {n}"
            ))),
        }
    }

    /// Server URLs of all cluster entries
    pub fn servers(&self) -> Vec<String> {
        self.clusters()
            .iter()
            .filter_map(|c| c.get("cluster")?.get("server")?.as_str())
            .map(str::to_string)
            .collect()
    }

    /// First user entry that carries both client certificate and key data
    pub fn credentials(&self) -> Result<Credentials> {
        let users = self
            .doc
            .get("users")
            .and_then(Value::as_sequence)
            .map(Vec::as_slice)
            .unwrap_or_default();

        for entry in users {
            let Some(user) = entry.get("user") else {
                continue;
            };
            let cert = user.get("client-certificate-data").and_then(Value::as_str);
            let key = user.get("client-key-data").and_then(Value::as_str);
            if let (Some(cert), Some(key)) = (cert, key) {
                return Ok(Credentials {
                    client_certificate: decode_field("client-certificate-data", cert)?,
                    client_key: decode_field("client-key-data", key)?,
                });
            }
        }

        Err(Error::kubeconfig(
            "kubeconfig has no user with client-certificate-data and client-key-data",
        ))
    }

    /// Point every cluster entry at `server`
    pub fn rewrite_server(&mut self, server: &str) {
        let Some(clusters) = self
            .doc
            .get_mut("clusters")
            .and_then(Value::as_sequence_mut)
        else {
            return;
        };
        for entry in clusters {
            if let Some(cluster) = entry.get_mut("cluster").and_then(Value::as_mapping_mut) {
                cluster.insert(
                    Value::String("server".to_string()),
                    Value::String(server.to_string()),
                );
            }
        }
    }

    /// Serialize the document
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.doc)?)
    }
}

fn decode_field(field: &str, data: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(data.trim())
        .map_err(|e| Error::kubeconfig(format!("{field} is not valid base64: {e}")))
}

/// Everything needed to open a connection to a virtual cluster
#[derive(Clone, Debug)]
pub struct VirtualClusterAccess {
    /// API server URL
    pub server: String,
    /// Client certificate and key
    pub credentials: Credentials,
    /// Skip server certificate verification
    pub accept_invalid_certs: bool,
}

impl VirtualClusterAccess {
    /// Access through the in-cluster Service of the virtual cluster
    pub fn in_cluster(name: &str, namespace: &str, credentials: Credentials) -> Self {
        Self {
            server: in_cluster_server(name, namespace),
            credentials,
            accept_invalid_certs: true,
        }
    }

    /// Render as a kubeconfig usable by kube-rs
    pub fn to_kubeconfig(&self) -> Result<Kubeconfig> {
        let doc = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Config",
            "clusters": [{
                "name": "vcluster",
                "cluster": {
                    "server": self.server,
                    "insecure-skip-tls-verify": self.accept_invalid_certs,
                }
            }],
            "users": [{
                "name": "vcluster",
                "user": {
                    "client-certificate-data": BASE64.encode(&self.credentials.client_certificate),
                    "client-key-data": BASE64.encode(&self.credentials.client_key),
                }
            }],
            "contexts": [{
                "name": "vcluster",
                "context": {"cluster": "vcluster", "user": "vcluster"}
            }],
            "current-context": "vcluster",
        });
        Ok(serde_json::from_value(doc)?)
    }
}

/// Kubeconfig secret in the format Cluster API consumes
pub fn kubeconfig_secret(logical_name: &str, namespace: &str, kubeconfig: &str) -> Secret {
    Secret {
        metadata: secret_meta(kubeconfig_secret_name(logical_name), logical_name, namespace),
        type_: Some(CLUSTER_SECRET_TYPE.to_string()),
        data: Some(BTreeMap::from([(
            KUBECONFIG_SECRET_KEY.to_string(),
            ByteString(kubeconfig.as_bytes().to_vec()),
        )])),
        ..Default::default()
    }
}

/// CA secret built from the virtual cluster certs secret
pub fn ca_secret(logical_name: &str, namespace: &str, certs: &Secret) -> Result<Secret> {
    let certs_name = certs.metadata.name.as_deref().unwrap_or_default();
    let data = certs.data.as_ref();
    let field = |key: &str| {
        data.and_then(|d| d.get(key)).cloned().ok_or_else(|| {
            Error::internal_with_context(
                "build ca secret",
                format!("secret {certs_name} has no '{key}' key"),
            )
        })
    };

    Ok(Secret {
        metadata: secret_meta(ca_secret_name(logical_name), logical_name, namespace),
        data: Some(BTreeMap::from([
            (TLS_CRT_KEY.to_string(), field(CA_CRT_KEY)?),
            (TLS_KEY_KEY.to_string(), field(CA_KEY_KEY)?),
        ])),
        ..Default::default()
    })
}

fn secret_meta(name: String, logical_name: &str, namespace: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: Some(namespace.to_string()),
        labels: Some(BTreeMap::from([(
            CLUSTER_NAME_LABEL.to_string(),
            logical_name.to_string(),
        )])),
        ..Default::default()
    }
}
