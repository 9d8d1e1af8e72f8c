//! Helm deployment driver
//!
//! Virtual clusters are deployed as Helm releases. [`HelmClient`] is the seam
//! the reconciler talks to; [`HelmCli`] implements it by running the `helm`
//! binary with a throwaway kubeconfig for the host cluster.

mod release;
mod values;

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::{debug, error, info};

#[cfg(test)]
use mockall::automock;

use crate::crd::HelmRelease;
use crate::kube_utils::poll_until;
use crate::Error;

pub use release::{decode_release, latest_release, Release, ReleaseRecord, RELEASE_OWNER_LABEL};
pub use values::{merge_values, render_values, resolve_values, ValueSource};

#[cfg(test)]
pub(crate) use release::tests::release_secret;

/// Output helm prints when the release does not exist
const RELEASE_NOT_FOUND: &str = "release: not found";

/// How long to wait for a freshly written temp file to become visible
const TEMP_FILE_WAIT: Duration = Duration::from_secs(60);
const TEMP_FILE_POLL: Duration = Duration::from_millis(50);

/// Upper bound on a single helm invocation
pub const DEFAULT_HELM_TIMEOUT: Duration = Duration::from_secs(600);

/// Options for installing or upgrading a chart
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UpgradeOptions {
    /// Chart name in the repository
    pub chart: String,
    /// Local chart archive; takes precedence over `chart`
    pub path: Option<PathBuf>,
    /// Repository URL, required with `chart`
    pub repo: String,
    /// Chart version, empty for latest
    pub version: String,
    /// Values document passed with `--values`
    pub values: String,
    /// Values passed with `--set`
    pub set_values: BTreeMap<String, String>,
    /// Values passed with `--set-string`
    pub set_string_values: BTreeMap<String, String>,
    /// Repository username
    pub username: Option<String>,
    /// Repository password
    pub password: Option<String>,
    /// Roll back on failure
    pub atomic: bool,
    /// Force resource updates
    pub force: bool,
    /// Create the release namespace
    pub create_namespace: bool,
    /// Skip TLS verification of the chart repository
    pub insecure_skip_tls_verify: bool,
    /// Extra arguments appended verbatim
    pub extra_args: Vec<String>,
}

/// Helm operations needed to manage a virtual cluster release
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HelmClient: Send + Sync {
    /// Install a release
    async fn install(
        &self,
        name: &str,
        namespace: &str,
        options: &UpgradeOptions,
    ) -> Result<(), Error>;

    /// Upgrade a release, installing it when missing
    async fn upgrade(
        &self,
        name: &str,
        namespace: &str,
        options: &UpgradeOptions,
    ) -> Result<(), Error>;

    /// Delete a release; a missing release is not an error
    async fn delete(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// Whether a release exists
    async fn exists(&self, name: &str, namespace: &str) -> Result<bool, Error>;
}

/// Chart name and repository used when the resource does not set them
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChartDefaults {
    /// Default chart name
    pub name: String,
    /// Default repository URL
    pub repo: String,
}

impl Default for ChartDefaults {
    fn default() -> Self {
        Self {
            name: "vcluster".to_string(),
            repo: "https://charts.loft.sh".to_string(),
        }
    }
}

/// Fully resolved chart identity
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChartRef {
    /// Chart name
    pub name: String,
    /// Repository URL
    pub repo: String,
    /// Version without a leading `v`
    pub version: String,
}

impl ChartRef {
    /// Resolve the chart from the resource, filling in defaults.
    ///
    /// The version has no default; an empty version is rejected.
    pub fn resolve(release: Option<&HelmRelease>, defaults: &ChartDefaults) -> Result<Self, Error> {
        let chart = release.map(|r| &r.chart);
        let pick = |value: Option<&String>, default: &str| {
            value
                .filter(|v| !v.is_empty())
                .cloned()
                .unwrap_or_else(|| default.to_string())
        };

        let name = pick(chart.map(|c| &c.name), &defaults.name);
        let repo = pick(chart.map(|c| &c.repo), &defaults.repo);
        let version = chart.map(|c| c.version.as_str()).unwrap_or_default();
        let version = version.strip_prefix('v').unwrap_or(version);
        if version.is_empty() {
            return Err(Error::validation(
                "empty version field: spec.helmRelease.chart.version is required",
            ));
        }

        Ok(Self {
            name,
            repo,
            version: version.to_string(),
        })
    }

    /// Path of a pre-fetched archive for this chart inside `charts_dir`
    pub fn local_archive(&self, charts_dir: &Path) -> PathBuf {
        charts_dir.join(format!("{}-{}.tgz", self.name, self.version))
    }

    /// Upgrade options pointing at this chart, preferring a local archive
    pub fn upgrade_options(&self, charts_dir: &Path, values: String) -> UpgradeOptions {
        let archive = self.local_archive(charts_dir);
        if archive.is_file() {
            UpgradeOptions {
                path: Some(archive),
                values,
                ..Default::default()
            }
        } else {
            UpgradeOptions {
                chart: self.name.clone(),
                repo: self.repo.clone(),
                version: self.version.clone(),
                values,
                ..Default::default()
            }
        }
    }
}

/// Build the argument list for `helm install` / `helm upgrade`
pub fn upgrade_args(
    command: &str,
    name: &str,
    namespace: &str,
    options: &UpgradeOptions,
    kubeconfig: &Path,
    values_file: Option<&Path>,
) -> Result<Vec<String>, Error> {
    let mut args = vec![command.to_string(), name.to_string()];

    if let Some(path) = &options.path {
        args.push(path.display().to_string());
    } else if !options.chart.is_empty() {
        if options.repo.is_empty() {
            return Err(Error::validation("chart repo cannot be empty"));
        }
        args.push(options.chart.clone());
        args.extend(["--repo".to_string(), options.repo.clone()]);
        if !options.version.is_empty() {
            args.extend(["--version".to_string(), options.version.clone()]);
        }
        if let Some(username) = &options.username {
            args.extend(["--username".to_string(), username.clone()]);
        }
        if let Some(password) = &options.password {
            args.extend(["--password".to_string(), password.clone()]);
        }
    }

    args.extend([
        "--kubeconfig".to_string(),
        kubeconfig.display().to_string(),
        "--namespace".to_string(),
        namespace.to_string(),
    ]);
    if command == "upgrade" {
        args.push("--install".to_string());
    }
    args.extend(options.extra_args.iter().cloned());
    if options.create_namespace {
        args.push("--create-namespace".to_string());
    }
    if let Some(values_file) = values_file {
        args.extend(["--values".to_string(), values_file.display().to_string()]);
    }
    if !options.set_values.is_empty() {
        args.extend(["--set".to_string(), join_set(&options.set_values)]);
    }
    if !options.set_string_values.is_empty() {
        args.extend(["--set-string".to_string(), join_set(&options.set_string_values)]);
    }
    if options.force {
        args.push("--force".to_string());
    }
    if options.atomic {
        args.push("--atomic".to_string());
    }
    if options.insecure_skip_tls_verify {
        args.push("--insecure-skip-tls-verify".to_string());
    }
    Ok(args)
}

fn join_set(values: &BTreeMap<String, String>) -> String {
    values
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Render a kubeconfig for the host cluster from the controller's client config
pub fn host_kubeconfig(config: &kube::Config) -> Result<String, Error> {
    let mut cluster = serde_json::json!({
        "server": config.cluster_url.to_string(),
    });
    if config.accept_invalid_certs {
        cluster["insecure-skip-tls-verify"] = serde_json::Value::Bool(true);
    }
    if let Some(certs) = &config.root_cert {
        let pem: String = certs.iter().map(|der| der_to_pem(der)).collect();
        cluster["certificate-authority-data"] = serde_json::Value::String(BASE64.encode(pem));
    }
    if let Some(server_name) = &config.tls_server_name {
        cluster["tls-server-name"] = serde_json::Value::String(server_name.clone());
    }

    let doc = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{"name": "host", "cluster": cluster}],
        "users": [{"name": "host", "user": serde_json::to_value(&config.auth_info)?}],
        "contexts": [{
            "name": "host",
            "context": {
                "cluster": "host",
                "user": "host",
                "namespace": config.default_namespace,
            }
        }],
        "current-context": "host",
    });
    Ok(serde_yaml::to_string(&doc)?)
}

fn der_to_pem(der: &[u8]) -> String {
    let encoded = BASE64.encode(der);
    let mut pem = String::from("-----BEGIN CERTIFICATE-----\n");
    for chunk in encoded.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(chunk));
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE-----\n");
    pem
}

/// [`HelmClient`] backed by the helm binary
pub struct HelmCli {
    helm_path: PathBuf,
    kubeconfig: String,
    timeout: Duration,
}

impl HelmCli {
    /// Create a driver running `helm_path` against the cluster in `kubeconfig`
    pub fn new(helm_path: impl Into<PathBuf>, kubeconfig: impl Into<String>) -> Self {
        Self {
            helm_path: helm_path.into(),
            kubeconfig: kubeconfig.into(),
            timeout: DEFAULT_HELM_TIMEOUT,
        }
    }

    /// Kill helm invocations that run longer than `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Create a driver for the cluster the given client config points at
    pub fn from_config(helm_path: impl Into<PathBuf>, config: &kube::Config) -> Result<Self, Error> {
        Ok(Self::new(helm_path, host_kubeconfig(config)?))
    }

    async fn write_temp(&self, contents: &str) -> Result<NamedTempFile, Error> {
        let mut file = tempfile::Builder::new()
            .prefix("vcluster-helm-")
            .tempfile()
            .map_err(|e| Error::internal_with_context("create temp file", e.to_string()))?;
        file.write_all(contents.as_bytes())
            .and_then(|_| file.flush())
            .map_err(|e| Error::internal_with_context("write temp file", e.to_string()))?;

        let path = file.path().to_path_buf();
        poll_until(
            TEMP_FILE_WAIT,
            TEMP_FILE_POLL,
            format!("temp file {} did not appear", path.display()),
            || {
                let path = path.clone();
                async move {
                    let exists = tokio::fs::try_exists(&path).await.map_err(|e| {
                        Error::internal_with_context("stat temp file", e.to_string())
                    })?;
                    Ok(exists.then_some(()))
                }
            },
        )
        .await?;
        Ok(file)
    }

    /// Run helm; returns combined output on success
    ///
    /// The child is killed when it outlives the timeout.
    async fn exec(&self, args: &[String]) -> Result<String, Error> {
        let command = args.first().map(String::as_str).unwrap_or_default();
        debug!(command = %command, "running helm");
        let child = Command::new(&self.helm_path)
            .args(args)
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| Error::helm(format!("helm {command} timed out after {:?}", self.timeout)))?
            .map_err(|e| Error::helm(format!("failed to run {}: {e}", self.helm_path.display())))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if output.status.success() {
            Ok(combined)
        } else {
            Err(Error::helm(format!(
                "error executing helm {command}: {}",
                combined.trim()
            )))
        }
    }

    async fn run(
        &self,
        command: &str,
        name: &str,
        namespace: &str,
        options: &UpgradeOptions,
    ) -> Result<(), Error> {
        let kubeconfig = self.write_temp(&self.kubeconfig).await?;
        let values = if options.values.is_empty() {
            None
        } else {
            Some(self.write_temp(&options.values).await?)
        };

        let args = upgrade_args(
            command,
            name,
            namespace,
            options,
            kubeconfig.path(),
            values.as_ref().map(NamedTempFile::path),
        )?;
        match self.exec(&args).await {
            Ok(_) => Ok(()),
            Err(e) => {
                error!(release = %name, namespace = %namespace, error = %e, "helm {command} failed");
                Err(e)
            }
        }
    }
}

#[async_trait]
impl HelmClient for HelmCli {
    async fn install(
        &self,
        name: &str,
        namespace: &str,
        options: &UpgradeOptions,
    ) -> Result<(), Error> {
        self.run("install", name, namespace, options).await
    }

    async fn upgrade(
        &self,
        name: &str,
        namespace: &str,
        options: &UpgradeOptions,
    ) -> Result<(), Error> {
        self.run("upgrade", name, namespace, options).await
    }

    async fn delete(&self, name: &str, namespace: &str) -> Result<(), Error> {
        let kubeconfig = self.write_temp(&self.kubeconfig).await?;
        let args = vec![
            "delete".to_string(),
            name.to_string(),
            "--namespace".to_string(),
            namespace.to_string(),
            "--kubeconfig".to_string(),
            kubeconfig.path().display().to_string(),
        ];
        match self.exec(&args).await {
            Ok(_) => {
                info!(release = %name, namespace = %namespace, "deleted helm release");
                Ok(())
            }
            Err(e) if e.to_string().contains(RELEASE_NOT_FOUND) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn exists(&self, name: &str, namespace: &str) -> Result<bool, Error> {
        let kubeconfig = self.write_temp(&self.kubeconfig).await?;
        let args = vec![
            "status".to_string(),
            name.to_string(),
            "--namespace".to_string(),
            namespace.to_string(),
            "--kubeconfig".to_string(),
            kubeconfig.path().display().to_string(),
        ];
        match self.exec(&args).await {
            Ok(_) => Ok(true),
            Err(e) if e.to_string().contains(RELEASE_NOT_FOUND) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
