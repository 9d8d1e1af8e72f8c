//! Controller configuration
//!
//! Everything is settable by flag or environment variable so the operator can
//! be configured from a Deployment manifest alone.

use std::path::PathBuf;

use clap::Args;

use crate::helm::{ChartDefaults, DEFAULT_HELM_TIMEOUT};

/// Settings shared by both virtual cluster controllers
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Path to the helm binary
    #[arg(long, env = "HELM_BINARY", default_value = "helm")]
    pub helm_binary: PathBuf,

    /// Directory searched for pre-fetched `<chart>-<version>.tgz` archives
    #[arg(long, env = "VCLUSTER_CHARTS_DIR", default_value = ".")]
    pub charts_dir: PathBuf,

    /// Chart deployed when a resource does not name one
    #[arg(long, env = "DEFAULT_VCLUSTER_CHART_NAME", default_value = "vcluster")]
    pub default_chart_name: String,

    /// Repository used when a resource does not name one
    #[arg(
        long,
        env = "DEFAULT_VCLUSTER_CHART_REPO",
        default_value = "https://charts.loft.sh"
    )]
    pub default_chart_repo: String,

    /// Discover the host service CIDR and pass it to the chart as `serviceCIDR`
    #[arg(long, env = "DISCOVER_SERVICE_CIDR")]
    pub discover_service_cidr: bool,

    /// Namespace the service CIDR probe runs in
    #[arg(long, env = "POD_NAMESPACE", default_value = "default")]
    pub cidr_probe_namespace: String,

    /// Seconds a single helm invocation may run before it is killed
    #[arg(long, env = "HELM_TIMEOUT_SECONDS", default_value_t = 600)]
    pub helm_timeout_secs: u64,
}

impl ControllerConfig {
    /// Chart defaults derived from this configuration
    pub fn chart_defaults(&self) -> ChartDefaults {
        ChartDefaults {
            name: self.default_chart_name.clone(),
            repo: self.default_chart_repo.clone(),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        let chart = ChartDefaults::default();
        Self {
            helm_binary: PathBuf::from("helm"),
            charts_dir: PathBuf::from("."),
            default_chart_name: chart.name,
            default_chart_repo: chart.repo,
            discover_service_cidr: false,
            cidr_probe_namespace: "default".to_string(),
            helm_timeout_secs: DEFAULT_HELM_TIMEOUT.as_secs(),
        }
    }
}
