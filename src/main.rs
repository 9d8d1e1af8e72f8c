//! vcluster operator - runs nested Kubernetes control planes as Cluster API providers

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vcluster_operator::config::ControllerConfig;
use vcluster_operator::controller::{cluster_kind_exists, error_policy, reconcile, Context};
use vcluster_operator::crd::{ControlPlaneVCluster, VCluster};
use vcluster_operator::helm::HelmCli;

/// vcluster operator - reconciles VCluster resources into Helm-deployed virtual clusters
#[derive(Parser, Debug)]
#[command(name = "vcluster-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    ///
    /// Watches both VCluster kinds and reconciles them.
    Controller(ControllerArgs),
}

/// Controller mode arguments
#[derive(Parser, Debug, Default)]
struct ControllerArgs {
    #[command(flatten)]
    config: ControllerConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // reqwest and kube both pick up the process-wide provider
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install crypto provider: {:?}. \
             The operator cannot talk to the virtual clusters without a working TLS implementation.",
            e
        );
        std::process::exit(1);
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        for crd in [VCluster::crd(), ControlPlaneVCluster::crd()] {
            let yaml = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    let args = match cli.command {
        Some(Commands::Controller(args)) => args,
        None => ControllerArgs::default(),
    };
    run_controller(args.config).await
}

/// Run both virtual cluster controllers until a shutdown signal arrives
async fn run_controller(config: ControllerConfig) -> anyhow::Result<()> {
    tracing::info!("vcluster operator starting...");

    let kube_config = kube::Config::infer()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load kubeconfig: {}", e))?;
    let client = Client::try_from(kube_config.clone())
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let helm = HelmCli::from_config(&config.helm_binary, &kube_config)
        .map_err(|e| anyhow::anyhow!("Failed to prepare helm: {}", e))?
        .with_timeout(Duration::from_secs(config.helm_timeout_secs));

    let cluster_kind = cluster_kind_exists(&client)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to discover Cluster API kinds: {}", e))?;
    tracing::info!(cluster_kind_exists = cluster_kind, "Cluster API discovery done");

    let ctx = Arc::new(
        Context::builder(client.clone(), Arc::new(helm))
            .config(config)
            .cluster_kind_exists(cluster_kind)
            .build(),
    );

    let vclusters: Api<VCluster> = Api::all(client.clone());
    let control_planes: Api<ControlPlaneVCluster> = Api::all(client);

    tracing::info!("Starting VCluster controllers...");

    let infrastructure_controller = Controller::new(vclusters, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile::<VCluster>, error_policy::<VCluster>, ctx.clone())
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "VCluster reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "VCluster reconciliation error");
                }
            }
        });

    let control_plane_controller = Controller::new(control_planes, WatcherConfig::default())
        .shutdown_on_signal()
        .run(
            reconcile::<ControlPlaneVCluster>,
            error_policy::<ControlPlaneVCluster>,
            ctx,
        )
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "Control plane VCluster reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Control plane VCluster reconciliation error");
                }
            }
        });

    // Both controllers stop together on the shutdown signal
    futures::join!(infrastructure_controller, control_plane_controller);

    tracing::info!("vcluster operator shutting down");
    Ok(())
}
