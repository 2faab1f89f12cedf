//! Supernetes controller binary

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use supernetes_common::config::{self, ControllerConfig};
use supernetes_common::telemetry;
use supernetes_controller::certificates::CsrApprover;
use supernetes_controller::endpoint::{Callbacks, Endpoint};
use supernetes_controller::environment::Environment;
use supernetes_controller::node::{NodeReconciler, NodeReconcilerConfig};
use supernetes_controller::reconciler::Reconciler;
use supernetes_controller::tracker::Tracker;
use supernetes_controller::util;
use supernetes_controller::workload::{WorkloadReconciler, WorkloadReconcilerConfig};

/// Supernetes controller - exposes HPC compute as virtual Kubernetes nodes
#[derive(Parser, Debug)]
#[command(name = "supernetes-controller", version, about, long_about = None)]
struct Cli {
    /// Path to the controller configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Log level directive
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Disable kubelet HTTP authentication (OpenShift/OKD mode)
    #[arg(long)]
    disable_kubelet_auth: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    telemetry::init(Some(&cli.log_level));

    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        anyhow::bail!("failed to install crypto provider: {e:?}");
    }

    info!(path = %cli.config.display(), "reading configuration file");
    let config_bytes = std::fs::read(&cli.config)?;
    let config: ControllerConfig = config::decode(&config_bytes)?;

    let environment = Environment::load();
    let kube_client = kube::Client::try_default().await?;

    // Keep kube-proxy off the virtual nodes; not having the permission to
    // patch it is tolerable, the taint still protects the nodes
    if let Err(e) = util::disable_kube_proxy(&kube_client).await {
        warn!(error = %e, "patching kube-proxy DaemonSet failed");
    }

    let token = CancellationToken::new();

    // Auto-approve our own kubelet serving certificates, when identity
    // permits
    match CsrApprover::new(kube_client.clone(), &environment) {
        Ok(approver) => {
            let approver_token = token.child_token();
            tokio::spawn(async move {
                if let Err(e) = approver.run(approver_token).await {
                    error!(error = %e, "failed to run CSR approver");
                }
            });
        }
        Err(e) => warn!(error = %e, "CSR approver disabled"),
    }

    let endpoint = Arc::new(Endpoint::serve(&config).await?);
    let tracker = Tracker::new();

    let node_reconciler = NodeReconciler::new(NodeReconcilerConfig {
        node_client: endpoint.node(),
        workload_client: endpoint.workload(),
        tracker: tracker.clone(),
        kube_client: kube_client.clone(),
        environment,
        disable_kubelet_auth: cli.disable_kubelet_auth,
    })
    .await?;

    let workload_reconciler = WorkloadReconciler::new(WorkloadReconcilerConfig {
        workload_client: endpoint.workload(),
        status_updater: node_reconciler.clone(),
        tracker,
        kube_client,
    });

    let reconcile = &config.reconcile;
    let node_loop = Arc::new(Reconciler::new(
        token.clone(),
        "node",
        reconcile.node_interval(),
        node_reconciler,
    )?);
    let workload_loop = Arc::new(Reconciler::new(
        token.clone(),
        "workload",
        reconcile.workload_interval(),
        workload_reconciler,
    )?);

    // Reconciliation follows the tunnel: start on connect, wind down when
    // the last agent disappears
    let start_loops = (node_loop.clone(), workload_loop.clone());
    let stop_loops = (node_loop.clone(), workload_loop.clone());
    endpoint.set_callbacks(Callbacks {
        on_connected: Arc::new(move || {
            info!("agent connected, starting reconciliation");
            let (node_loop, workload_loop) = start_loops.clone();
            tokio::spawn(async move {
                node_loop.start().await;
                workload_loop.start().await;
            });
        }),
        on_idle: Arc::new(move || {
            info!("endpoint idle, stopping reconciliation");
            let (node_loop, workload_loop) = stop_loops.clone();
            tokio::spawn(async move {
                node_loop.stop().await;
                workload_loop.stop().await;
            });
        }),
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    token.cancel();
    node_loop.stop().await;
    workload_loop.stop().await;
    endpoint.close().await;

    Ok(())
}
