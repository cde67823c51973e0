use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::error;

use it_sidecar::cli::Cli;
use it_sidecar::tail::print_tail_output;
use it_sidecar::telemetry::init_logging;
use it_sidecar::{ClusterClient, Coordinator, Handshake, KubeCluster, SidecarError};

#[tokio::main]
async fn main() {
    init_logging();

    let code = match run(Cli::parse()).await {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "Sidecar exiting with error");
            e.exit_code()
        }
    };

    // The stdin reader runs on a blocking thread that cannot be cancelled,
    // so leave without waiting for the runtime to shut down.
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), SidecarError> {
    let config = cli.into_config();
    config.validate()?;

    let cluster: Arc<dyn ClusterClient> =
        Arc::new(KubeCluster::connect(config.kubeconfig.as_deref()).await?);

    let (tail_tx, tail_rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_tail_output(tail_rx, tokio::io::stderr()));

    let coordinator = Coordinator::new(config, cluster, Arc::new(Handshake::stdout()), tail_tx);
    let shutdown = coordinator.shutdown();
    shutdown.spawn_signal_watch();
    shutdown.spawn_parent_watch(tokio::io::stdin());

    let result = coordinator.run().await;
    let _ = tokio::time::timeout(Duration::from_secs(1), printer).await;
    result
}
