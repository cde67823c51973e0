//! The sidecar's control loop
//!
//! ```text
//! Init -> WaitingForApps -> WaitingForServices -> Ready -> Draining -> Terminated
//! ```
//!
//! Apps are awaited before services, every FORWARD line is written before
//! READY, and draining (log tails, tunnels, namespace deletion) runs on
//! every exit path.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::cluster::{ClusterClient, ClusterError};
use crate::config::{ConfigError, SidecarConfig};
use crate::endpoints::EndpointTracker;
use crate::portforward::PortForwardManager;
use crate::protocol::{Handshake, ProtocolError};
use crate::readiness::AppReadinessTracker;
use crate::shutdown::Shutdown;
use crate::tail::{LogTailer, TailOutput, DEFAULT_TAIL_GRACE};
use crate::wait::ReadinessError;

/// Where the control loop is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    WaitingForApps,
    WaitingForServices,
    Ready,
    Draining,
    Terminated,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            Phase::Init => "init",
            Phase::WaitingForApps => "waiting for apps",
            Phase::WaitingForServices => "waiting for services",
            Phase::Ready => "ready",
            Phase::Draining => "draining",
            Phase::Terminated => "terminated",
        };
        f.write_str(phase)
    }
}

/// Everything that makes the sidecar exit non-zero
#[derive(Debug, thiserror::Error)]
pub enum SidecarError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Readiness(#[from] ReadinessError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl SidecarError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            SidecarError::Config(_) => 2,
            _ => 1,
        }
    }
}

/// Drives one sidecar run from startup to cleanup
pub struct Coordinator {
    config: SidecarConfig,
    cluster: Arc<dyn ClusterClient>,
    handshake: Arc<Handshake>,
    shutdown: Shutdown,
    tail_output: mpsc::UnboundedSender<TailOutput>,
    grace: Duration,
    phase: watch::Sender<Phase>,
}

impl Coordinator {
    pub fn new(
        config: SidecarConfig,
        cluster: Arc<dyn ClusterClient>,
        handshake: Arc<Handshake>,
        tail_output: mpsc::UnboundedSender<TailOutput>,
    ) -> Self {
        let shutdown = Shutdown::new(config.timeout);
        let (phase, _) = watch::channel(Phase::Init);
        Self {
            config,
            cluster,
            handshake,
            shutdown,
            tail_output,
            grace: DEFAULT_TAIL_GRACE,
            phase,
        }
    }

    /// Set how long tails and tunnels get to close while draining
    pub fn grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Handle for installing cancellation triggers
    pub fn shutdown(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Follow phase changes
    pub fn phases(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    fn enter(&self, phase: Phase) {
        info!(phase = %phase, "Sidecar phase");
        self.phase.send_replace(phase);
    }

    /// Run until cancelled or failed, then drain
    ///
    /// Returns `Ok` only if READY was emitted; cancellation after that is a
    /// clean shutdown.
    pub async fn run(self) -> Result<(), SidecarError> {
        let filter = self.config.validate()?;

        info!(
            namespace = %self.config.namespace,
            timeout = ?self.config.timeout,
            apps = ?self.config.wait_for_apps,
            port_forwards = ?self.config.port_forwards,
            "Starting sidecar"
        );

        let deadline = self.shutdown.spawn_deadline();

        let tail_token = self.shutdown.token().child_token();
        let tailer = LogTailer::new(
            Arc::clone(&self.cluster),
            self.config.namespace.clone(),
            filter,
            self.tail_output.clone(),
        )
        .grace(self.grace);
        let tail_task = tokio::spawn(tailer.run(tail_token.clone()));

        let mut forwards = PortForwardManager::new(
            Arc::clone(&self.cluster),
            self.config.namespace.clone(),
            Arc::clone(&self.handshake),
        );

        let result = self.drive(&mut forwards).await;
        if let Err(e) = &result {
            error!(error = %e, "Sidecar failed");
        }

        self.enter(Phase::Draining);
        deadline.abort();
        tail_token.cancel();
        let abort = tail_task.abort_handle();
        if tokio::time::timeout(self.grace * 2, tail_task).await.is_err() {
            warn!("Log tailer did not stop in time, aborting");
            abort.abort();
        }
        forwards.close(self.grace).await;
        self.cleanup().await;

        self.enter(Phase::Terminated);
        result
    }

    async fn drive(&self, forwards: &mut PortForwardManager) -> Result<(), SidecarError> {
        let namespace = &self.config.namespace;

        if !self.config.wait_for_apps.is_empty() {
            self.enter(Phase::WaitingForApps);
            let mut apps = AppReadinessTracker::new(self.config.wait_for_apps.iter().cloned());
            apps.wait(self.cluster.watch_pods(namespace), &self.shutdown)
                .await?;
        }

        if !self.config.port_forwards.is_empty() {
            self.enter(Phase::WaitingForServices);
            let mut services = EndpointTracker::new(self.config.port_forwards.clone());
            services
                .wait(self.cluster.watch_endpoints(namespace), forwards, &self.shutdown)
                .await?;
        }

        self.enter(Phase::Ready);
        self.handshake.ready().await?;
        info!(forwards = forwards.sessions().len(), "Sidecar ready");

        self.shutdown.cancelled().await;
        if let Some(reason) = self.shutdown.reason() {
            info!(reason = %reason, "Stopping after ready");
        }
        Ok(())
    }

    async fn cleanup(&self) {
        if !self.config.delete_namespace {
            return;
        }

        info!(namespace = %self.config.namespace, "Deleting namespace");
        if let Err(e) = self.cluster.delete_namespace(&self.config.namespace).await {
            warn!(namespace = %self.config.namespace, error = %e, "Cleanup failed");
        }
    }
}
