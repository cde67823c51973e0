//! Cluster access for the sidecar
//!
//! Everything the coordinator needs from the Kubernetes control plane goes
//! through [`ClusterClient`]:
//! - list-and-watch streams for pods and endpoints
//! - follow-mode log streams
//! - port-forward tunnels
//! - namespace deletion
//!
//! [`KubeCluster`] is the `kube`-backed implementation.

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::{Endpoints, Pod};
use kube::runtime::watcher::Event;
use tokio_util::sync::CancellationToken;

use crate::tail::TailTarget;

mod kubernetes;
mod tunnel;

pub use kubernetes::KubeCluster;
pub use tunnel::Tunnel;

/// Errors from cluster operations
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("Failed to create Kubernetes client: {0}")]
    ClientError(String),

    #[error("Watch error: {0}")]
    WatchError(String),

    #[error("Failed to get resource: {0}")]
    GetError(String),

    #[error("Failed to open log stream: {0}")]
    LogsError(String),

    #[error("Failed to open port forward: {0}")]
    PortForwardError(String),

    #[error("Failed to delete namespace: {0}")]
    CleanupError(String),
}

/// Snapshot-then-changes stream for one resource kind in one namespace
pub type WatchStream<K> = BoxStream<'static, Result<Event<K>, ClusterError>>;

/// Line stream of a single container's log
pub type LogLines = BoxStream<'static, Result<String, std::io::Error>>;

/// What the sidecar consumes from the orchestration control plane
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Watch pods in a namespace, starting with a full list
    fn watch_pods(&self, namespace: &str) -> WatchStream<Pod>;

    /// Watch service endpoints in a namespace, starting with a full list
    fn watch_endpoints(&self, namespace: &str) -> WatchStream<Endpoints>;

    /// Fetch the current endpoints of a service
    async fn get_endpoints(&self, namespace: &str, service: &str)
        -> Result<Endpoints, ClusterError>;

    /// Open a follow-mode, timestamped log stream for one container
    async fn open_log_stream(&self, target: &TailTarget) -> Result<LogLines, ClusterError>;

    /// Open a tunnel from an ephemeral local port to `remote_port` in a pod
    ///
    /// Returns once the tunnel is ready to accept connections. The tunnel
    /// stays up until `lifetime` is cancelled.
    async fn open_port_forward(
        &self,
        namespace: &str,
        pod: &str,
        remote_port: u16,
        lifetime: CancellationToken,
    ) -> Result<Tunnel, ClusterError>;

    /// Delete a namespace with background propagation
    async fn delete_namespace(&self, name: &str) -> Result<(), ClusterError>;
}

/// Turn a kube error into a message naming the resource involved
///
/// Recognizes the usual API failures (not found, forbidden, unreachable
/// API server) and falls back to the raw error with a resource prefix.
pub(crate) fn improve_error_message(
    err: &kube::Error,
    resource_kind: &str,
    resource_name: &str,
) -> String {
    let raw = err.to_string();

    if raw.contains("NotFound") || raw.contains("404") {
        return format!("{resource_kind} '{resource_name}' not found in namespace");
    }

    if raw.contains("Forbidden") || raw.contains("403") {
        return format!("{resource_kind} '{resource_name}': permission denied (check RBAC)");
    }

    if raw.contains("connection refused") || raw.contains("ECONNREFUSED") {
        return format!("{resource_kind} '{resource_name}': cannot connect to Kubernetes API");
    }

    if raw.contains("timeout") || raw.contains("deadline exceeded") {
        return format!("{resource_kind} '{resource_name}': operation timed out");
    }

    format!("{resource_kind} '{resource_name}': {raw}")
}
