//! it-sidecar - readiness gate for Kubernetes integration tests
//!
//! The sidecar runs next to a test suite. It waits until the requested
//! apps have ready pods and the requested services have endpoints, forwards
//! each configured service port to an ephemeral local port, and tells the
//! parent on stdout:
//!
//! ```text
//! FORWARD frontend:8080:40321
//! READY
//! ```
//!
//! Meanwhile it tails every running container's log to stderr. Closing its
//! stdin (or a signal, or the overall timeout) shuts it down; the namespace
//! can be deleted on the way out.
//!
//! # Example (Rust)
//!
//! ```no_run
//! use it_sidecar::{ClusterClient, Coordinator, Handshake, KubeCluster, SidecarConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SidecarConfig::new("it-1234")
//!         .wait_for_app("backend")
//!         .port_forward("frontend:8080".parse()?);
//!
//!     let cluster: Arc<dyn ClusterClient> = Arc::new(KubeCluster::connect(None).await?);
//!     let (tail_tx, _tail_rx) = tokio::sync::mpsc::unbounded_channel();
//!
//!     let coordinator = Coordinator::new(config, cluster, Arc::new(Handshake::stdout()), tail_tx);
//!     coordinator.shutdown().spawn_parent_watch(tokio::io::stdin());
//!     coordinator.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! # CLI Usage
//!
//! ```bash
//! it-sidecar --namespace=it-1234 --timeout=2m --delete_namespace \
//!     --waitforapp=backend --portforward=frontend:8080
//! ```

pub mod cli;
pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod endpoints;
pub mod harness;
pub mod portforward;
pub mod protocol;
pub mod readiness;
pub mod shutdown;
pub mod tail;
pub mod telemetry;
pub mod wait;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use cluster::{ClusterClient, ClusterError, KubeCluster, Tunnel};
pub use config::{ConfigError, PortForwardSpec, SidecarConfig, TailConfig};
pub use coordinator::{Coordinator, Phase, SidecarError};
pub use endpoints::EndpointTracker;
pub use harness::{HarnessConfig, HarnessError, SidecarProcess};
pub use portforward::{PortForwardError, PortForwardManager};
pub use protocol::{Emission, Handshake, ProtocolError};
pub use readiness::AppReadinessTracker;
pub use shutdown::{Shutdown, ShutdownReason};
pub use tail::{ContainerState, LogTailer, TailFilter, TailOutput, TailTarget};
pub use wait::{ReadinessError, WaitTarget, WaitTimeout};
