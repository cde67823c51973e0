//! Port forwarding for ready services
//!
//! Provides [`PortForwardManager`], which opens one local tunnel per
//! configured port of a service and announces each bound port on the
//! handshake as `FORWARD <service>:<remote>:<local>`.

use futures::future::try_join_all;
use k8s_openapi::api::core::v1::Endpoints;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::ClusterClient;
use crate::protocol::{Handshake, ProtocolError};

/// Error type for port forwarding operations
#[derive(Debug, thiserror::Error)]
pub enum PortForwardError {
    #[error("Failed to get endpoints for service '{service}': {reason}")]
    Endpoints { service: String, reason: String },

    #[error("Service '{0}' has no address backed by a pod")]
    NoBackingPod(String),

    #[error("Failed to forward {service}:{port} via pod '{pod}': {reason}")]
    Tunnel {
        service: String,
        port: u16,
        pod: String,
        reason: String,
    },

    #[error("Port forward for service '{0}' cancelled")]
    Cancelled(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Pod chosen to carry a service's tunnels
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackingPod {
    pub namespace: String,
    pub name: String,
}

/// First pod-backed address of the first non-empty subset
///
/// Addresses without a namespace on their target reference are assumed to
/// live in `default_namespace`.
pub fn backing_pod(endpoints: &Endpoints, default_namespace: &str) -> Option<BackingPod> {
    endpoints
        .subsets
        .as_deref()
        .unwrap_or_default()
        .iter()
        .filter_map(|subset| subset.addresses.as_deref())
        .filter(|addresses| !addresses.is_empty())
        .find_map(|addresses| {
            addresses.iter().find_map(|address| {
                let target = address.target_ref.as_ref()?;
                if target.kind.as_deref().is_some_and(|kind| kind != "Pod") {
                    return None;
                }
                Some(BackingPod {
                    namespace: target
                        .namespace
                        .clone()
                        .unwrap_or_else(|| default_namespace.to_string()),
                    name: target.name.clone()?,
                })
            })
        })
}

/// One open tunnel
#[derive(Debug)]
pub struct PortForwardSession {
    pub service: String,
    pub remote_port: u16,
    pub local_port: u16,
    pub backing_pod: BackingPod,
    lifetime: CancellationToken,
    task: JoinHandle<()>,
}

/// Opens and owns the tunnels of every forwarded service
///
/// Sessions live until [`close`](Self::close) or until the lifetime token
/// passed to [`forward_service`](Self::forward_service) is cancelled. They
/// are not restarted if the backing pod goes away.
pub struct PortForwardManager {
    cluster: Arc<dyn ClusterClient>,
    namespace: String,
    handshake: Arc<Handshake>,
    sessions: Vec<PortForwardSession>,
}

impl PortForwardManager {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        namespace: impl Into<String>,
        handshake: Arc<Handshake>,
    ) -> Self {
        Self {
            cluster,
            namespace: namespace.into(),
            handshake,
            sessions: Vec::new(),
        }
    }

    /// Forward every port of a service through one backing pod
    ///
    /// All ports are opened concurrently and the call returns once each
    /// tunnel is ready and announced. Any failure closes the tunnels this
    /// call already opened and fails the whole call.
    pub async fn forward_service(
        &mut self,
        service: &str,
        ports: &[u16],
        lifetime: &CancellationToken,
    ) -> Result<&[PortForwardSession], PortForwardError> {
        let endpoints = self
            .cluster
            .get_endpoints(&self.namespace, service)
            .await
            .map_err(|e| PortForwardError::Endpoints {
                service: service.to_string(),
                reason: e.to_string(),
            })?;

        let pod = backing_pod(&endpoints, &self.namespace)
            .ok_or_else(|| PortForwardError::NoBackingPod(service.to_string()))?;

        debug!(
            service = %service,
            pod = %pod.name,
            ports = ?ports,
            "Opening port forwards"
        );

        let call = lifetime.child_token();
        let opens = ports
            .iter()
            .map(|&port| self.open_one(service, port, &pod, call.child_token()));

        let result = tokio::select! {
            biased;
            () = lifetime.cancelled() => Err(PortForwardError::Cancelled(service.to_string())),
            opened = try_join_all(opens) => opened,
        };

        match result {
            Ok(opened) => {
                let first = self.sessions.len();
                self.sessions.extend(opened);
                Ok(&self.sessions[first..])
            }
            Err(e) => {
                call.cancel();
                Err(e)
            }
        }
    }

    async fn open_one(
        &self,
        service: &str,
        port: u16,
        pod: &BackingPod,
        lifetime: CancellationToken,
    ) -> Result<PortForwardSession, PortForwardError> {
        let tunnel = self
            .cluster
            .open_port_forward(&pod.namespace, &pod.name, port, lifetime.clone())
            .await
            .map_err(|e| PortForwardError::Tunnel {
                service: service.to_string(),
                port,
                pod: pod.name.clone(),
                reason: e.to_string(),
            })?;

        let local_port = tunnel.local_port();
        let session = PortForwardSession {
            service: service.to_string(),
            remote_port: port,
            local_port,
            backing_pod: pod.clone(),
            lifetime: lifetime.clone(),
            task: tunnel.into_task(),
        };

        if let Err(e) = self.handshake.forward(service, port, local_port).await {
            lifetime.cancel();
            return Err(e.into());
        }

        info!(
            service = %service,
            remote_port = port,
            local_port = local_port,
            pod = %pod.name,
            "Port forward ready"
        );

        Ok(session)
    }

    /// Open sessions, in the order they were announced
    pub fn sessions(&self) -> &[PortForwardSession] {
        &self.sessions
    }

    /// Local port bound for `service:remote_port`
    pub fn local_port(&self, service: &str, remote_port: u16) -> Option<u16> {
        self.sessions
            .iter()
            .find(|s| s.service == service && s.remote_port == remote_port)
            .map(|s| s.local_port)
    }

    /// Close every tunnel, aborting any that outlive `grace`
    pub async fn close(&mut self, grace: Duration) {
        for session in &self.sessions {
            session.lifetime.cancel();
        }

        for mut session in self.sessions.drain(..) {
            if tokio::time::timeout(grace, &mut session.task).await.is_err() {
                warn!(
                    service = %session.service,
                    remote_port = session.remote_port,
                    "Port forward did not close in time, aborting"
                );
                session.task.abort();
            } else {
                debug!(
                    service = %session.service,
                    remote_port = session.remote_port,
                    "Port forward closed"
                );
            }
        }
    }
}
