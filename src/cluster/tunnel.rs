//! Local port tunnels into pods
//!
//! A tunnel is a loopback listener on an ephemeral port. Every accepted
//! connection gets its own pod port-forward stream, and bytes are copied
//! both ways until either side closes.
//!
//! A tunnel only counts as ready once one port-forward stream to the pod
//! has been established, so a missing pod or a denied forward fails
//! `listen` instead of the first client connection.

use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::ClusterError;

/// A ready port-forward tunnel
///
/// The local address is fixed when the listener binds and never changes.
/// The accept loop runs in `task` until the tunnel's lifetime token is
/// cancelled.
#[derive(Debug)]
pub struct Tunnel {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl Tunnel {
    /// Wrap an already-running tunnel task
    pub fn new(local_addr: SocketAddr, task: JoinHandle<()>) -> Self {
        Self { local_addr, task }
    }

    /// Bind a loopback listener and start forwarding to `pod_name:remote_port`
    pub(crate) async fn listen(
        pods: Api<Pod>,
        pod_name: &str,
        remote_port: u16,
        lifetime: CancellationToken,
    ) -> Result<Self, ClusterError> {
        check_stream(&pods, pod_name, remote_port).await?;

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .map_err(|e| ClusterError::PortForwardError(format!("bind local port: {e}")))?;

        let local_addr = listener
            .local_addr()
            .map_err(|e| ClusterError::PortForwardError(format!("read local port: {e}")))?;

        debug!(
            local_addr = %local_addr,
            pod = %pod_name,
            remote_port = %remote_port,
            "Port forward bound to local address"
        );

        let pod_name = pod_name.to_string();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = lifetime.cancelled() => {
                        debug!(pod = %pod_name, remote_port = %remote_port, "Port forward shutdown requested");
                        break;
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((local_stream, peer)) => {
                            debug!(peer = %peer, pod = %pod_name, "Accepted tunnel connection");
                            tokio::spawn(proxy_connection(
                                pods.clone(),
                                pod_name.clone(),
                                remote_port,
                                local_stream,
                                lifetime.child_token(),
                            ));
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                        }
                    },
                }
            }
        });

        Ok(Self { local_addr, task })
    }

    /// Local port the tunnel listens on
    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Handle of the accept loop, for joining on shutdown
    pub fn into_task(self) -> JoinHandle<()> {
        self.task
    }
}

/// Open one port-forward stream to the pod and close it again
async fn check_stream(
    pods: &Api<Pod>,
    pod_name: &str,
    remote_port: u16,
) -> Result<(), ClusterError> {
    let mut forwarder = pods.portforward(pod_name, &[remote_port]).await.map_err(|e| {
        ClusterError::PortForwardError(format!("pod '{pod_name}' port {remote_port}: {e}"))
    })?;

    let stream = forwarder.take_stream(remote_port);
    forwarder.abort();
    if stream.is_none() {
        return Err(ClusterError::PortForwardError(format!(
            "pod '{pod_name}' returned no stream for port {remote_port}"
        )));
    }

    debug!(pod = %pod_name, remote_port = %remote_port, "Port forward stream established");
    Ok(())
}

async fn proxy_connection(
    pods: Api<Pod>,
    pod_name: String,
    remote_port: u16,
    mut local_stream: TcpStream,
    lifetime: CancellationToken,
) {
    let mut forwarder = match pods.portforward(&pod_name, &[remote_port]).await {
        Ok(forwarder) => forwarder,
        Err(e) => {
            warn!(error = %e, pod = %pod_name, "Failed to establish port forward stream");
            return;
        }
    };

    let Some(mut upstream) = forwarder.take_stream(remote_port) else {
        warn!(pod = %pod_name, remote_port = %remote_port, "Port forward returned no stream");
        return;
    };

    tokio::select! {
        () = lifetime.cancelled() => {}
        copied = tokio::io::copy_bidirectional(&mut local_stream, &mut upstream) => {
            match copied {
                Ok((sent, received)) => debug!(sent, received, pod = %pod_name, "Tunnel connection closed"),
                Err(e) => warn!(error = %e, pod = %pod_name, "Error copying between tunnel and pod"),
            }
        }
    }
}
