//! `kube`-backed cluster client

use async_trait::async_trait;
use futures::{AsyncBufRead, AsyncBufReadExt, Stream, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{Endpoints, Namespace, Pod};
use kube::api::{Api, DeleteParams, LogParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::watcher;
use kube::runtime::WatchStreamExt;
use kube::{Client, Config};
use std::path::Path;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{improve_error_message, ClusterClient, ClusterError, LogLines, Tunnel, WatchStream};
use crate::tail::TailTarget;

/// Lines buffered between the HTTP log body and a tail session
const LOG_LINE_BUFFER: usize = 256;

/// Cluster client talking to a real API server
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    /// Wrap an existing client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using an explicit kubeconfig, or kube's default inference
    ///
    /// Without a path this honors `KUBECONFIG`, then `~/.kube/config`, then
    /// the in-cluster service account.
    pub async fn connect(kubeconfig: Option<&Path>) -> Result<Self, ClusterError> {
        let client = match kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    ClusterError::ClientError(format!("{}: {e}", path.display()))
                })?;
                let config =
                    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                        .await
                        .map_err(|e| {
                            ClusterError::ClientError(format!("{}: {e}", path.display()))
                        })?;
                Client::try_from(config).map_err(|e| ClusterError::ClientError(e.to_string()))?
            }
            None => Client::try_default()
                .await
                .map_err(|e| ClusterError::ClientError(e.to_string()))?,
        };

        debug!(
            default_namespace = %client.default_namespace(),
            "Connected to Kubernetes API"
        );

        Ok(Self::new(client))
    }

    fn watch<K>(&self, namespace: &str) -> WatchStream<K>
    where
        K: kube::Resource<Scope = kube::core::NamespaceResourceScope>
            + Clone
            + serde::de::DeserializeOwned
            + std::fmt::Debug
            + Send
            + 'static,
        <K as kube::Resource>::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);

        debug!(
            namespace = %namespace,
            kind = %K::kind(&Default::default()),
            "Starting watch"
        );

        watcher::watcher(api, watcher::Config::default())
            .default_backoff()
            .map_err(|e| ClusterError::WatchError(e.to_string()))
            .boxed()
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    fn watch_pods(&self, namespace: &str) -> WatchStream<Pod> {
        self.watch::<Pod>(namespace)
    }

    fn watch_endpoints(&self, namespace: &str) -> WatchStream<Endpoints> {
        self.watch::<Endpoints>(namespace)
    }

    async fn get_endpoints(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<Endpoints, ClusterError> {
        let endpoints: Api<Endpoints> = Api::namespaced(self.client.clone(), namespace);
        endpoints
            .get(service)
            .await
            .map_err(|e| ClusterError::GetError(improve_error_message(&e, "Endpoints", service)))
    }

    async fn open_log_stream(&self, target: &TailTarget) -> Result<LogLines, ClusterError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &target.namespace);
        let params = LogParams {
            follow: true,
            timestamps: true,
            container: Some(target.container.clone()),
            ..Default::default()
        };

        debug!(
            namespace = %target.namespace,
            pod = %target.pod,
            container = %target.container,
            "Starting log stream"
        );

        // The log body is pumped by its own task so the returned stream owns
        // nothing borrowed from the Api handle.
        let (line_tx, line_rx) = mpsc::channel(LOG_LINE_BUFFER);
        let (opened_tx, opened_rx) = oneshot::channel();
        let pod = target.pod.clone();

        tokio::spawn(async move {
            let reader = match pods.log_stream(&pod, &params).await {
                Ok(reader) => {
                    let _ = opened_tx.send(Ok(()));
                    reader
                }
                Err(e) => {
                    let _ = opened_tx.send(Err(improve_error_message(&e, "Pod", &pod)));
                    return;
                }
            };

            let mut lines = Box::pin(lossy_lines(Box::pin(reader)));
            loop {
                tokio::select! {
                    () = line_tx.closed() => break,
                    line = lines.next() => match line {
                        Some(line) => {
                            if line_tx.send(line).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        match opened_rx.await {
            Ok(Ok(())) => Ok(futures::stream::unfold(line_rx, |mut rx| async move {
                rx.recv().await.map(|line| (line, rx))
            })
            .boxed()),
            Ok(Err(message)) => Err(ClusterError::LogsError(message)),
            Err(_) => Err(ClusterError::LogsError(format!(
                "log stream for '{}' ended before it opened",
                target.pod
            ))),
        }
    }

    async fn open_port_forward(
        &self,
        namespace: &str,
        pod: &str,
        remote_port: u16,
        lifetime: CancellationToken,
    ) -> Result<Tunnel, ClusterError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Tunnel::listen(pods, pod, remote_port, lifetime).await
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), ClusterError> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());

        namespaces
            .delete(name, &DeleteParams::background())
            .await
            .map_err(|e| ClusterError::CleanupError(improve_error_message(&e, "Namespace", name)))?;

        info!(namespace = %name, "Deleted namespace");

        Ok(())
    }
}

/// Split a log body into lines, replacing invalid UTF-8 instead of failing
fn lossy_lines<R>(reader: R) -> impl Stream<Item = std::io::Result<String>>
where
    R: AsyncBufRead + Unpin,
{
    futures::stream::try_unfold(reader, |mut reader| async move {
        let mut buf = Vec::new();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            return Ok(None);
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
        }
        Ok::<_, std::io::Error>(Some((String::from_utf8_lossy(&buf).into_owned(), reader)))
    })
}
