//! In-memory cluster for unit tests
//!
//! Watch streams replay every event pushed so far and then follow new
//! pushes, so tests can push before or after a component subscribes.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateRunning, ContainerStateWaiting, ContainerStatus, EndpointAddress,
    EndpointSubset, Endpoints, ObjectReference, Pod, PodCondition, PodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::watcher::Event;
use kube::ResourceExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cluster::{ClusterClient, ClusterError, LogLines, Tunnel, WatchStream};
use crate::tail::TailTarget;

type Feed<K> = mpsc::UnboundedSender<Result<Event<K>, ClusterError>>;

struct Channel<K> {
    history: Vec<Result<Event<K>, String>>,
    subscribers: Vec<Feed<K>>,
}

impl<K: Clone + Send + 'static> Channel<K> {
    fn new() -> Self {
        Self {
            history: Vec::new(),
            subscribers: Vec::new(),
        }
    }

    fn push(&mut self, item: Result<Event<K>, String>) {
        self.subscribers
            .retain(|tx| tx.send(replay(&item)).is_ok());
        self.history.push(item);
    }

    fn subscribe(&mut self) -> WatchStream<K> {
        let (tx, rx) = mpsc::unbounded_channel();
        for item in &self.history {
            let _ = tx.send(replay(item));
        }
        self.subscribers.push(tx);
        receiver_stream(rx)
    }
}

fn replay<K: Clone>(item: &Result<Event<K>, String>) -> Result<Event<K>, ClusterError> {
    item.clone().map_err(ClusterError::WatchError)
}

fn receiver_stream<T: Send + 'static>(rx: mpsc::UnboundedReceiver<T>) -> BoxStream<'static, T> {
    futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
        .boxed()
}

#[derive(Default)]
struct Logs {
    opens: HashMap<String, usize>,
    feeds: HashMap<String, mpsc::UnboundedSender<Result<String, std::io::Error>>>,
    failing: HashSet<String>,
}

pub(crate) struct FakeCluster {
    pods: Mutex<Channel<Pod>>,
    endpoints: Mutex<Channel<Endpoints>>,
    current_endpoints: Mutex<BTreeMap<String, Endpoints>>,
    logs: Mutex<Logs>,
    next_port: AtomicU16,
    forwards: Mutex<Vec<(String, u16)>>,
    failing_port: Mutex<Option<u16>>,
    deleted: Mutex<Vec<String>>,
    fail_delete: Mutex<bool>,
}

impl FakeCluster {
    pub(crate) fn new() -> Self {
        Self {
            pods: Mutex::new(Channel::new()),
            endpoints: Mutex::new(Channel::new()),
            current_endpoints: Mutex::new(BTreeMap::new()),
            logs: Mutex::new(Logs::default()),
            next_port: AtomicU16::new(40000),
            forwards: Mutex::new(Vec::new()),
            failing_port: Mutex::new(None),
            deleted: Mutex::new(Vec::new()),
            fail_delete: Mutex::new(false),
        }
    }

    pub(crate) fn push_pod(&self, event: Event<Pod>) {
        self.pods.lock().unwrap().push(Ok(event));
    }

    pub(crate) fn push_pod_error(&self, message: &str) {
        self.pods.lock().unwrap().push(Err(message.to_string()));
    }

    /// Push an endpoints event; applied objects also become what
    /// `get_endpoints` returns
    pub(crate) fn push_endpoints(&self, event: Event<Endpoints>) {
        {
            let mut current = self.current_endpoints.lock().unwrap();
            match &event {
                Event::Apply(ep) | Event::InitApply(ep) => {
                    current.insert(ep.name_any(), ep.clone());
                }
                Event::Delete(ep) => {
                    current.remove(&ep.name_any());
                }
                Event::Init | Event::InitDone => {}
            }
        }
        self.endpoints.lock().unwrap().push(Ok(event));
    }

    pub(crate) fn push_log(&self, id: &str, line: &str) {
        if let Some(feed) = self.logs.lock().unwrap().feeds.get(id) {
            let _ = feed.send(Ok(line.to_string()));
        }
    }

    pub(crate) fn log_opens(&self, id: &str) -> usize {
        self.logs.lock().unwrap().opens.get(id).copied().unwrap_or(0)
    }

    pub(crate) fn fail_logs_for(&self, id: &str) {
        self.logs.lock().unwrap().failing.insert(id.to_string());
    }

    pub(crate) fn fail_forward_port(&self, port: u16) {
        *self.failing_port.lock().unwrap() = Some(port);
    }

    /// `(pod, remote_port)` of every tunnel opened so far
    pub(crate) fn forward_calls(&self) -> Vec<(String, u16)> {
        self.forwards.lock().unwrap().clone()
    }

    pub(crate) fn deleted_namespaces(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    pub(crate) fn fail_delete(&self) {
        *self.fail_delete.lock().unwrap() = true;
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    fn watch_pods(&self, _namespace: &str) -> WatchStream<Pod> {
        self.pods.lock().unwrap().subscribe()
    }

    fn watch_endpoints(&self, _namespace: &str) -> WatchStream<Endpoints> {
        self.endpoints.lock().unwrap().subscribe()
    }

    async fn get_endpoints(
        &self,
        _namespace: &str,
        service: &str,
    ) -> Result<Endpoints, ClusterError> {
        self.current_endpoints
            .lock()
            .unwrap()
            .get(service)
            .cloned()
            .ok_or_else(|| ClusterError::GetError(format!("Endpoints '{service}' not found")))
    }

    async fn open_log_stream(&self, target: &TailTarget) -> Result<LogLines, ClusterError> {
        let id = target.id();
        let mut logs = self.logs.lock().unwrap();
        *logs.opens.entry(id.clone()).or_default() += 1;
        if logs.failing.contains(&id) {
            return Err(ClusterError::LogsError(format!("pod '{}' not found", target.pod)));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        logs.feeds.insert(id, tx);
        Ok(receiver_stream(rx))
    }

    async fn open_port_forward(
        &self,
        _namespace: &str,
        pod: &str,
        remote_port: u16,
        lifetime: CancellationToken,
    ) -> Result<Tunnel, ClusterError> {
        if *self.failing_port.lock().unwrap() == Some(remote_port) {
            return Err(ClusterError::PortForwardError(format!(
                "pod '{pod}' refused port {remote_port}"
            )));
        }
        self.forwards
            .lock()
            .unwrap()
            .push((pod.to_string(), remote_port));

        let local_port = self.next_port.fetch_add(1, Ordering::SeqCst);
        let task = tokio::spawn(lifetime.cancelled_owned());
        Ok(Tunnel::new(
            SocketAddr::from((Ipv4Addr::LOCALHOST, local_port)),
            task,
        ))
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), ClusterError> {
        self.deleted.lock().unwrap().push(name.to_string());
        if *self.fail_delete.lock().unwrap() {
            return Err(ClusterError::CleanupError(format!(
                "Namespace '{name}': permission denied (check RBAC)"
            )));
        }
        Ok(())
    }
}

fn meta(namespace: &str, name: &str, labels: &[(&str, &str)]) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: (!labels.is_empty()).then(|| {
            labels
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect()
        }),
        ..Default::default()
    }
}

/// Pod with the given labels and a `Ready` condition
pub(crate) fn app_pod(name: &str, labels: &[(&str, &str)], ready: bool) -> Pod {
    Pod {
        metadata: meta("ns", name, labels),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Pod whose containers are all running
pub(crate) fn running_pod(namespace: &str, name: &str, containers: &[&str]) -> Pod {
    let statuses = containers
        .iter()
        .map(|container| ContainerStatus {
            name: (*container).to_string(),
            ready: true,
            state: Some(ContainerState {
                running: Some(ContainerStateRunning::default()),
                ..Default::default()
            }),
            ..Default::default()
        })
        .collect();

    Pod {
        metadata: meta(namespace, name, &[]),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            container_statuses: Some(statuses),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Pod with a single container still waiting to start
pub(crate) fn waiting_pod(namespace: &str, name: &str, container: &str) -> Pod {
    Pod {
        metadata: meta(namespace, name, &[]),
        status: Some(PodStatus {
            phase: Some("Pending".to_string()),
            container_statuses: Some(vec![ContainerStatus {
                name: container.to_string(),
                state: Some(ContainerState {
                    waiting: Some(ContainerStateWaiting {
                        reason: Some("ContainerCreating".to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Endpoints for `service` with one address per backing pod
pub(crate) fn endpoints(service: &str, pods: &[&str]) -> Endpoints {
    let addresses: Vec<EndpointAddress> = pods
        .iter()
        .enumerate()
        .map(|(i, pod)| EndpointAddress {
            ip: format!("10.0.0.{}", i + 1),
            target_ref: Some(ObjectReference {
                kind: Some("Pod".to_string()),
                name: Some((*pod).to_string()),
                namespace: Some("ns".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        })
        .collect();

    Endpoints {
        metadata: meta("ns", service, &[]),
        subsets: Some(vec![EndpointSubset {
            addresses: Some(addresses),
            ..Default::default()
        }]),
    }
}
