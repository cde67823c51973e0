//! Waiting for applications to have ready pods
//!
//! The tracker keeps a reflector store of the namespace's pods and
//! recomputes the ready-app set from the whole store after every event, so
//! replayed or duplicated events cannot skew it.

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::reflector::{self, Store};
use kube::runtime::watcher::Event;
use kube::ResourceExt;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

use crate::cluster::WatchStream;
use crate::shutdown::Shutdown;
use crate::wait::{ReadinessError, ResourceState, WaitTarget};

/// Label keys naming a pod's application, highest priority first
pub const APP_LABEL_KEYS: [&str; 2] = ["app.kubernetes.io/name", "app"];

/// Whether the pod's `Ready` condition is `True`
pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// Every application identifier the pod's labels name
pub fn app_candidates(pod: &Pod) -> Vec<String> {
    let labels = pod.labels();
    APP_LABEL_KEYS
        .iter()
        .filter_map(|key| labels.get(*key))
        .cloned()
        .collect()
}

/// Tracks which requested apps have at least one ready pod
pub struct AppReadinessTracker {
    requested: BTreeSet<String>,
    writer: reflector::store::Writer<Pod>,
    store: Store<Pod>,
    ready: BTreeSet<String>,
}

impl AppReadinessTracker {
    pub fn new<I, S>(requested: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (store, writer) = reflector::store();
        Self {
            requested: requested.into_iter().map(Into::into).collect(),
            writer,
            store,
            ready: BTreeSet::new(),
        }
    }

    /// Apply one pod event; returns true once nothing requested is missing
    pub fn observe(&mut self, event: &Event<Pod>) -> bool {
        self.writer.apply_watcher_event(event);

        let pods = self.store.state();
        let mut ready = BTreeSet::new();
        let mut ready_pods = Vec::new();
        for pod in &pods {
            if is_pod_ready(pod) {
                ready_pods.push(pod.name_any());
                ready.extend(app_candidates(pod));
            } else {
                debug!(pod = %pod.name_any(), state = %pod.state_description(), "Pod not ready");
            }
        }

        if ready != self.ready {
            ready_pods.sort();
            info!(pods = ?ready_pods, "Ready pods");
            self.ready = ready;
        }

        let missing = self.missing();
        if !missing.is_empty() {
            debug!(apps = ?missing, "Still waiting for apps");
        }
        missing.is_empty()
    }

    /// Every app seen with a ready pod, requested or not
    pub fn ready_apps(&self) -> &BTreeSet<String> {
        &self.ready
    }

    /// Requested apps without a ready pod
    pub fn missing(&self) -> Vec<String> {
        self.requested.difference(&self.ready).cloned().collect()
    }

    pub fn is_satisfied(&self) -> bool {
        self.requested.is_subset(&self.ready)
    }

    /// Consume pod events until every requested app is ready
    pub async fn wait(
        &mut self,
        mut events: WatchStream<Pod>,
        shutdown: &Shutdown,
    ) -> Result<(), ReadinessError> {
        if self.is_satisfied() {
            return Ok(());
        }

        info!(apps = ?self.missing(), "Waiting for apps");

        let mut received = false;
        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    return Err(shutdown.interrupted(
                        WaitTarget::Apps,
                        self.missing(),
                        self.requested.intersection(&self.ready).cloned().collect(),
                    ));
                }
                next = events.next() => match next {
                    Some(Ok(event)) => {
                        received = true;
                        if self.observe(&event) {
                            info!(apps = ?self.requested, "All apps ready");
                            return Ok(());
                        }
                    }
                    Some(Err(e)) if !received => {
                        return Err(ReadinessError::WatchSetup(WaitTarget::Apps, e.to_string()));
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Pod watch error, retrying");
                    }
                    None => return Err(ReadinessError::WatchClosed(WaitTarget::Apps)),
                },
            }
        }
    }
}
