//! Live log tailing for every pod in the namespace
//!
//! The [`LogTailer`] consumes its own pod watch and keeps exactly one tail
//! session per `namespace/pod/container`. Sessions start when a container
//! enters the filtered state and stop when it leaves it or its pod is
//! deleted. Only the tailer's event loop touches the session registry; the
//! per-session tasks just read lines and forward them.
//!
//! Tail output goes through a channel of [`TailOutput`] so the operator
//! stream (stderr in the binary) is written from one place.

mod filter;

pub use filter::{ContainerState, TailFilter, TailTarget, TargetChange};

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher::Event;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::ClusterClient;

/// How long a closing session may take to finish its read loop
pub const DEFAULT_TAIL_GRACE: Duration = Duration::from_secs(2);

/// Something to show on the operator stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TailOutput {
    /// A session was registered
    Started(TailTarget),
    /// One log line, without its trailing newline
    Line { target: TailTarget, line: String },
    /// A session was closed and removed
    Finished(TailTarget),
}

impl fmt::Display for TailOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started(target) => write!(f, "+ {target}"),
            Self::Line { target, line } => write!(f, "[{target}]: {line}"),
            Self::Finished(target) => write!(f, "Log finished {}", target.pod),
        }
    }
}

struct TailSession {
    target: TailTarget,
    close: CancellationToken,
    task: JoinHandle<()>,
}

/// Maintains one log session per live container
pub struct LogTailer {
    cluster: Arc<dyn ClusterClient>,
    namespace: String,
    filter: TailFilter,
    output: mpsc::UnboundedSender<TailOutput>,
    sessions: HashMap<String, TailSession>,
    relisted: Option<HashSet<String>>,
    grace: Duration,
}

impl LogTailer {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        namespace: impl Into<String>,
        filter: TailFilter,
        output: mpsc::UnboundedSender<TailOutput>,
    ) -> Self {
        Self {
            cluster,
            namespace: namespace.into(),
            filter,
            output,
            sessions: HashMap::new(),
            relisted: None,
            grace: DEFAULT_TAIL_GRACE,
        }
    }

    /// Set how long a closing session may take to stop
    pub fn grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Ids of the currently registered sessions
    pub fn active(&self) -> BTreeSet<String> {
        self.sessions.keys().cloned().collect()
    }

    /// Watch pods and tail their logs until `shutdown` is cancelled
    ///
    /// Watch failures are logged and end tailing; they never affect
    /// readiness. All sessions are closed before this returns.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut events = self.cluster.watch_pods(&self.namespace);

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                event = events.next() => match event {
                    Some(Ok(event)) => self.handle_event(&event, &shutdown).await,
                    Some(Err(e)) => warn!(error = %e, "Pod watch error in log tailer"),
                    None => {
                        warn!(namespace = %self.namespace, "Pod watch for log tailing ended");
                        break;
                    }
                },
            }
        }

        self.close_all().await;
    }

    /// Apply one pod event to the session registry
    pub async fn handle_event(&mut self, event: &Event<Pod>, shutdown: &CancellationToken) {
        match event {
            Event::Init => self.relisted = Some(HashSet::new()),
            Event::InitDone => {
                // Sessions not seen again in the re-list belong to pods that
                // went away while the watch was down.
                if let Some(seen) = self.relisted.take() {
                    let stale: Vec<String> = self
                        .sessions
                        .keys()
                        .filter(|id| !seen.contains(*id))
                        .cloned()
                        .collect();
                    for id in stale {
                        self.stop(&id).await;
                    }
                }
            }
            _ => {}
        }

        for change in self.filter.changes(event) {
            match change {
                TargetChange::Added(target) => {
                    if let Some(seen) = self.relisted.as_mut() {
                        seen.insert(target.id());
                    }
                    self.start(target, shutdown);
                }
                TargetChange::Removed(target) => self.stop(&target.id()).await,
            }
        }
    }

    fn start(&mut self, target: TailTarget, shutdown: &CancellationToken) {
        let id = target.id();
        if self.sessions.contains_key(&id) || shutdown.is_cancelled() {
            return;
        }

        let close = shutdown.child_token();
        let task = tokio::spawn(tail(
            Arc::clone(&self.cluster),
            target.clone(),
            self.output.clone(),
            close.clone(),
        ));

        debug!(id = %id, "Registered tail session");
        self.sessions.insert(id, TailSession { target, close, task });
    }

    async fn stop(&mut self, id: &str) {
        let Some(session) = self.sessions.remove(id) else {
            return;
        };

        session.close.cancel();
        let abort = session.task.abort_handle();
        if tokio::time::timeout(self.grace, session.task).await.is_err() {
            warn!(id = %id, grace = ?self.grace, "Tail did not stop within grace period, aborting");
            abort.abort();
        }

        let _ = self.output.send(TailOutput::Finished(session.target));
    }

    async fn close_all(&mut self) {
        let ids: Vec<String> = self.sessions.keys().cloned().collect();
        for id in &ids {
            self.stop(id).await;
        }
        if !ids.is_empty() {
            info!(closed = ids.len(), "Closed all log tails");
        }
    }
}

/// Read one container's log until it ends or `close` fires
async fn tail(
    cluster: Arc<dyn ClusterClient>,
    target: TailTarget,
    output: mpsc::UnboundedSender<TailOutput>,
    close: CancellationToken,
) {
    let _ = output.send(TailOutput::Started(target.clone()));

    let mut lines = tokio::select! {
        biased;
        () = close.cancelled() => return,
        opened = cluster.open_log_stream(&target) => match opened {
            Ok(lines) => lines,
            Err(e) => {
                warn!(
                    namespace = %target.namespace,
                    pod = %target.pod,
                    container = %target.container,
                    error = %e,
                    "Error opening log stream"
                );
                return;
            }
        },
    };

    loop {
        tokio::select! {
            biased;
            () = close.cancelled() => break,
            line = lines.next() => match line {
                Some(Ok(line)) => {
                    let line = line.trim_end_matches(['\r', '\n']).to_string();
                    let _ = output.send(TailOutput::Line { target: target.clone(), line });
                }
                Some(Err(e)) => {
                    debug!(target = %target, error = %e, "Log stream read failed");
                    break;
                }
                None => break,
            },
        }
    }
}

/// Write tail output to the operator stream until every sender is gone
pub async fn print_tail_output<W>(mut output: mpsc::UnboundedReceiver<TailOutput>, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    while let Some(item) = output.recv().await {
        let rendered = format!("{item}\n");
        if let Err(e) = writer.write_all(rendered.as_bytes()).await {
            warn!(error = %e, "Failed to write log output");
            return;
        }
    }
    let _ = writer.flush().await;
}
