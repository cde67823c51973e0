//! Top-level cancellation
//!
//! Three triggers share one token: an interrupt or termination signal, EOF
//! on the parent link (stdin), and the overall deadline. The first trigger
//! to fire is recorded as the reason.

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::wait::{ReadinessError, WaitTarget, WaitTimeout};

/// What cancelled the sidecar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT or SIGTERM
    Signal,
    /// The parent closed stdin
    ParentClosed,
    /// The overall timeout elapsed
    Deadline,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            ShutdownReason::Signal => "signal",
            ShutdownReason::ParentClosed => "parent closed stdin",
            ShutdownReason::Deadline => "deadline",
        };
        f.write_str(reason)
    }
}

/// Shared cancellation handle
#[derive(Debug, Clone)]
pub struct Shutdown {
    token: CancellationToken,
    reason: Arc<OnceLock<ShutdownReason>>,
    started: Instant,
    timeout: Duration,
}

impl Shutdown {
    /// Start the clock for an overall timeout
    pub fn new(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Arc::new(OnceLock::new()),
            started: Instant::now(),
            timeout,
        }
    }

    /// The top-level token; children are cancelled with it
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Cancel everything; only the first reason is kept
    pub fn trigger(&self, reason: ShutdownReason) {
        if self.reason.set(reason).is_ok() {
            info!(reason = %reason, "Shutting down");
        }
        self.token.cancel();
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.get().copied()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Fire [`ShutdownReason::Deadline`] once the timeout has passed
    pub fn spawn_deadline(&self) -> JoinHandle<()> {
        let shutdown = self.clone();
        let deadline = self.started + self.timeout;
        tokio::spawn(async move {
            tokio::select! {
                () = shutdown.token.cancelled() => {}
                () = tokio::time::sleep_until(deadline) => {
                    shutdown.trigger(ShutdownReason::Deadline);
                }
            }
        })
    }

    /// Fire [`ShutdownReason::ParentClosed`] when `parent` reaches EOF
    ///
    /// Anything the parent writes is discarded.
    pub fn spawn_parent_watch<R>(&self, mut parent: R) -> JoinHandle<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let shutdown = self.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 256];
            loop {
                tokio::select! {
                    () = shutdown.token.cancelled() => return,
                    read = parent.read(&mut buf) => match read {
                        Ok(0) => break,
                        Ok(n) => debug!(bytes = n, "Ignoring input from parent"),
                        Err(e) => {
                            warn!(error = %e, "Reading from parent failed");
                            break;
                        }
                    },
                }
            }
            shutdown.trigger(ShutdownReason::ParentClosed);
        })
    }

    /// Fire [`ShutdownReason::Signal`] on ctrl-c or SIGTERM
    pub fn spawn_signal_watch(&self) -> JoinHandle<()> {
        let shutdown = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = shutdown.token.cancelled() => {}
                () = wait_for_signal() => shutdown.trigger(ShutdownReason::Signal),
            }
        })
    }

    /// Error for a readiness wait interrupted by this shutdown
    pub(crate) fn interrupted(
        &self,
        target: WaitTarget,
        missing: Vec<String>,
        last_ready: Vec<String>,
    ) -> ReadinessError {
        match self.reason() {
            Some(ShutdownReason::Deadline) => ReadinessError::Timeout(WaitTimeout {
                target,
                missing,
                last_ready,
                elapsed: self.elapsed(),
                timeout: self.timeout,
            }),
            reason => ReadinessError::Cancelled {
                target,
                reason: reason.unwrap_or(ShutdownReason::Signal),
                missing,
            },
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "Cannot install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
