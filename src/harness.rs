//! Parent side of the handshake
//!
//! Runs the sidecar binary as a child process of a test suite:
//! - passes `--waitforapp` and `--portforward` flags
//! - reads FORWARD lines from its stdout until READY
//! - copies its stderr into the test's logs
//! - shuts it down by closing its stdin
//!
//! # Example
//!
//! ```no_run
//! use it_sidecar::harness::{HarnessConfig, SidecarProcess};
//!
//! # async fn example() -> Result<(), it_sidecar::harness::HarnessError> {
//! let config = HarnessConfig::new()
//!     .wait_for_app("backend")
//!     .port_forward("frontend", 8080);
//!
//! let sidecar = SidecarProcess::start("./it-sidecar", &config).await?;
//! let port = sidecar.local_port("frontend", 8080).unwrap();
//! // talk to 127.0.0.1:{port}
//! sidecar.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::process::Stdio;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::protocol::Emission;

/// Error type for running the sidecar
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("Failed to start sidecar: {0}")]
    SpawnFailed(String),

    #[error("I/O error talking to sidecar: {0}")]
    Io(#[from] std::io::Error),

    #[error("Sidecar exited before READY (exit code {0:?})")]
    ExitedBeforeReady(Option<i32>),

    #[error("Sidecar exited with failure (exit code {0:?})")]
    ExitFailure(Option<i32>),
}

/// What the sidecar should wait for and forward
#[derive(Debug, Clone, Default)]
pub struct HarnessConfig {
    pub wait_for_apps: Vec<String>,
    pub port_forwards: Vec<(String, u16)>,
    pub extra_args: Vec<String>,
}

impl HarnessConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wait_for_app(mut self, app: impl Into<String>) -> Self {
        self.wait_for_apps.push(app.into());
        self
    }

    pub fn port_forward(mut self, service: impl Into<String>, port: u16) -> Self {
        self.port_forwards.push((service.into(), port));
        self
    }

    /// Pass any other flag through, e.g. `--namespace=it-1`
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    /// Command-line arguments for the sidecar
    pub fn args(&self) -> Vec<String> {
        let apps = self
            .wait_for_apps
            .iter()
            .map(|app| format!("--waitforapp={app}"));
        let forwards = self
            .port_forwards
            .iter()
            .map(|(service, port)| format!("--portforward={service}:{port}"));

        self.extra_args
            .iter()
            .cloned()
            .chain(apps)
            .chain(forwards)
            .collect()
    }
}

/// A running sidecar that has reported READY
pub struct SidecarProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    forwards: BTreeMap<(String, u16), u16>,
    readers: Vec<JoinHandle<()>>,
}

impl SidecarProcess {
    /// Start the sidecar and wait for READY
    pub async fn start(
        program: impl AsRef<OsStr>,
        config: &HarnessConfig,
    ) -> Result<Self, HarnessError> {
        let program = program.as_ref();
        let args = config.args();
        info!(program = %program.to_string_lossy(), args = ?args, "Starting sidecar");

        let mut child = Command::new(program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    HarnessError::CommandNotFound(program.to_string_lossy().into_owned())
                } else {
                    HarnessError::SpawnFailed(e.to_string())
                }
            })?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HarnessError::SpawnFailed("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| HarnessError::SpawnFailed("stderr not captured".to_string()))?;

        let mut readers = vec![tokio::spawn(relay("stderr", BufReader::new(stderr).lines()))];

        let mut lines = BufReader::new(stdout).lines();
        let forwards = match read_handshake(&mut lines).await? {
            Some(forwards) => forwards,
            None => {
                drop(stdin);
                let status = child.wait().await?;
                for reader in readers {
                    let _ = reader.await;
                }
                return Err(HarnessError::ExitedBeforeReady(status.code()));
            }
        };

        readers.push(tokio::spawn(relay("stdout", lines)));
        info!(forwards = forwards.len(), "Sidecar ready");

        Ok(Self {
            child,
            stdin,
            forwards,
            readers,
        })
    }

    /// Local port forwarded to `service:remote_port`
    pub fn local_port(&self, service: &str, remote_port: u16) -> Option<u16> {
        self.forwards
            .get(&(service.to_string(), remote_port))
            .copied()
    }

    /// Local port of any forward to `service`
    pub fn service_port(&self, service: &str) -> Option<u16> {
        self.forwards
            .iter()
            .find(|((s, _), _)| s == service)
            .map(|(_, local)| *local)
    }

    /// Every forward, keyed by `(service, remote_port)`
    pub fn forwards(&self) -> &BTreeMap<(String, u16), u16> {
        &self.forwards
    }

    /// Close stdin and wait for the sidecar to exit
    pub async fn shutdown(mut self) -> Result<(), HarnessError> {
        drop(self.stdin.take());
        let status = self.child.wait().await?;
        for reader in self.readers.drain(..) {
            let _ = reader.await;
        }

        debug!(status = %status, "Sidecar exited");
        if status.success() {
            Ok(())
        } else {
            Err(HarnessError::ExitFailure(status.code()))
        }
    }
}

/// Read stdout until READY; `None` if the sidecar closed it first
async fn read_handshake(
    lines: &mut Lines<BufReader<ChildStdout>>,
) -> Result<Option<BTreeMap<(String, u16), u16>>, HarnessError> {
    let mut forwards = BTreeMap::new();
    while let Some(line) = lines.next_line().await? {
        match line.parse::<Emission>() {
            Ok(Emission::Forward {
                service,
                remote_port,
                local_port,
            }) => {
                info!(service = %service, remote_port, local_port, "Sidecar forward");
                forwards.insert((service, remote_port), local_port);
            }
            Ok(Emission::Ready) => return Ok(Some(forwards)),
            Err(_) => debug!(line = %line, "Sidecar stdout"),
        }
    }
    Ok(None)
}

async fn relay<R>(stream: &'static str, mut lines: Lines<R>)
where
    R: AsyncBufRead + Unpin,
{
    while let Ok(Some(line)) = lines.next_line().await {
        info!(target: "sidecar", stream, "{line}");
    }
}
