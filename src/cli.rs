//! Command-line flags for the sidecar binary

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{PortForwardSpec, SidecarConfig, TailConfig};
use crate::tail::ContainerState;

/// Waits for a test environment to become ready, forwards its ports, and
/// reports them on stdout. Closing stdin shuts it down.
#[derive(Debug, Parser)]
#[command(name = "it-sidecar", version, about)]
pub struct Cli {
    /// Namespace holding the test environment
    #[arg(long, env = "NAMESPACE")]
    pub namespace: Option<String>,

    /// Overall timeout for readiness and the whole run
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    pub timeout: Duration,

    /// Delete the namespace on exit
    #[arg(long = "delete_namespace")]
    pub delete_namespace: bool,

    /// Explicit kubeconfig path
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// App that must have a ready pod (repeatable)
    #[arg(long = "waitforapp", value_name = "APP")]
    pub wait_for_apps: Vec<String>,

    /// service:port to forward once the service is ready (repeatable)
    #[arg(long = "portforward", value_name = "SERVICE:PORT")]
    pub port_forwards: Vec<PortForwardSpec>,

    /// Regex on pod names whose logs are tailed
    #[arg(long = "tail-pod", default_value = ".*")]
    pub tail_pod: String,

    /// Regex on container names whose logs are tailed
    #[arg(long = "tail-container", default_value = ".*")]
    pub tail_container: String,

    /// Container state to tail: running, waiting or terminated
    #[arg(long = "tail-state", default_value = "running")]
    pub tail_state: ContainerState,
}

impl Cli {
    pub fn into_config(self) -> SidecarConfig {
        let mut config = SidecarConfig::new(self.namespace.unwrap_or_default())
            .timeout(self.timeout)
            .delete_namespace(self.delete_namespace)
            .tail(TailConfig {
                pod_pattern: self.tail_pod,
                container_pattern: self.tail_container,
                container_state: self.tail_state,
            });

        if let Some(path) = self.kubeconfig {
            config = config.kubeconfig(path);
        }
        for app in self.wait_for_apps {
            config = config.wait_for_app(app);
        }
        for spec in self.port_forwards {
            config = config.port_forward(spec);
        }
        config
    }
}
