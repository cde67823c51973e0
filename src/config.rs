//! Startup configuration for the sidecar
//!
//! Built programmatically with builder methods; the binary fills it from
//! command-line flags.
//!
//! # Example
//!
//! ```
//! use it_sidecar::config::{PortForwardSpec, SidecarConfig};
//! use std::time::Duration;
//!
//! let config = SidecarConfig::new("it-1234")
//!     .timeout(Duration::from_secs(120))
//!     .delete_namespace(true)
//!     .wait_for_app("backend")
//!     .port_forward("frontend:8080".parse::<PortForwardSpec>().unwrap());
//!
//! assert_eq!(config.port_forwards["frontend"], vec![8080]);
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::tail::{ContainerState, TailFilter};

/// Default overall timeout, matching the harness default
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration errors, reported before anything starts
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("incorrect portforward '{0}': must be in form of service:port")]
    InvalidPortForward(String),

    #[error("incorrect port in portforward '{value}': {reason}")]
    InvalidPort { value: String, reason: String },

    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("containerState should be one of 'running', 'waiting', or 'terminated', got '{0}'")]
    InvalidContainerState(String),

    #[error("namespace is required (set --namespace or NAMESPACE)")]
    MissingNamespace,
}

/// One `service:port` forward request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortForwardSpec {
    pub service: String,
    pub port: u16,
}

impl FromStr for PortForwardSpec {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (service, port) = value
            .split_once(':')
            .filter(|(service, _)| !service.is_empty())
            .ok_or_else(|| ConfigError::InvalidPortForward(value.to_string()))?;

        let port = port.parse::<u16>().map_err(|e| ConfigError::InvalidPort {
            value: value.to_string(),
            reason: e.to_string(),
        })?;
        if port == 0 {
            return Err(ConfigError::InvalidPort {
                value: value.to_string(),
                reason: "port must be non-zero".to_string(),
            });
        }

        Ok(Self {
            service: service.to_string(),
            port,
        })
    }
}

impl fmt::Display for PortForwardSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.service, self.port)
    }
}

/// Which containers to tail
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailConfig {
    /// Regex on pod names
    pub pod_pattern: String,

    /// Regex on container names
    pub container_pattern: String,

    /// Required container state
    pub container_state: ContainerState,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            pod_pattern: ".*".to_string(),
            container_pattern: ".*".to_string(),
            container_state: ContainerState::Running,
        }
    }
}

/// Sidecar configuration
#[derive(Debug, Clone)]
pub struct SidecarConfig {
    /// Namespace holding the test environment
    pub namespace: String,

    /// Overall deadline, counted from startup
    pub timeout: Duration,

    /// Delete the namespace during cleanup
    pub delete_namespace: bool,

    /// Explicit kubeconfig; `None` uses kube's default inference
    pub kubeconfig: Option<PathBuf>,

    /// Apps that must have a ready pod before READY
    pub wait_for_apps: Vec<String>,

    /// Service name -> remote ports to forward
    pub port_forwards: BTreeMap<String, Vec<u16>>,

    /// Log tail selection
    pub tail: TailConfig,
}

impl SidecarConfig {
    /// Create a config for a namespace with defaults for everything else
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            timeout: DEFAULT_TIMEOUT,
            delete_namespace: false,
            kubeconfig: None,
            wait_for_apps: Vec::new(),
            port_forwards: BTreeMap::new(),
            tail: TailConfig::default(),
        }
    }

    /// Set the overall timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Delete the namespace on cleanup
    pub fn delete_namespace(mut self, delete: bool) -> Self {
        self.delete_namespace = delete;
        self
    }

    /// Set kubeconfig path
    pub fn kubeconfig(mut self, path: impl Into<PathBuf>) -> Self {
        self.kubeconfig = Some(path.into());
        self
    }

    /// Wait for an app to have a ready pod
    pub fn wait_for_app(mut self, app: impl Into<String>) -> Self {
        let app = app.into();
        if !self.wait_for_apps.contains(&app) {
            self.wait_for_apps.push(app);
        }
        self
    }

    /// Add a port forward; repeated service:port pairs are ignored
    pub fn port_forward(mut self, spec: PortForwardSpec) -> Self {
        let ports = self.port_forwards.entry(spec.service).or_default();
        if !ports.contains(&spec.port) {
            ports.push(spec.port);
        }
        self
    }

    /// Set log tail selection
    pub fn tail(mut self, tail: TailConfig) -> Self {
        self.tail = tail;
        self
    }

    /// Check the config and compile the tail filter
    pub fn validate(&self) -> Result<TailFilter, ConfigError> {
        if self.namespace.is_empty() {
            return Err(ConfigError::MissingNamespace);
        }
        self.tail_filter()
    }

    /// Compile the log tail filter
    pub fn tail_filter(&self) -> Result<TailFilter, ConfigError> {
        TailFilter::new(
            &self.tail.pod_pattern,
            &self.tail.container_pattern,
            self.tail.container_state,
        )
    }
}
