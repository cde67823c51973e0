//! Readiness wait errors with debugging context
//!
//! A timed-out wait reports what it was waiting for, what was still
//! missing, and what had become ready.
//!
//! # Example
//!
//! ```ignore
//! match tracker.wait(events, &shutdown).await {
//!     Err(ReadinessError::Timeout(err)) => {
//!         println!("Waiting for: {}", err.target);
//!         println!("Missing: {:?}", err.missing);
//!         println!("Elapsed: {:?}", err.elapsed);
//!     }
//!     _ => {}
//! }
//! ```

use std::fmt;
use std::time::Duration;

use crate::portforward::PortForwardError;
use crate::shutdown::ShutdownReason;

/// What a readiness wait is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTarget {
    Apps,
    Services,
}

impl fmt::Display for WaitTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitTarget::Apps => f.write_str("apps"),
            WaitTarget::Services => f.write_str("services"),
        }
    }
}

/// Rich error context for a wait that hit the deadline
#[derive(Debug, Clone)]
pub struct WaitTimeout {
    pub target: WaitTarget,
    /// Names that never became ready
    pub missing: Vec<String>,
    /// Names that were ready when the deadline hit
    pub last_ready: Vec<String>,
    /// How long we waited before giving up
    pub elapsed: Duration,
    /// The timeout that was configured
    pub timeout: Duration,
}

impl fmt::Display for WaitTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f)?;
        writeln!(f, "Wait timeout for {}", self.target)?;
        writeln!(f, "├─ Missing: {}", list(&self.missing))?;
        writeln!(f, "├─ Ready: {}", list(&self.last_ready))?;
        writeln!(f, "├─ Elapsed: {:?}", self.elapsed)?;
        writeln!(f, "└─ Timeout: {:?}", self.timeout)?;
        Ok(())
    }
}

fn list(names: &[String]) -> String {
    if names.is_empty() {
        "(none)".to_string()
    } else {
        names.join(", ")
    }
}

/// Readiness wait errors
#[derive(Debug, thiserror::Error)]
pub enum ReadinessError {
    #[error("{0}")]
    Timeout(WaitTimeout),

    #[error("cancelled ({reason}) while waiting for {target}; missing: {}", list(.missing))]
    Cancelled {
        target: WaitTarget,
        reason: ShutdownReason,
        missing: Vec<String>,
    },

    #[error("could not establish {0} watch: {1}")]
    WatchSetup(WaitTarget, String),

    #[error("{0} watch ended unexpectedly")]
    WatchClosed(WaitTarget),

    #[error("port forward failed: {0}")]
    PortForward(#[from] PortForwardError),
}

/// Human-readable state of a watched object, for wait logs
pub trait ResourceState {
    fn state_description(&self) -> String;
}

impl ResourceState for k8s_openapi::api::core::v1::Pod {
    /// Ready condition first, since that is what app readiness checks
    fn state_description(&self) -> String {
        let Some(status) = self.status.as_ref() else {
            return "no status yet".to_string();
        };

        let ready = status
            .conditions
            .iter()
            .flatten()
            .find(|c| c.type_ == "Ready");
        let mut description = match ready {
            Some(c) => match c.reason.as_deref() {
                Some(reason) => format!("Ready={} ({reason})", c.status),
                None => format!("Ready={}", c.status),
            },
            None => "Ready=Unknown".to_string(),
        };
        description.push_str(&format!(
            ", phase={}",
            status.phase.as_deref().unwrap_or("Unknown")
        ));

        let waiting: Vec<String> = status
            .container_statuses
            .iter()
            .flatten()
            .filter_map(|c| {
                let reason = c.state.as_ref()?.waiting.as_ref()?.reason.as_deref()?;
                Some(format!("{}={reason}", c.name))
            })
            .collect();
        if !waiting.is_empty() {
            description.push_str(&format!(", waiting: {}", waiting.join(", ")));
        }

        description
    }
}

impl ResourceState for k8s_openapi::api::core::v1::Endpoints {
    fn state_description(&self) -> String {
        let subsets = self.subsets.as_deref().unwrap_or_default();
        let ready: usize = subsets
            .iter()
            .map(|s| s.addresses.as_ref().map_or(0, Vec::len))
            .sum();
        let not_ready: usize = subsets
            .iter()
            .map(|s| s.not_ready_addresses.as_ref().map_or(0, Vec::len))
            .sum();

        format!("{} ready addresses, {} not ready", ready, not_ready)
    }
}
