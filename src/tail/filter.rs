//! Which containers get tailed
//!
//! Pod events are reduced to added/removed [`TailTarget`]s using pod and
//! container name patterns and a container-state filter.

use k8s_openapi::api::core::v1::{ContainerState as K8sContainerState, ContainerStatus, Pod};
use kube::runtime::watcher::Event;
use kube::ResourceExt;
use regex::Regex;
use std::fmt;
use std::str::FromStr;

use crate::config::ConfigError;

/// A single container whose log can be tailed
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TailTarget {
    pub namespace: String,
    pub pod: String,
    pub container: String,
}

impl TailTarget {
    pub fn new(
        namespace: impl Into<String>,
        pod: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            pod: pod.into(),
            container: container.into(),
        }
    }

    /// Registry key: `namespace/pod/container`
    pub fn id(&self) -> String {
        format!("{}/{}/{}", self.namespace, self.pod, self.container)
    }
}

impl fmt::Display for TailTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pod, self.container)
    }
}

/// Container state a target must be in to be tailed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ContainerState {
    #[default]
    Running,
    Waiting,
    Terminated,
}

impl ContainerState {
    /// Whether a reported container state is in this state
    pub fn matches(self, state: &K8sContainerState) -> bool {
        match self {
            Self::Running => state.running.is_some(),
            Self::Waiting => state.waiting.is_some(),
            Self::Terminated => state.terminated.is_some(),
        }
    }
}

impl FromStr for ContainerState {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "waiting" => Ok(Self::Waiting),
            "terminated" => Ok(Self::Terminated),
            other => Err(ConfigError::InvalidContainerState(other.to_string())),
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// A change in the set of tail targets
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetChange {
    Added(TailTarget),
    Removed(TailTarget),
}

/// Pod/container selection for log tailing
///
/// A missing pattern matches everything.
#[derive(Debug, Clone, Default)]
pub struct TailFilter {
    pod: Option<Regex>,
    container: Option<Regex>,
    state: ContainerState,
}

impl TailFilter {
    /// Build a filter from pattern strings
    pub fn new(
        pod_pattern: &str,
        container_pattern: &str,
        state: ContainerState,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            pod: compile(pod_pattern)?,
            container: compile(container_pattern)?,
            state,
        })
    }

    fn pod_matches(&self, name: &str) -> bool {
        self.pod.as_ref().map_or(true, |re| re.is_match(name))
    }

    fn container_matches(&self, name: &str) -> bool {
        self.container.as_ref().map_or(true, |re| re.is_match(name))
    }

    /// Reduce a pod watch event to target changes
    ///
    /// Init markers carry no pods and produce nothing; the caller handles
    /// re-list reconciliation.
    pub fn changes(&self, event: &Event<Pod>) -> Vec<TargetChange> {
        match event {
            Event::Apply(pod) | Event::InitApply(pod) => self.changes_for_pod(pod),
            Event::Delete(pod) => self.targets_of(pod).map(TargetChange::Removed).collect(),
            Event::Init | Event::InitDone => Vec::new(),
        }
    }

    fn changes_for_pod(&self, pod: &Pod) -> Vec<TargetChange> {
        let name = pod.name_any();
        if !self.pod_matches(&name) {
            return Vec::new();
        }
        let namespace = pod.namespace().unwrap_or_default();

        container_statuses(pod)
            .filter(|status| self.container_matches(&status.name))
            .map(|status| {
                let target = TailTarget::new(&namespace, &name, &status.name);
                let in_state = status
                    .state
                    .as_ref()
                    .is_some_and(|state| self.state.matches(state));
                if in_state {
                    TargetChange::Added(target)
                } else {
                    TargetChange::Removed(target)
                }
            })
            .collect()
    }

    /// Every container of a matching pod, regardless of state
    fn targets_of<'a>(&'a self, pod: &'a Pod) -> impl Iterator<Item = TailTarget> + 'a {
        let name = pod.name_any();
        let namespace = pod.namespace().unwrap_or_default();
        let pod_matches = self.pod_matches(&name);

        container_statuses(pod)
            .filter(move |status| pod_matches && self.container_matches(&status.name))
            .map(move |status| TailTarget::new(&namespace, &name, &status.name))
    }
}

fn compile(pattern: &str) -> Result<Option<Regex>, ConfigError> {
    if pattern.is_empty() || pattern == ".*" {
        return Ok(None);
    }
    Regex::new(pattern)
        .map(Some)
        .map_err(|e| ConfigError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })
}

fn container_statuses(pod: &Pod) -> impl Iterator<Item = &ContainerStatus> {
    let status = pod.status.as_ref();
    let init = status
        .and_then(|s| s.init_container_statuses.as_deref())
        .unwrap_or_default();
    let regular = status
        .and_then(|s| s.container_statuses.as_deref())
        .unwrap_or_default();
    init.iter().chain(regular.iter())
}
