//! Waiting for services to have live endpoints
//!
//! The first time a configured service has at least one address, its ports
//! are forwarded before the wait moves on to the next event.

use futures::StreamExt;
use k8s_openapi::api::core::v1::Endpoints;
use kube::runtime::reflector::{self, Store};
use kube::runtime::watcher::Event;
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, info, warn};

use crate::cluster::WatchStream;
use crate::portforward::PortForwardManager;
use crate::shutdown::Shutdown;
use crate::wait::{ReadinessError, ResourceState, WaitTarget};

/// Whether any subset has at least one ready address
pub fn has_addresses(endpoints: &Endpoints) -> bool {
    endpoints
        .subsets
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|s| s.addresses.as_ref().is_some_and(|a| !a.is_empty()))
}

/// Tracks which configured services have endpoints
pub struct EndpointTracker {
    required: BTreeMap<String, Vec<u16>>,
    writer: reflector::store::Writer<Endpoints>,
    store: Store<Endpoints>,
    ready: BTreeSet<String>,
    forwarded: HashSet<String>,
    transitions: HashMap<String, u32>,
}

impl EndpointTracker {
    /// Track `service -> ports`; a service with no ports is only awaited
    pub fn new(required: BTreeMap<String, Vec<u16>>) -> Self {
        let (store, writer) = reflector::store();
        Self {
            required,
            writer,
            store,
            ready: BTreeSet::new(),
            forwarded: HashSet::new(),
            transitions: HashMap::new(),
        }
    }

    /// Apply one endpoints event
    ///
    /// Returns the services that became ready for the first time and still
    /// need their ports forwarded.
    pub fn observe(&mut self, event: &Event<Endpoints>) -> Vec<String> {
        self.writer.apply_watcher_event(event);

        let ready: BTreeSet<String> = self
            .store
            .state()
            .iter()
            .filter(|ep| self.required.contains_key(&ep.name_any()))
            .filter(|ep| {
                let live = has_addresses(ep);
                if !live {
                    debug!(service = %ep.name_any(), state = %ep.state_description(), "Service not ready");
                }
                live
            })
            .map(|ep| ep.name_any())
            .collect();

        let mut newly_forwarded = Vec::new();
        for service in ready.difference(&self.ready) {
            *self.transitions.entry(service.clone()).or_default() += 1;
            if self.forwarded.insert(service.clone()) {
                info!("SERVICE_READY {service}");
                newly_forwarded.push(service.clone());
            } else {
                debug!(service = %service, "Service ready again");
            }
        }
        for service in self.ready.difference(&ready) {
            warn!(service = %service, "Service lost its endpoints");
        }

        self.ready = ready;
        newly_forwarded
    }

    /// How many times a service went from not ready to ready
    pub fn transitions(&self, service: &str) -> u32 {
        self.transitions.get(service).copied().unwrap_or(0)
    }

    /// Configured services without live addresses right now
    pub fn missing(&self) -> Vec<String> {
        self.required
            .keys()
            .filter(|service| !self.ready.contains(*service))
            .cloned()
            .collect()
    }

    /// Every configured service currently has live addresses
    pub fn is_satisfied(&self) -> bool {
        self.required.keys().all(|service| self.ready.contains(service))
    }

    /// Consume endpoint events until every configured service has live
    /// addresses at the same time
    ///
    /// Each service is forwarded on its first ready transition only.
    /// A port-forward failure ends the wait immediately.
    pub async fn wait(
        &mut self,
        mut events: WatchStream<Endpoints>,
        forwards: &mut PortForwardManager,
        shutdown: &Shutdown,
    ) -> Result<(), ReadinessError> {
        if self.is_satisfied() {
            return Ok(());
        }

        info!(services = ?self.missing(), "Waiting for services");

        let mut received = false;
        loop {
            let event = tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    return Err(shutdown.interrupted(
                        WaitTarget::Services,
                        self.missing(),
                        self.ready.iter().cloned().collect(),
                    ));
                }
                next = events.next() => match next {
                    Some(Ok(event)) => event,
                    Some(Err(e)) if !received => {
                        return Err(ReadinessError::WatchSetup(WaitTarget::Services, e.to_string()));
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Endpoints watch error, retrying");
                        continue;
                    }
                    None => return Err(ReadinessError::WatchClosed(WaitTarget::Services)),
                },
            };
            received = true;

            for service in self.observe(&event) {
                let ports = self.required.get(&service).cloned().unwrap_or_default();
                if ports.is_empty() {
                    continue;
                }
                forwards
                    .forward_service(&service, &ports, shutdown.token())
                    .await?;
            }

            if self.is_satisfied() {
                info!(services = ?self.required.keys().collect::<Vec<_>>(), "All services ready");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterClient;
    use crate::portforward::PortForwardError;
    use crate::protocol::{Emission, Handshake};
    use crate::shutdown::ShutdownReason;
    use crate::testing::{endpoints, FakeCluster};
    use std::sync::Arc;
    use std::time::Duration;

    fn required(pairs: &[(&str, &[u16])]) -> BTreeMap<String, Vec<u16>> {
        pairs
            .iter()
            .map(|(service, ports)| ((*service).to_string(), ports.to_vec()))
            .collect()
    }

    fn forwards(cluster: &Arc<FakeCluster>) -> (PortForwardManager, Arc<Handshake>) {
        let handshake = Arc::new(Handshake::new(tokio::io::sink()));
        let manager = PortForwardManager::new(cluster.clone(), "ns", handshake.clone());
        (manager, handshake)
    }

    #[test]
    fn test_has_addresses() {
        assert!(has_addresses(&endpoints("svc1", &["api-0"])));
        assert!(!has_addresses(&endpoints("svc1", &[])));
        assert!(!has_addresses(&Endpoints::default()));
    }

    #[test]
    fn test_ready_service_is_forwarded_once() {
        let mut tracker = EndpointTracker::new(required(&[("svc1", &[8080])]));
        let ready = Event::Apply(endpoints("svc1", &["api-0"]));

        assert_eq!(tracker.observe(&ready), vec!["svc1"]);
        assert!(tracker.observe(&ready).is_empty());
        assert_eq!(tracker.transitions("svc1"), 1);
        assert!(tracker.is_satisfied());
    }

    #[test]
    fn test_flapping_service_counts_transitions() {
        let mut tracker = EndpointTracker::new(required(&[("svc1", &[8080])]));

        assert_eq!(
            tracker.observe(&Event::Apply(endpoints("svc1", &["api-0"]))),
            vec!["svc1"]
        );
        assert!(tracker
            .observe(&Event::Apply(endpoints("svc1", &[])))
            .is_empty());
        assert!(tracker
            .observe(&Event::Apply(endpoints("svc1", &["api-1"])))
            .is_empty());

        assert_eq!(tracker.transitions("svc1"), 2);
    }

    #[test]
    fn test_service_losing_endpoints_is_missing_again() {
        let mut tracker = EndpointTracker::new(required(&[("svc1", &[8080]), ("svc2", &[80])]));

        tracker.observe(&Event::Apply(endpoints("svc1", &["api-0"])));
        tracker.observe(&Event::Apply(endpoints("svc1", &[])));
        assert_eq!(
            tracker.observe(&Event::Apply(endpoints("svc2", &["web-0"]))),
            vec!["svc2"]
        );

        assert!(!tracker.is_satisfied());
        assert_eq!(tracker.missing(), vec!["svc1"]);

        assert!(tracker
            .observe(&Event::Apply(endpoints("svc1", &["api-1"])))
            .is_empty());
        assert!(tracker.is_satisfied());
    }

    #[test]
    fn test_unconfigured_services_are_ignored() {
        let mut tracker = EndpointTracker::new(required(&[("svc1", &[8080])]));

        assert!(tracker
            .observe(&Event::Apply(endpoints("other", &["x-0"])))
            .is_empty());
        assert_eq!(tracker.missing(), vec!["svc1"]);
    }

    #[tokio::test]
    async fn test_wait_forwards_ready_service() {
        let cluster = Arc::new(FakeCluster::new());
        let shutdown = Shutdown::new(Duration::from_secs(30));
        let (mut manager, handshake) = forwards(&cluster);
        let mut tracker = EndpointTracker::new(required(&[("svc1", &[8080])]));

        cluster.push_endpoints(Event::Apply(endpoints("svc1", &[])));
        cluster.push_endpoints(Event::Apply(endpoints("svc1", &["api-0"])));

        tracker
            .wait(cluster.watch_endpoints("ns"), &mut manager, &shutdown)
            .await
            .unwrap();

        assert_eq!(cluster.forward_calls(), vec![("api-0".to_string(), 8080)]);
        let emitted = handshake.emitted().await;
        assert_eq!(emitted.len(), 1);
        assert!(matches!(
            &emitted[0],
            Emission::Forward { service, remote_port: 8080, .. } if service == "svc1"
        ));
    }

    #[tokio::test]
    async fn test_wait_forwards_flapping_service_once() {
        let cluster = Arc::new(FakeCluster::new());
        let shutdown = Shutdown::new(Duration::from_secs(30));
        let (mut manager, handshake) = forwards(&cluster);
        let mut tracker = EndpointTracker::new(required(&[("svc1", &[8080]), ("svc2", &[80])]));

        cluster.push_endpoints(Event::Apply(endpoints("svc1", &["api-0"])));
        cluster.push_endpoints(Event::Apply(endpoints("svc1", &[])));
        cluster.push_endpoints(Event::Apply(endpoints("svc1", &["api-1"])));
        cluster.push_endpoints(Event::Apply(endpoints("svc2", &["web-0"])));

        tracker
            .wait(cluster.watch_endpoints("ns"), &mut manager, &shutdown)
            .await
            .unwrap();

        assert_eq!(tracker.transitions("svc1"), 2);
        assert_eq!(
            cluster.forward_calls(),
            vec![("api-1".to_string(), 8080), ("web-0".to_string(), 80)]
        );
        let svc1_lines = handshake
            .emitted()
            .await
            .into_iter()
            .filter(|e| matches!(e, Emission::Forward { service, .. } if service == "svc1"))
            .count();
        assert_eq!(svc1_lines, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_needs_every_service_ready_at_once() {
        let cluster = Arc::new(FakeCluster::new());
        let shutdown = Shutdown::new(Duration::from_secs(10));
        shutdown.spawn_deadline();
        let (mut manager, _handshake) = forwards(&cluster);
        let mut tracker = EndpointTracker::new(required(&[("svc1", &[]), ("svc2", &[80])]));

        cluster.push_endpoints(Event::Apply(endpoints("svc1", &["api-0"])));
        cluster.push_endpoints(Event::Apply(endpoints("svc1", &[])));
        cluster.push_endpoints(Event::Apply(endpoints("svc2", &["web-0"])));

        let err = tracker
            .wait(cluster.watch_endpoints("ns"), &mut manager, &shutdown)
            .await
            .unwrap_err();

        match err {
            ReadinessError::Timeout(timeout) => {
                assert_eq!(timeout.missing, vec!["svc1"]);
                assert_eq!(timeout.last_ready, vec!["svc2"]);
            }
            other => panic!("expected timeout, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_wait_fails_fast_on_forward_error() {
        let cluster = Arc::new(FakeCluster::new());
        let shutdown = Shutdown::new(Duration::from_secs(30));
        let (mut manager, _handshake) = forwards(&cluster);
        let mut tracker = EndpointTracker::new(required(&[("svc1", &[8080]), ("svc2", &[80])]));

        cluster.fail_forward_port(8080);
        cluster.push_endpoints(Event::Apply(endpoints("svc1", &["api-0"])));

        let err = tracker
            .wait(cluster.watch_endpoints("ns"), &mut manager, &shutdown)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ReadinessError::PortForward(PortForwardError::Tunnel { port: 8080, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_with_missing_services() {
        let cluster = Arc::new(FakeCluster::new());
        let shutdown = Shutdown::new(Duration::from_secs(10));
        shutdown.spawn_deadline();
        let (mut manager, _handshake) = forwards(&cluster);
        let mut tracker = EndpointTracker::new(required(&[("svc1", &[8080]), ("svc2", &[80])]));

        cluster.push_endpoints(Event::Apply(endpoints("svc1", &["api-0"])));

        let err = tracker
            .wait(cluster.watch_endpoints("ns"), &mut manager, &shutdown)
            .await
            .unwrap_err();

        match err {
            ReadinessError::Timeout(timeout) => {
                assert_eq!(timeout.target, WaitTarget::Services);
                assert_eq!(timeout.missing, vec!["svc2"]);
                assert_eq!(timeout.last_ready, vec!["svc1"]);
            }
            other => panic!("expected timeout, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_wait_cancelled_by_signal() {
        let cluster = Arc::new(FakeCluster::new());
        let shutdown = Shutdown::new(Duration::from_secs(30));
        let (mut manager, _handshake) = forwards(&cluster);
        let mut tracker = EndpointTracker::new(required(&[("svc1", &[8080])]));

        shutdown.trigger(ShutdownReason::Signal);

        let err = tracker
            .wait(cluster.watch_endpoints("ns"), &mut manager, &shutdown)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ReadinessError::Cancelled {
                target: WaitTarget::Services,
                reason: ShutdownReason::Signal,
                ..
            }
        ));
    }
}
