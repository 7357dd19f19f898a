//! Discovery Coordinator
//!
//! On-demand device discovery. Each run gets its own adapter and closes it
//! before returning, so runs never share sockets and never touch the
//! registry.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bms_types::{Candidate, CoreError, CoreResult, Protocol};

use crate::audit::{AuditEvent, AuditKind, AuditOutcome, AuditSink};
use crate::protocol::{AdapterError, AdapterFactory};

pub const MIN_DISCOVERY_TIMEOUT: Duration = Duration::from_millis(100);
pub const MAX_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(60);

/// Slack on top of the collection window before a run is abandoned
const DISCOVERY_GRACE: Duration = Duration::from_secs(2);

pub struct DiscoveryCoordinator {
    factory: Arc<dyn AdapterFactory>,
    audit: Arc<dyn AuditSink>,
}

impl DiscoveryCoordinator {
    pub fn new(factory: Arc<dyn AdapterFactory>, audit: Arc<dyn AuditSink>) -> Self {
        Self { factory, audit }
    }

    /// Clamp a requested collection window to the supported range
    pub fn clamp_timeout(timeout: Duration) -> Duration {
        timeout.clamp(MIN_DISCOVERY_TIMEOUT, MAX_DISCOVERY_TIMEOUT)
    }

    /// Collect candidates for `timeout`, deduplicated by identity in the order
    /// they were first seen
    pub async fn discover(
        &self,
        protocol: Protocol,
        timeout: Duration,
        actor: Option<&str>,
    ) -> CoreResult<Vec<Candidate>> {
        let window = Self::clamp_timeout(timeout);
        tracing::info!(%protocol, window_ms = window.as_millis() as u64, "Discovery started");

        let result = self.run(protocol, window).await;

        let outcome = match &result {
            Ok(_) => AuditOutcome::Ok,
            Err(e) => AuditOutcome::Failed(e.to_string()),
        };
        let mut event = AuditEvent::new(AuditKind::Discovery, format!("discovery:{}", protocol), outcome)
            .with_actor(actor);
        if let Ok(candidates) = &result {
            event = event.with_detail(format!("{} candidates", candidates.len()));
        }
        self.audit.persist(event);

        match &result {
            Ok(candidates) => {
                tracing::info!(%protocol, candidates = candidates.len(), "Discovery finished")
            }
            Err(e) => tracing::warn!(%protocol, error = %e, "Discovery failed"),
        }
        result
    }

    async fn run(&self, protocol: Protocol, window: Duration) -> CoreResult<Vec<Candidate>> {
        let mut adapter = self
            .factory
            .discovery_adapter(protocol)
            .map_err(discovery_error)?;

        let result = tokio::time::timeout(window + DISCOVERY_GRACE, adapter.discover(window)).await;
        adapter.close().await;

        let candidates = match result {
            Ok(Ok(candidates)) => candidates,
            Ok(Err(e)) => return Err(discovery_error(e)),
            // Nothing usable was collected in time
            Err(_) => Vec::new(),
        };

        let mut seen = HashSet::new();
        Ok(candidates
            .into_iter()
            .filter(|c| seen.insert(c.identity()))
            .collect())
    }
}

/// Discovery failures are local: the listening context could not be set up
fn discovery_error(err: AdapterError) -> CoreError {
    match err {
        AdapterError::Unsupported(message) => CoreError::Unsupported(message),
        other => CoreError::Config(format!("discovery unavailable: {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bms_types::{BacnetAddress, DeviceAddress, ModbusAddress};
    use tokio_test::assert_ok;

    use crate::audit::BroadcastAuditSink;
    use crate::protocol::bacnet::tests::{FakeDevice, loopback_config, sample_behavior};
    use crate::protocol::{ModbusProbeConfig, SimNetwork, WireAdapterFactory};

    fn bacnet_candidate(instance: u32) -> Candidate {
        Candidate::new(DeviceAddress::Bacnet(BacnetAddress::new(instance)))
    }

    #[test]
    fn test_timeout_is_clamped() {
        assert_eq!(
            DiscoveryCoordinator::clamp_timeout(Duration::ZERO),
            MIN_DISCOVERY_TIMEOUT
        );
        assert_eq!(
            DiscoveryCoordinator::clamp_timeout(Duration::from_secs(3600)),
            MAX_DISCOVERY_TIMEOUT
        );
        assert_eq!(
            DiscoveryCoordinator::clamp_timeout(Duration::from_secs(3)),
            Duration::from_secs(3)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_back_to_back_runs_return_the_same_candidates() {
        let network = SimNetwork::new().with_latency(Duration::from_millis(200));
        network.add_candidate(bacnet_candidate(1001));
        network.add_candidate(bacnet_candidate(1002));
        network.add_candidate(Candidate::new(DeviceAddress::Modbus(ModbusAddress::new(5))));

        let sink = BroadcastAuditSink::new(16);
        let mut events = sink.subscribe();
        let discovery = DiscoveryCoordinator::new(Arc::new(network), Arc::new(sink));

        let first = assert_ok!(
            discovery
                .discover(Protocol::Bacnet, Duration::from_secs(1), Some("operator"))
                .await
        );
        let second = assert_ok!(
            discovery
                .discover(Protocol::Bacnet, Duration::from_secs(1), None)
                .await
        );
        assert_eq!(first.len(), 2);
        assert_eq!(first, second);

        let event = events.try_recv().unwrap();
        assert_eq!(event.kind, AuditKind::Discovery);
        assert_eq!(event.actor, "operator");
        assert_eq!(event.detail.as_deref(), Some("2 candidates"));
        assert_eq!(events.try_recv().unwrap().actor, "system");
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_runs_do_not_interfere() {
        let network = SimNetwork::new().with_latency(Duration::from_millis(500));
        network.add_candidate(bacnet_candidate(7));
        let discovery = Arc::new(DiscoveryCoordinator::new(
            Arc::new(network),
            Arc::new(BroadcastAuditSink::default()),
        ));

        let runs: Vec<_> = (0..4)
            .map(|_| {
                let discovery = Arc::clone(&discovery);
                tokio::spawn(async move {
                    discovery
                        .discover(Protocol::Bacnet, Duration::from_secs(1), None)
                        .await
                })
            })
            .collect();
        for run in futures::future::join_all(runs).await {
            let candidates = run.unwrap().unwrap();
            assert_eq!(candidates.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_bacnet_runs_release_the_listener_and_dedupe_replies() {
        let mut behavior = sample_behavior();
        behavior.i_am_copies = 3;
        let device = FakeDevice::spawn(behavior).await;

        let port = std::net::UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let mut config = loopback_config();
        config.port = port;
        config.broadcast = Some(device.addr.to_string());
        let factory = WireAdapterFactory::new(config, ModbusProbeConfig::default());
        let discovery = DiscoveryCoordinator::new(
            Arc::new(factory),
            Arc::new(BroadcastAuditSink::default()),
        );

        for _ in 0..2 {
            let candidates = assert_ok!(
                discovery
                    .discover(Protocol::Bacnet, Duration::from_millis(200), None)
                    .await
            );
            assert_eq!(candidates.len(), 1);
            assert_eq!(candidates[0].identity(), "bacnet:1001");
        }

        // Nothing from either run still holds the configured port
        assert_ok!(std::net::UdpSocket::bind(("127.0.0.1", port)));
    }
}
