//! Poll Scheduler
//!
//! Owns one [`DeviceLoop`](device_loop::DeviceLoop) task per enabled device
//! and keeps the set of loops in step with the registry through change
//! notifications.

mod device_loop;
mod handle;

pub use handle::{DeviceHandle, DeviceHealth, DeviceStatus, LoopState};

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use bms_types::{CoreError, CoreResult, Device, DeviceId};

use crate::cache::PointValueCache;
use crate::protocol::{AdapterFactory, ProtocolAdapter};
use crate::registry::{ChangeListener, DeviceRegistry, RegistryChange};
use crate::settings::SettingsProvider;
use device_loop::DeviceLoop;
use handle::DeviceCommand;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Consecutive failed polls before a device is reported offline
    pub offline_after: u32,
    /// Upper bound of the transport failure backoff
    pub max_backoff: Duration,
    pub enumerate_timeout: Duration,
    /// How long `stop` and `shutdown` wait for a loop to exit
    pub stop_timeout: Duration,
    /// Queued commands per device
    pub command_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            offline_after: 3,
            max_backoff: Duration::from_secs(300),
            enumerate_timeout: Duration::from_secs(60),
            stop_timeout: Duration::from_secs(10),
            command_capacity: 256,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Running Loop
// ─────────────────────────────────────────────────────────────────────────────

type LoopTask = JoinHandle<Option<mpsc::Receiver<DeviceCommand>>>;

struct RunningLoop {
    handle: DeviceHandle,
    /// Cancelled when the loop is replaced after a reconfiguration
    restart: CancellationToken,
    join: Option<LoopTask>,
}

/// Where a new loop gets its command queue from
enum Queue {
    Fresh(mpsc::Receiver<DeviceCommand>),
    /// Taken over from the loop being replaced once it has exited
    Handover(Option<LoopTask>),
}

// ─────────────────────────────────────────────────────────────────────────────
// Poll Scheduler
// ─────────────────────────────────────────────────────────────────────────────

pub struct PollScheduler {
    registry: Arc<DeviceRegistry>,
    cache: Arc<PointValueCache>,
    factory: Arc<dyn AdapterFactory>,
    settings: Arc<dyn SettingsProvider>,
    config: SchedulerConfig,
    loops: DashMap<DeviceId, RunningLoop>,
    shutdown: CancellationToken,
}

impl PollScheduler {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        cache: Arc<PointValueCache>,
        factory: Arc<dyn AdapterFactory>,
        settings: Arc<dyn SettingsProvider>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            registry,
            cache,
            factory,
            settings,
            config,
            loops: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Override, else the global default, never below the protocol floor
    pub fn effective_interval(&self, device: &Device) -> Duration {
        device.effective_interval(
            self.settings.global_poll_interval(),
            self.settings.interval_floor(device.protocol()),
        )
    }

    /// Start loops for every enabled device. Returns how many are running.
    pub fn start_all(&self) -> usize {
        for device in self.registry.list(None) {
            if device.enabled {
                self.launch_logged(device.id, false);
            }
        }
        self.loops.len()
    }

    /// Start the loop for one device, or return the running one
    pub fn start(&self, device_id: DeviceId) -> CoreResult<Option<DeviceHandle>> {
        self.launch(device_id, false)
    }

    pub fn handle(&self, device_id: DeviceId) -> Option<DeviceHandle> {
        self.loops.get(&device_id).map(|l| l.handle.clone())
    }

    /// Devices with a running loop, ordered by id
    pub fn running(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self.loops.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    /// Recompute a device's interval. Applies from its next scheduled tick.
    pub fn reschedule(&self, device_id: DeviceId) {
        let Some(device) = self.registry.get(device_id) else {
            return;
        };
        if let Some(running) = self.loops.get(&device_id) {
            let interval = self.effective_interval(&device);
            running.handle.set_interval(interval);
            tracing::debug!(
                device_id,
                interval_ms = interval.as_millis() as u64,
                "Device rescheduled"
            );
        }
    }

    /// Recompute every interval, e.g. after the global default changed
    pub fn reschedule_all(&self) {
        for device_id in self.running() {
            self.reschedule(device_id);
        }
    }

    /// Cancel a loop and wait for it to exit
    ///
    /// Commands still queued are answered with `Cancelled`. Returns false when
    /// no loop was running.
    pub async fn stop(&self, device_id: DeviceId) -> bool {
        let Some((_, running)) = self.loops.remove(&device_id) else {
            return false;
        };
        running.handle.cancel();
        if let Some(join) = running.join {
            match tokio::time::timeout(self.config.stop_timeout, join).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    tracing::error!(device_id, error = %e, "Device loop panicked");
                }
                Err(_) => {
                    tracing::warn!(device_id, "Device loop did not stop in time");
                }
            }
        }
        true
    }

    /// Cancel every loop and wait for them to close their transports
    pub async fn shutdown(&self) {
        tracing::info!(loops = self.loops.len(), "Stopping device loops");
        self.shutdown.cancel();

        let ids: Vec<DeviceId> = self.loops.iter().map(|e| *e.key()).collect();
        let joins: Vec<LoopTask> = ids
            .into_iter()
            .filter_map(|id| self.loops.remove(&id))
            .filter_map(|(_, running)| running.join)
            .collect();

        let all = futures::future::join_all(joins);
        if tokio::time::timeout(self.config.stop_timeout, all).await.is_err() {
            tracing::warn!("Some device loops did not stop within timeout");
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Loop Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    fn launch_logged(&self, device_id: DeviceId, restart: bool) {
        if let Err(e) = self.launch(device_id, restart) {
            tracing::error!(device_id, error = %e, "Cannot start device loop");
        }
    }

    /// Start a loop, or replace the running one when `restart` is set
    fn launch(&self, device_id: DeviceId, restart: bool) -> CoreResult<Option<DeviceHandle>> {
        if self.shutdown.is_cancelled() {
            return Err(CoreError::Cancelled(device_id));
        }
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(CoreError::Config("device loops need a tokio runtime".into()));
        }
        let device = self
            .registry
            .get(device_id)
            .ok_or_else(|| CoreError::device_not_found(device_id))?;
        if !device.enabled {
            if self.cancel(device_id) {
                tracing::info!(device_id, "Device disabled");
            }
            return Ok(None);
        }

        // A loop bound to a stale address is worse than none
        let resolved = match self.registry.resolve(device_id) {
            Ok(resolved) => resolved,
            Err(e) => {
                self.cancel(device_id);
                return Err(e);
            }
        };
        let adapter = match self.factory.device_adapter(&resolved) {
            Ok(adapter) => adapter,
            Err(e) => {
                self.cancel(device_id);
                return Err(CoreError::Config(format!("device {}: {}", device_id, e)));
            }
        };
        let interval = self.effective_interval(&device);

        let handle = match self.loops.entry(device_id) {
            Entry::Occupied(mut entry) => {
                if !restart {
                    return Ok(Some(entry.get().handle.clone()));
                }
                let old = entry.get_mut();
                old.restart.cancel();
                let previous = old.join.take();
                let handle = old.handle.clone();
                handle.set_interval(interval);

                let restart = CancellationToken::new();
                let join = self.spawn(
                    resolved,
                    adapter,
                    &handle,
                    restart.clone(),
                    Queue::Handover(previous),
                );
                entry.insert(RunningLoop {
                    handle: handle.clone(),
                    restart,
                    join: Some(join),
                });
                tracing::info!(device_id, "Device loop restarting");
                handle
            }
            Entry::Vacant(entry) => {
                let (command_tx, command_rx) = mpsc::channel(self.config.command_capacity);
                let handle = DeviceHandle::new(
                    device_id,
                    command_tx,
                    interval,
                    self.shutdown.child_token(),
                );
                let restart = CancellationToken::new();
                let join = self.spawn(
                    resolved,
                    adapter,
                    &handle,
                    restart.clone(),
                    Queue::Fresh(command_rx),
                );
                entry.insert(RunningLoop {
                    handle: handle.clone(),
                    restart,
                    join: Some(join),
                });
                handle
            }
        };
        Ok(Some(handle))
    }

    fn spawn(
        &self,
        device: Device,
        adapter: Box<dyn ProtocolAdapter>,
        handle: &DeviceHandle,
        restart: CancellationToken,
        queue: Queue,
    ) -> LoopTask {
        let device_id = device.id;
        let registry = Arc::clone(&self.registry);
        let cache = Arc::clone(&self.cache);
        let config = self.config.clone();
        let stop = handle.stop_token();
        let state = handle.state_cell();
        let health = handle.health_cell();
        let interval_ms = handle.interval_cell();

        tokio::spawn(async move {
            let commands = match queue {
                Queue::Fresh(commands) => commands,
                Queue::Handover(previous) => match previous?.await {
                    Ok(Some(commands)) => commands,
                    Ok(None) => return None,
                    Err(e) => {
                        tracing::error!(device_id, error = %e, "Replaced device loop panicked");
                        return None;
                    }
                },
            };

            DeviceLoop {
                device,
                adapter,
                registry,
                cache,
                commands,
                stop,
                restart,
                state,
                health,
                interval_ms,
                config,
            }
            .run()
            .await
        })
    }

    /// Cancel without waiting. Returns false when no loop was running.
    fn cancel(&self, device_id: DeviceId) -> bool {
        match self.loops.remove(&device_id) {
            Some((_, running)) => {
                running.handle.cancel();
                true
            }
            None => false,
        }
    }
}

impl ChangeListener for PollScheduler {
    fn on_change(&self, change: &RegistryChange) {
        match change {
            RegistryChange::DeviceAdded(device_id) => self.launch_logged(*device_id, false),
            RegistryChange::DeviceUpdated {
                device_id,
                restart: true,
                ..
            } => self.launch_logged(*device_id, true),
            RegistryChange::DeviceUpdated {
                device_id,
                interval_changed: true,
                ..
            } => self.reschedule(*device_id),
            RegistryChange::DeviceRemoved(device_id) => {
                self.cancel(*device_id);
            }
            _ => {}
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Weak;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use bms_types::{
        BacnetAddress, Candidate, DataType, DeviceAddress, ModbusAddress, ModbusTransport,
        ObjectType, Point, Priority, Protocol, Quality, RegisterKind, Value,
    };

    use crate::protocol::{AdapterError, AdapterResult, ReadResults, SimNetwork};
    use crate::settings::StaticSettings;

    struct Fixture {
        registry: Arc<DeviceRegistry>,
        cache: Arc<PointValueCache>,
        scheduler: Arc<PollScheduler>,
    }

    fn fixture(factory: Arc<dyn AdapterFactory>) -> Fixture {
        let registry = DeviceRegistry::new_shared();
        let cache = Arc::new(PointValueCache::new());
        let scheduler = Arc::new(PollScheduler::new(
            Arc::clone(&registry),
            Arc::clone(&cache),
            factory,
            Arc::new(StaticSettings::new(Duration::from_secs(10))),
            SchedulerConfig::default(),
        ));
        let weak: Weak<dyn ChangeListener> = Arc::<PollScheduler>::downgrade(&scheduler);
        registry.subscribe(weak);
        Fixture {
            registry,
            cache,
            scheduler,
        }
    }

    fn ahu(interval: Duration) -> (Device, Point) {
        let device = Device::new(
            1,
            "ahu-1",
            DeviceAddress::Bacnet(BacnetAddress::new(1001)),
        )
        .with_poll_interval(interval);
        let point = Point::bacnet(10, 1, ObjectType::AnalogOutput, 2).writable();
        (device, point)
    }

    fn install(fixture: &Fixture, network: &SimNetwork, device: Device, point: Point) {
        network.seed(&device, std::slice::from_ref(&point));
        fixture.registry.upsert(device).unwrap();
        fixture.registry.upsert_point(point).unwrap();
    }

    async fn advance(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_start_to_start() {
        let network = SimNetwork::new();
        let f = fixture(Arc::new(network.clone()));
        let (device, point) = ahu(Duration::from_secs(2));
        let address = point.address;
        install(&f, &network, device, point);
        network.set_value(1, address, Value::Number(40.0));

        advance(100).await;
        assert_eq!(network.read_count(), 1);
        assert_eq!(f.cache.get(10).unwrap().value, Value::Number(40.0));

        advance(2000).await;
        assert_eq!(network.read_count(), 2);
        advance(4000).await;
        assert_eq!(network.read_count(), 4);
        assert_eq!(f.scheduler.handle(1).unwrap().state(), LoopState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_change_applies_from_next_tick() {
        let network = SimNetwork::new();
        let f = fixture(Arc::new(network.clone()));
        let (device, point) = ahu(Duration::from_secs(2));
        install(&f, &network, device.clone(), point);

        // Ticks at 0 and 2, then change the interval at 3
        advance(3000).await;
        assert_eq!(network.read_count(), 2);
        f.registry
            .upsert(device.with_poll_interval(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(
            f.scheduler.handle(1).unwrap().interval(),
            Duration::from_secs(5)
        );

        // The tick already scheduled for 4 still runs, then every 5s
        advance(1500).await;
        assert_eq!(network.read_count(), 3);
        advance(4400).await;
        assert_eq!(network.read_count(), 3);
        advance(200).await;
        assert_eq!(network.read_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_modbus_device_goes_stale_then_recovers() {
        let network = SimNetwork::new();
        let f = fixture(Arc::new(network.clone()));
        let device = Device::new(
            5,
            "meter-5",
            DeviceAddress::Modbus(
                ModbusAddress::new(5).with_transport(ModbusTransport::tcp("10.0.0.5", 502)),
            ),
        )
        .with_poll_interval(Duration::from_secs(1));
        let point = Point::modbus(50, 5, RegisterKind::HoldingRegister, 0, DataType::UInt16);
        network.seed(&device, std::slice::from_ref(&point));
        network.set_value(5, point.address, Value::Number(230.0));
        f.registry.upsert(device).unwrap();
        f.registry.upsert_point(point).unwrap();

        advance(500).await;
        assert!(f.cache.get(50).unwrap().is_good());

        network.set_offline(5, true);
        advance(3000).await;
        let entry = f.cache.get(50).unwrap();
        assert_eq!(entry.quality, Quality::Stale);
        assert_eq!(entry.value, Value::Number(230.0));

        let handle = f.scheduler.handle(5).unwrap();
        let health = handle.health();
        assert_eq!(health.status, DeviceStatus::Offline);
        assert_eq!(health.consecutive_failures, 3);
        assert_eq!(health.polls, 4);
        assert!(!handle.state().is_terminal());

        network.set_offline(5, false);
        advance(1000).await;
        assert!(f.cache.get(50).unwrap().is_good());
        assert_eq!(handle.health().status, DeviceStatus::Online);
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_and_polls_never_overlap() {
        let network = SimNetwork::new().with_latency(Duration::from_millis(300));
        let f = fixture(Arc::new(network.clone()));
        let (device, point) = ahu(Duration::from_secs(1));
        install(&f, &network, device, point);
        let point = f.registry.point(10).unwrap();
        let handle = f.scheduler.handle(1).unwrap();

        let writes: Vec<_> = (0..5)
            .map(|i| {
                let handle = handle.clone();
                let point = Arc::clone(&point);
                tokio::spawn(async move {
                    handle
                        .write(point, Some(Value::Number(f64::from(i))), Priority::new(8).ok())
                        .await
                })
            })
            .collect();
        for write in futures::future::join_all(writes).await {
            assert!(write.unwrap().is_ok());
        }

        assert_eq!(network.write_count(), 5);
        assert_eq!(network.max_concurrency(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_point_removed_mid_read_stays_evicted() {
        let network = SimNetwork::new().with_latency(Duration::from_millis(300));
        let f = fixture(Arc::new(network.clone()));
        let weak: Weak<dyn ChangeListener> = Arc::<PointValueCache>::downgrade(&f.cache);
        f.registry.subscribe(weak);
        let (device, point) = ahu(Duration::from_secs(1));
        install(&f, &network, device, point);

        // First poll is on the wire until 300ms
        advance(100).await;
        assert!(f.cache.get(10).is_none());
        f.registry.remove_point(10).unwrap();

        advance(2000).await;
        assert!(network.read_count() >= 1);
        assert!(f.cache.get(10).is_none());
        assert!(f.cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_queued_writes() {
        let network = SimNetwork::new().with_latency(Duration::from_secs(1));
        let f = fixture(Arc::new(network.clone()));
        let (device, point) = ahu(Duration::from_secs(5));
        install(&f, &network, device, point);
        let point = f.registry.point(10).unwrap();
        let handle = f.scheduler.handle(1).unwrap();

        // First poll is on the wire; queue writes behind it
        advance(10).await;
        let writes: Vec<_> = (0..3)
            .map(|_| {
                let handle = handle.clone();
                let point = Arc::clone(&point);
                tokio::spawn(async move { handle.write(point, Some(Value::Number(1.0)), None).await })
            })
            .collect();
        advance(10).await;

        assert!(f.scheduler.stop(1).await);
        for write in futures::future::join_all(writes).await {
            assert_eq!(write.unwrap(), Err(CoreError::Cancelled(1)));
        }
        assert_eq!(handle.state(), LoopState::Stopped);
        assert_eq!(network.write_count(), 0);
        // The poll finished after cancellation and was discarded
        assert!(f.cache.get(10).is_none());
        assert!(!f.scheduler.stop(1).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_keeps_handle_and_queue() {
        let network = SimNetwork::new();
        let f = fixture(Arc::new(network.clone()));
        let (device, point) = ahu(Duration::from_secs(2));
        install(&f, &network, device.clone(), point);
        advance(100).await;
        let handle = f.scheduler.handle(1).unwrap();

        let mut moved = device;
        moved.address = DeviceAddress::Bacnet(BacnetAddress::new(1001).with_endpoint("10.0.0.7"));
        f.registry.upsert(moved).unwrap();

        let point = f.registry.point(10).unwrap();
        let refreshed = handle
            .write(point, Some(Value::Number(55.0)), None)
            .await
            .unwrap();
        assert_eq!(refreshed, Some(Value::Number(55.0)));
        assert!(!handle.is_stopped());
        assert_eq!(f.scheduler.running(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_stops_loop_and_enable_restarts() {
        let network = SimNetwork::new();
        let f = fixture(Arc::new(network.clone()));
        let (device, point) = ahu(Duration::from_secs(1));
        install(&f, &network, device.clone(), point);
        advance(100).await;
        let first = f.scheduler.handle(1).unwrap();

        f.registry.upsert(device.clone().disabled()).unwrap();
        advance(100).await;
        assert!(f.scheduler.handle(1).is_none());
        assert_eq!(first.state(), LoopState::Stopped);
        let reads = network.read_count();
        advance(3000).await;
        assert_eq!(network.read_count(), reads);

        f.registry.upsert(device).unwrap();
        advance(100).await;
        assert!(f.scheduler.handle(1).is_some());
        assert_eq!(network.read_count(), reads + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_every_loop() {
        let network = SimNetwork::new();
        let f = fixture(Arc::new(network.clone()));
        let (device, point) = ahu(Duration::from_secs(1));
        install(&f, &network, device, point);
        let handle = f.scheduler.handle(1).unwrap();

        f.scheduler.shutdown().await;
        assert!(f.scheduler.is_empty());
        assert_eq!(handle.state(), LoopState::Stopped);
        assert!(matches!(f.scheduler.start(1), Err(CoreError::Cancelled(1))));
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Transport failures
    // ─────────────────────────────────────────────────────────────────────────

    #[derive(Default)]
    struct BrokenLink {
        reads: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ProtocolAdapter for BrokenLink {
        fn protocol(&self) -> Protocol {
            Protocol::Modbus
        }

        async fn read(&mut self, _points: &[Arc<Point>]) -> AdapterResult<ReadResults> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Err(AdapterError::Transport("connection refused".into()))
        }

        async fn write(
            &mut self,
            _point: &Point,
            _value: Option<&Value>,
            _priority: Option<Priority>,
        ) -> AdapterResult<()> {
            Err(AdapterError::Transport("connection refused".into()))
        }

        async fn discover(&mut self, _timeout: Duration) -> AdapterResult<Vec<Candidate>> {
            Ok(Vec::new())
        }

        async fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct BrokenFactory {
        reads: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    impl AdapterFactory for BrokenFactory {
        fn device_adapter(&self, _device: &Device) -> AdapterResult<Box<dyn ProtocolAdapter>> {
            Ok(Box::new(BrokenLink {
                reads: Arc::clone(&self.reads),
                closes: Arc::clone(&self.closes),
            }))
        }

        fn discovery_adapter(&self, _protocol: Protocol) -> AdapterResult<Box<dyn ProtocolAdapter>> {
            Ok(Box::new(BrokenLink::default()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failures_back_off() {
        let factory = Arc::new(BrokenFactory::default());
        let reads = Arc::clone(&factory.reads);
        let closes = Arc::clone(&factory.closes);
        let f = fixture(factory);

        let device = Device::new(
            5,
            "meter-5",
            DeviceAddress::Modbus(
                ModbusAddress::new(5).with_transport(ModbusTransport::tcp("10.0.0.5", 502)),
            ),
        )
        .with_poll_interval(Duration::from_secs(1));
        f.registry.upsert(device).unwrap();
        f.registry
            .upsert_point(Point::modbus(50, 5, RegisterKind::HoldingRegister, 0, DataType::UInt16))
            .unwrap();

        // Attempts at 0, 1, ~3 and ~7 instead of every second
        advance(5000).await;
        assert_eq!(reads.load(Ordering::SeqCst), 3);
        assert!(closes.load(Ordering::SeqCst) >= 3);

        let handle = f.scheduler.handle(5).unwrap();
        assert_eq!(handle.state(), LoopState::Backoff);
        assert_eq!(handle.health().status, DeviceStatus::Offline);
        // No cache entry was ever created
        assert!(f.cache.get(50).is_none());
    }

    #[test]
    fn test_loops_need_a_runtime() {
        let network = SimNetwork::new();
        let f = fixture(Arc::new(network));
        let (device, _) = ahu(Duration::from_secs(1));
        f.registry.upsert(device).unwrap();
        assert!(f.scheduler.is_empty());
        assert!(matches!(f.scheduler.start(1), Err(CoreError::Config(_))));
    }
}
