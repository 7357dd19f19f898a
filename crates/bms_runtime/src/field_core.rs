//! Field Core
//!
//! The public face of the runtime. Wires the registry, cache, scheduler,
//! dispatcher and discovery coordinator together and exposes the operations
//! callers use.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use bms_types::{
    Candidate, CoreError, CoreResult, Device, DeviceId, Point, PointAddress, PointId,
    PointTemplate, Priority, Protocol, Quality, Value, WriteCommand, WriteOutcome,
};

use crate::audit::{AuditSink, TracingAuditSink};
use crate::cache::PointValueCache;
use crate::discovery::DiscoveryCoordinator;
use crate::dispatcher::CommandDispatcher;
use crate::protocol::AdapterFactory;
use crate::registry::{ChangeListener, DeviceRegistry};
use crate::scheduler::{DeviceHealth, LoopState, PollScheduler, SchedulerConfig};
use crate::settings::{SettingsProvider, StaticSettings};

// ─────────────────────────────────────────────────────────────────────────────
// Snapshots
// ─────────────────────────────────────────────────────────────────────────────

/// Cached state of one point
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PointReading {
    pub point_id: PointId,
    pub name: String,
    pub address: PointAddress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    pub writable: bool,
    /// `None` until the first successful read
    pub value: Option<Value>,
    pub quality: Option<Quality>,
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceHealthReport {
    pub device_id: DeviceId,
    pub name: String,
    pub protocol: Protocol,
    pub enabled: bool,
    pub state: LoopState,
    /// Interval the loop schedules with; absent when no loop is running
    pub interval_ms: Option<u64>,
    #[serde(flatten)]
    pub health: DeviceHealth,
}

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

pub struct FieldCoreBuilder {
    factory: Arc<dyn AdapterFactory>,
    settings: Arc<dyn SettingsProvider>,
    audit: Arc<dyn AuditSink>,
    config: SchedulerConfig,
}

impl FieldCoreBuilder {
    pub fn with_settings(mut self, settings: Arc<dyn SettingsProvider>) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_scheduler_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> FieldCore {
        let registry = DeviceRegistry::new_shared();
        let cache = Arc::new(PointValueCache::new());
        let scheduler = Arc::new(PollScheduler::new(
            Arc::clone(&registry),
            Arc::clone(&cache),
            Arc::clone(&self.factory),
            self.settings,
            self.config.clone(),
        ));
        let dispatcher = Arc::new(CommandDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&scheduler),
            Arc::clone(&cache),
            Arc::clone(&self.audit),
        ));

        // Cache and dispatcher first so evictions precede any loop restart
        let cache_listener: Weak<dyn ChangeListener> = Arc::<PointValueCache>::downgrade(&cache);
        let dispatcher_listener: Weak<dyn ChangeListener> = Arc::<CommandDispatcher>::downgrade(&dispatcher);
        let scheduler_listener: Weak<dyn ChangeListener> = Arc::<PollScheduler>::downgrade(&scheduler);
        registry.subscribe(cache_listener);
        registry.subscribe(dispatcher_listener);
        registry.subscribe(scheduler_listener);

        FieldCore {
            discovery: DiscoveryCoordinator::new(Arc::clone(&self.factory), self.audit),
            registry,
            cache,
            scheduler,
            dispatcher,
            factory: self.factory,
            config: self.config,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Field Core
// ─────────────────────────────────────────────────────────────────────────────

pub struct FieldCore {
    registry: Arc<DeviceRegistry>,
    cache: Arc<PointValueCache>,
    scheduler: Arc<PollScheduler>,
    dispatcher: Arc<CommandDispatcher>,
    discovery: DiscoveryCoordinator,
    factory: Arc<dyn AdapterFactory>,
    config: SchedulerConfig,
}

impl FieldCore {
    /// Start building a core on top of an adapter factory
    pub fn builder(factory: Arc<dyn AdapterFactory>) -> FieldCoreBuilder {
        FieldCoreBuilder {
            factory,
            settings: Arc::new(StaticSettings::default()),
            audit: Arc::new(TracingAuditSink),
            config: SchedulerConfig::default(),
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &Arc<PollScheduler> {
        &self.scheduler
    }

    /// Start polling every enabled device already in the registry
    pub fn start(&self) -> usize {
        let running = self.scheduler.start_all();
        tracing::info!(devices = self.registry.len(), running, "Polling started");
        running
    }

    /// Cancel every loop and close all transports
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        tracing::info!("Field core stopped");
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reads & Writes
    // ─────────────────────────────────────────────────────────────────────────

    /// Cached values of every point of a device. Never triggers a poll.
    pub fn read_device_points(&self, device_id: DeviceId) -> CoreResult<Vec<PointReading>> {
        if !self.registry.contains(device_id) {
            return Err(CoreError::device_not_found(device_id));
        }
        Ok(self
            .registry
            .points_for(device_id)
            .into_iter()
            .map(|point| self.reading(&point))
            .collect())
    }

    fn reading(&self, point: &Point) -> PointReading {
        let cached = self.cache.get(point.id);
        PointReading {
            point_id: point.id,
            name: point.name.clone(),
            address: point.address,
            units: point.units.clone(),
            writable: point.is_writable(),
            value: cached.as_ref().map(|c| c.value.clone()),
            quality: cached.as_ref().map(|c| c.quality),
            timestamp: cached.as_ref().map(|c| c.timestamp),
            error: cached.and_then(|c| c.error),
        }
    }

    /// Write a value (or relinquish with `None`) to a point of a device
    pub async fn write_point(
        &self,
        device_id: DeviceId,
        point_id: PointId,
        value: Option<Value>,
        priority: Option<u8>,
    ) -> CoreResult<WriteOutcome> {
        let priority = priority.map(Priority::new).transpose()?;
        let command = WriteCommand {
            point_id,
            value,
            priority,
            actor: None,
        };
        self.dispatcher.submit_for(device_id, command).await
    }

    /// Submit a prepared command, e.g. one carrying an actor
    pub async fn submit(&self, command: WriteCommand) -> CoreResult<WriteOutcome> {
        self.dispatcher.submit(command).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Discovery
    // ─────────────────────────────────────────────────────────────────────────

    /// Look for devices on the wire. The registry is left untouched.
    pub async fn discover_devices(
        &self,
        protocol: Protocol,
        timeout_ms: u64,
    ) -> CoreResult<Vec<Candidate>> {
        self.discovery
            .discover(protocol, Duration::from_millis(timeout_ms), None)
            .await
    }

    /// Enumerate the objects of a device for the caller to persist as points
    ///
    /// Runs on the device's loop when it has one, otherwise on a short-lived
    /// adapter.
    pub async fn sync_device_points(&self, device_id: DeviceId) -> CoreResult<Vec<PointTemplate>> {
        if !self.registry.contains(device_id) {
            return Err(CoreError::device_not_found(device_id));
        }
        if let Some(handle) = self.scheduler.handle(device_id) {
            return handle.enumerate().await;
        }

        let device = self.registry.resolve(device_id)?;
        let mut adapter = self
            .factory
            .device_adapter(&device)
            .map_err(|e| CoreError::Config(format!("device {}: {}", device_id, e)))?;
        let result = tokio::time::timeout(self.config.enumerate_timeout, adapter.enumerate()).await;
        adapter.close().await;
        match result {
            Ok(templates) => templates.map_err(|e| e.into_core(device_id)),
            Err(_) => Err(CoreError::Timeout(device_id)),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Registry
    // ─────────────────────────────────────────────────────────────────────────

    pub fn upsert_device(&self, device: Device) -> CoreResult<()> {
        self.registry.upsert(device)
    }

    /// Stop the device's loop, answering its queued writes with `Cancelled`,
    /// then remove it with its points
    pub async fn delete_device(&self, device_id: DeviceId) -> CoreResult<Device> {
        if !self.registry.contains(device_id) {
            return Err(CoreError::device_not_found(device_id));
        }
        self.scheduler.stop(device_id).await;
        let device = self.registry.delete(device_id)?;
        tracing::info!(device_id, device = %device.name, "Device deleted");
        Ok(device)
    }

    pub fn upsert_point(&self, point: Point) -> CoreResult<()> {
        self.registry.upsert_point(point)
    }

    pub fn remove_point(&self, point_id: PointId) -> CoreResult<Arc<Point>> {
        self.registry.remove_point(point_id)
    }

    /// Apply a changed global poll interval to every running loop
    pub fn refresh_intervals(&self) {
        self.scheduler.reschedule_all();
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Health
    // ─────────────────────────────────────────────────────────────────────────

    pub fn device_health(&self, device_id: DeviceId) -> CoreResult<DeviceHealthReport> {
        let device = self
            .registry
            .get(device_id)
            .ok_or_else(|| CoreError::device_not_found(device_id))?;
        let handle = self.scheduler.handle(device_id);
        Ok(DeviceHealthReport {
            device_id,
            name: device.name.clone(),
            protocol: device.protocol(),
            enabled: device.enabled,
            state: handle.as_ref().map_or(LoopState::Stopped, |h| h.state()),
            interval_ms: handle.as_ref().map(|h| h.interval().as_millis() as u64),
            health: handle.map(|h| h.health()).unwrap_or_default(),
        })
    }

    /// Health of every registered device, ordered by id
    pub fn health_overview(&self) -> Vec<DeviceHealthReport> {
        self.registry
            .list(None)
            .into_iter()
            .filter_map(|d| self.device_health(d.id).ok())
            .collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
