//! Simulated Field Network
//!
//! In-memory devices behind the adapter interface. Backs `--simulate` runs
//! and the runtime tests. BACnet commandable objects keep a real priority
//! array so relinquish behaves like a field controller.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;

use bms_types::{
    Candidate, DataType, Device, DeviceId, Point, PointAddress, PointTemplate, Priority,
    PriorityArray, Protocol, Value,
};

use super::{
    AdapterError, AdapterFactory, AdapterResult, PointError, ProtocolAdapter, ReadResults,
};

#[derive(Debug, Clone)]
struct SimObject {
    name: String,
    data_type: DataType,
    /// Present value of non-commandable objects
    value: Value,
    priority: Option<PriorityArray>,
}

impl SimObject {
    fn present_value(&self) -> Option<Value> {
        match &self.priority {
            Some(array) => array.effective().cloned(),
            None => Some(self.value.clone()),
        }
    }
}

#[derive(Default)]
struct SimInner {
    objects: DashMap<(DeviceId, PointAddress), SimObject>,
    offline: DashMap<DeviceId, ()>,
    candidates: RwLock<Vec<Candidate>>,
    latency: RwLock<Duration>,
    in_flight: DashMap<DeviceId, usize>,
    max_in_flight: AtomicUsize,
    reads: AtomicU64,
    writes: AtomicU64,
}

/// Shared state of all simulated devices
#[derive(Clone, Default)]
pub struct SimNetwork {
    inner: Arc<SimInner>,
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every operation takes this long
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.inner.latency.write() = latency;
        self
    }

    /// Create objects for a device's points with zero values and make the
    /// device discoverable.
    pub fn seed(&self, device: &Device, points: &[Point]) {
        for point in points {
            let zero = match point.data_type {
                DataType::Boolean => Value::Bool(false),
                DataType::Text => Value::Text(String::new()),
                _ => Value::Number(0.0),
            };
            self.add_object(device.id, point.address, point.name.clone(), point.data_type, zero);
        }
        self.add_candidate(Candidate::new(device.address.clone()));
    }

    pub fn add_object(
        &self,
        device_id: DeviceId,
        address: PointAddress,
        name: impl Into<String>,
        data_type: DataType,
        value: Value,
    ) {
        let commandable = matches!(
            address,
            PointAddress::Bacnet { object_type, .. } if object_type.is_commandable()
        );
        let object = SimObject {
            name: name.into(),
            data_type,
            value: value.clone(),
            priority: commandable.then(|| PriorityArray::with_relinquish_default(value)),
        };
        self.inner.objects.insert((device_id, address), object);
    }

    /// Change a value as if the field had changed it
    pub fn set_value(&self, device_id: DeviceId, address: PointAddress, value: Value) {
        if let Some(mut object) = self.inner.objects.get_mut(&(device_id, address)) {
            match object.priority.as_mut() {
                Some(array) => array.set_relinquish_default(Some(value)),
                None => object.value = value,
            }
        }
    }

    pub fn value(&self, device_id: DeviceId, address: PointAddress) -> Option<Value> {
        self.inner
            .objects
            .get(&(device_id, address))
            .and_then(|o| o.present_value())
    }

    /// Priority array of a commandable object
    pub fn priority_array(&self, device_id: DeviceId, address: PointAddress) -> Option<PriorityArray> {
        self.inner
            .objects
            .get(&(device_id, address))
            .and_then(|o| o.priority.clone())
    }

    /// Offline devices time out on every operation
    pub fn set_offline(&self, device_id: DeviceId, offline: bool) {
        if offline {
            self.inner.offline.insert(device_id, ());
        } else {
            self.inner.offline.remove(&device_id);
        }
    }

    pub fn add_candidate(&self, candidate: Candidate) {
        let mut candidates = self.inner.candidates.write();
        if !candidates.iter().any(|c| c.identity() == candidate.identity()) {
            candidates.push(candidate);
        }
    }

    pub fn read_count(&self) -> u64 {
        self.inner.reads.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> u64 {
        self.inner.writes.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous operations seen on any one device
    pub fn max_concurrency(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }

    fn latency(&self) -> Duration {
        *self.inner.latency.read()
    }

    async fn operation(&self, device_id: DeviceId) -> AdapterResult<InFlight> {
        let guard = InFlight::enter(Arc::clone(&self.inner), device_id);
        let latency = self.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.inner.offline.contains_key(&device_id) {
            return Err(AdapterError::Timeout(latency));
        }
        Ok(guard)
    }
}

impl AdapterFactory for SimNetwork {
    fn device_adapter(&self, device: &Device) -> AdapterResult<Box<dyn ProtocolAdapter>> {
        Ok(Box::new(SimAdapter {
            network: self.clone(),
            protocol: device.protocol(),
            device_id: Some(device.id),
        }))
    }

    fn discovery_adapter(&self, protocol: Protocol) -> AdapterResult<Box<dyn ProtocolAdapter>> {
        Ok(Box::new(SimAdapter {
            network: self.clone(),
            protocol,
            device_id: None,
        }))
    }
}

/// Tracks concurrent operations per device
struct InFlight {
    inner: Arc<SimInner>,
    device_id: DeviceId,
}

impl InFlight {
    fn enter(inner: Arc<SimInner>, device_id: DeviceId) -> Self {
        let now = {
            let mut count = inner.in_flight.entry(device_id).or_insert(0);
            *count += 1;
            *count
        };
        inner.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self { inner, device_id }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Some(mut count) = self.inner.in_flight.get_mut(&self.device_id) {
            *count = count.saturating_sub(1);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Adapter
// ─────────────────────────────────────────────────────────────────────────────

pub struct SimAdapter {
    network: SimNetwork,
    protocol: Protocol,
    device_id: Option<DeviceId>,
}

impl SimAdapter {
    fn device_id(&self) -> AdapterResult<DeviceId> {
        self.device_id
            .ok_or_else(|| AdapterError::Unsupported("adapter is not bound to a device".into()))
    }
}

#[async_trait]
impl ProtocolAdapter for SimAdapter {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    async fn read(&mut self, points: &[Arc<Point>]) -> AdapterResult<ReadResults> {
        let device_id = self.device_id()?;
        let _guard = self.network.operation(device_id).await?;
        self.network.inner.reads.fetch_add(1, Ordering::SeqCst);

        Ok(points
            .iter()
            .map(|point| {
                let result = self
                    .network
                    .inner
                    .objects
                    .get(&(device_id, point.address))
                    .ok_or_else(|| PointError::new("unknown object"))
                    .and_then(|o| {
                        o.present_value()
                            .ok_or_else(|| PointError::new("present-value is null"))
                    });
                (point.id, result)
            })
            .collect())
    }

    async fn write(
        &mut self,
        point: &Point,
        value: Option<&Value>,
        priority: Option<Priority>,
    ) -> AdapterResult<()> {
        let device_id = self.device_id()?;
        let _guard = self.network.operation(device_id).await?;
        self.network.inner.writes.fetch_add(1, Ordering::SeqCst);

        let mut object = self
            .network
            .inner
            .objects
            .get_mut(&(device_id, point.address))
            .ok_or_else(|| AdapterError::Remote("object:unknown-object".into()))?;
        match (object.priority.as_mut(), value) {
            (Some(array), value) => {
                array.write(priority.unwrap_or(Priority::LOWEST), value.cloned());
            }
            (None, Some(value)) => object.value = value.clone(),
            (None, None) => {
                return Err(AdapterError::Unsupported(
                    "object has no priority array".into(),
                ));
            }
        }
        Ok(())
    }

    async fn discover(&mut self, timeout: Duration) -> AdapterResult<Vec<Candidate>> {
        let latency = self.network.latency().min(timeout);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(self
            .network
            .inner
            .candidates
            .read()
            .iter()
            .filter(|c| c.protocol == self.protocol)
            .cloned()
            .collect())
    }

    async fn enumerate(&mut self) -> AdapterResult<Vec<PointTemplate>> {
        let device_id = self.device_id()?;
        let _guard = self.network.operation(device_id).await?;
        let mut templates: Vec<PointTemplate> = self
            .network
            .inner
            .objects
            .iter()
            .filter(|entry| entry.key().0 == device_id)
            .map(|entry| PointTemplate {
                name: entry.name.clone(),
                address: entry.key().1,
                data_type: entry.data_type,
                writable: entry.key().1.supports_write(),
                units: None,
            })
            .collect();
        templates.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(templates)
    }

    async fn close(&mut self) {}
}
