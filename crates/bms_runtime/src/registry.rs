//! Device Registry
//!
//! Holds the known devices and their points. Every mutation that affects
//! polling is announced to registered [`ChangeListener`]s after the registry
//! state has been updated.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::RwLock;

use bms_types::{
    CoreError, CoreResult, Device, DeviceAddress, DeviceId, Point, PointId, Protocol,
    ValidationError,
};

// ─────────────────────────────────────────────────────────────────────────────
// Change Notifications
// ─────────────────────────────────────────────────────────────────────────────

/// Scheduling-relevant registry mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryChange {
    DeviceAdded(DeviceId),
    DeviceUpdated {
        device_id: DeviceId,
        /// Only the poll interval changed
        interval_changed: bool,
        /// Addressing, tuning, parent or enabled flag changed
        restart: bool,
    },
    /// Emitted before the device's points are removed
    DeviceRemoved(DeviceId),
    PointsChanged(DeviceId),
    PointsRemoved {
        device_id: DeviceId,
        point_ids: Vec<PointId>,
    },
}

/// Receives registry changes. Called synchronously without registry locks held.
pub trait ChangeListener: Send + Sync + 'static {
    fn on_change(&self, change: &RegistryChange);
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct DeviceRegistry {
    devices: DashMap<DeviceId, Device>,
    points: DashMap<PointId, Arc<Point>>,
    device_points: DashMap<DeviceId, BTreeSet<PointId>>,
    listeners: RwLock<Vec<Weak<dyn ChangeListener>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a listener. Held weakly; dropped listeners are pruned.
    pub fn subscribe(&self, listener: Weak<dyn ChangeListener>) {
        self.listeners.write().push(listener);
    }

    fn notify(&self, change: RegistryChange) {
        let listeners: Vec<Arc<dyn ChangeListener>> = {
            let mut guard = self.listeners.write();
            guard.retain(|l| l.strong_count() > 0);
            guard.iter().filter_map(Weak::upgrade).collect()
        };
        tracing::trace!(?change, listeners = listeners.len(), "Registry change");
        for listener in listeners {
            listener.on_change(&change);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Devices
    // ─────────────────────────────────────────────────────────────────────────

    pub fn get(&self, id: DeviceId) -> Option<Device> {
        self.devices.get(&id).map(|d| d.clone())
    }

    pub fn contains(&self, id: DeviceId) -> bool {
        self.devices.contains_key(&id)
    }

    /// Devices ordered by id, optionally limited to one protocol
    pub fn list(&self, protocol: Option<Protocol>) -> Vec<Device> {
        let mut devices: Vec<Device> = self
            .devices
            .iter()
            .filter(|d| protocol.is_none_or(|p| d.protocol() == p))
            .map(|d| d.clone())
            .collect();
        devices.sort_by_key(|d| d.id);
        devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Insert or replace a device
    pub fn upsert(&self, device: Device) -> CoreResult<()> {
        if device.parent_id == Some(device.id) {
            return Err(CoreError::Config(format!(
                "device {} cannot be its own parent",
                device.id
            )));
        }
        let id = device.id;
        let previous = self.get(id);

        if let Some(old) = &previous {
            if old.protocol() != device.protocol() && self.point_count(id) > 0 {
                return Err(ValidationError::ProtocolMismatch(id).into());
            }
        }

        let restart = previous.as_ref().is_some_and(|old| {
            old.address != device.address
                || old.parent_id != device.parent_id
                || old.enabled != device.enabled
        });
        let interval_changed = previous
            .as_ref()
            .is_some_and(|old| old.poll_interval_ms != device.poll_interval_ms);
        // A newly added device may be the missing parent of existing children
        let address_changed = previous
            .as_ref()
            .is_none_or(|old| old.address != device.address);

        self.devices.insert(id, device);

        match previous {
            None => {
                tracing::debug!(device_id = id, "Device added");
                self.notify(RegistryChange::DeviceAdded(id));
            }
            Some(_) if restart || interval_changed => {
                tracing::debug!(device_id = id, restart, interval_changed, "Device updated");
                self.notify(RegistryChange::DeviceUpdated {
                    device_id: id,
                    interval_changed,
                    restart,
                });
            }
            Some(_) => {}
        }

        // Children inheriting from this device must rebind
        if address_changed {
            for child in self.descendants(id) {
                self.notify(RegistryChange::DeviceUpdated {
                    device_id: child,
                    interval_changed: false,
                    restart: true,
                });
            }
        }
        Ok(())
    }

    /// Remove a device and all of its points
    pub fn delete(&self, id: DeviceId) -> CoreResult<Device> {
        if !self.contains(id) {
            return Err(CoreError::device_not_found(id));
        }
        self.notify(RegistryChange::DeviceRemoved(id));

        let point_ids: Vec<PointId> = self
            .device_points
            .remove(&id)
            .map(|(_, ids)| ids.into_iter().collect())
            .unwrap_or_default();
        for point_id in &point_ids {
            self.points.remove(point_id);
        }
        let children = self.descendants(id);
        let removed = self
            .devices
            .remove(&id)
            .map(|(_, d)| d)
            .ok_or_else(|| CoreError::device_not_found(id))?;

        if !point_ids.is_empty() {
            self.notify(RegistryChange::PointsRemoved {
                device_id: id,
                point_ids,
            });
        }
        for child in children {
            self.notify(RegistryChange::DeviceUpdated {
                device_id: child,
                interval_changed: false,
                restart: true,
            });
        }
        tracing::debug!(device_id = id, "Device removed");
        Ok(removed)
    }

    /// Devices whose parent chain includes `id`
    fn descendants(&self, id: DeviceId) -> Vec<DeviceId> {
        let mut found = Vec::new();
        let mut seen = HashSet::from([id]);
        let mut queue = VecDeque::from([id]);
        while let Some(parent) = queue.pop_front() {
            let children: Vec<DeviceId> = self
                .devices
                .iter()
                .filter(|d| d.parent_id == Some(parent))
                .map(|d| d.id)
                .collect();
            for child in children {
                if seen.insert(child) {
                    found.push(child);
                    queue.push_back(child);
                }
            }
        }
        found.sort_unstable();
        found
    }

    /// Device with inherited transport settings applied
    ///
    /// Walks the parent chain; the nearest ancestor providing a transport
    /// endpoint wins. A cycle or a missing parent is a configuration error.
    pub fn resolve(&self, id: DeviceId) -> CoreResult<Device> {
        let mut device = self.get(id).ok_or_else(|| CoreError::device_not_found(id))?;
        let mut visited = HashSet::from([id]);
        let mut next = device.parent_id;

        while let Some(parent_id) = next {
            if !visited.insert(parent_id) {
                return Err(CoreError::Config(format!(
                    "parent cycle through device {}",
                    parent_id
                )));
            }
            let parent = self.get(parent_id).ok_or_else(|| {
                CoreError::Config(format!("device {} has missing parent {}", id, parent_id))
            })?;
            match (&mut device.address, &parent.address) {
                (DeviceAddress::Bacnet(child), DeviceAddress::Bacnet(gateway)) => {
                    if child.endpoint.is_none() {
                        child.endpoint = gateway.endpoint.clone();
                    }
                }
                (DeviceAddress::Modbus(child), DeviceAddress::Modbus(gateway)) => {
                    if child.transport.is_none() {
                        child.transport = gateway.transport.clone();
                    }
                }
                _ => {
                    return Err(CoreError::Config(format!(
                        "device {} and parent {} speak different protocols",
                        id, parent_id
                    )));
                }
            }
            next = parent.parent_id;
        }
        Ok(device)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Points
    // ─────────────────────────────────────────────────────────────────────────

    pub fn point(&self, id: PointId) -> Option<Arc<Point>> {
        self.points.get(&id).map(|p| Arc::clone(&p))
    }

    /// Points of a device ordered by id
    pub fn points_for(&self, device_id: DeviceId) -> Vec<Arc<Point>> {
        let Some(ids) = self.device_points.get(&device_id).map(|ids| ids.clone()) else {
            return Vec::new();
        };
        ids.into_iter().filter_map(|id| self.point(id)).collect()
    }

    pub fn point_count(&self, device_id: DeviceId) -> usize {
        self.device_points
            .get(&device_id)
            .map(|ids| ids.len())
            .unwrap_or(0)
    }

    /// Insert or replace a point
    ///
    /// The owning device must exist and speak the point's protocol. Addresses
    /// are unique per device and input objects can never be writable.
    pub fn upsert_point(&self, point: Point) -> CoreResult<()> {
        let device = self
            .get(point.device_id)
            .ok_or_else(|| CoreError::device_not_found(point.device_id))?;
        if device.protocol() != point.address.protocol() {
            return Err(ValidationError::ProtocolMismatch(device.id).into());
        }
        if point.writable && !point.address.supports_write() {
            return Err(ValidationError::NotWritable(point.id).into());
        }
        let id = point.id;
        let device_id = device.id;
        let point = Arc::new(point);
        let moved_from = {
            // The device's id set stays locked until the point is in place
            let mut ids = self.device_points.entry(device_id).or_default();
            let clash = ids
                .iter()
                .filter(|other| **other != id)
                .filter_map(|other| self.points.get(other))
                .any(|other| other.address == point.address);
            if clash {
                return Err(
                    ValidationError::DuplicateAddress(point.address.to_string(), device_id).into(),
                );
            }
            ids.insert(id);
            self.points
                .insert(id, Arc::clone(&point))
                .map(|old| old.device_id)
                .filter(|old| *old != device_id)
        };

        if let Some(old_device) = moved_from {
            if let Some(mut ids) = self.device_points.get_mut(&old_device) {
                ids.remove(&id);
            }
        }

        if let Some(old_device) = moved_from {
            self.notify(RegistryChange::PointsRemoved {
                device_id: old_device,
                point_ids: vec![id],
            });
            self.notify(RegistryChange::PointsChanged(old_device));
        }
        self.notify(RegistryChange::PointsChanged(device_id));
        Ok(())
    }

    pub fn remove_point(&self, id: PointId) -> CoreResult<Arc<Point>> {
        let (_, point) = self
            .points
            .remove(&id)
            .ok_or_else(|| CoreError::point_not_found(id))?;
        if let Some(mut ids) = self.device_points.get_mut(&point.device_id) {
            ids.remove(&id);
        }
        self.notify(RegistryChange::PointsRemoved {
            device_id: point.device_id,
            point_ids: vec![id],
        });
        self.notify(RegistryChange::PointsChanged(point.device_id));
        Ok(point)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
