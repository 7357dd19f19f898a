//! Command Dispatcher
//!
//! Validates write commands and hands them to the owning device loop, which
//! performs the wire write and an immediate refresh read on the device's
//! single operation slot. Writes to different devices proceed independently.

use std::sync::Arc;

use dashmap::DashMap;

use bms_types::{
    CoreError, CoreResult, Device, DeviceId, Point, PointAddress, PointId, Priority,
    PriorityArray, Protocol, ValidationError, Value, WriteCommand, WriteOutcome,
    coerce_for_point,
};

use crate::audit::{AuditEvent, AuditKind, AuditOutcome, AuditSink};
use crate::cache::PointValueCache;
use crate::registry::{ChangeListener, DeviceRegistry, RegistryChange};
use crate::scheduler::PollScheduler;

/// A write that passed validation
struct Accepted {
    point: Arc<Point>,
    device: Device,
    /// Normalized value, `None` to relinquish
    value: Option<Value>,
    priority: Option<Priority>,
}

pub struct CommandDispatcher {
    registry: Arc<DeviceRegistry>,
    scheduler: Arc<PollScheduler>,
    cache: Arc<PointValueCache>,
    audit: Arc<dyn AuditSink>,
    /// Local mirror of the priority arrays written through this core
    shadows: DashMap<PointId, PriorityArray>,
}

impl CommandDispatcher {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        scheduler: Arc<PollScheduler>,
        cache: Arc<PointValueCache>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            registry,
            scheduler,
            cache,
            audit,
            shadows: DashMap::new(),
        }
    }

    /// Validate and perform a write
    pub async fn submit(&self, command: WriteCommand) -> CoreResult<WriteOutcome> {
        self.dispatch(None, command).await
    }

    /// Like [`submit`](Self::submit), rejecting points of other devices
    pub async fn submit_for(
        &self,
        device_id: DeviceId,
        command: WriteCommand,
    ) -> CoreResult<WriteOutcome> {
        self.dispatch(Some(device_id), command).await
    }

    /// Priority array shadow of a commandable point
    pub fn shadow(&self, point_id: PointId) -> Option<PriorityArray> {
        self.shadows.get(&point_id).map(|s| s.clone())
    }

    async fn dispatch(
        &self,
        expected_device: Option<DeviceId>,
        command: WriteCommand,
    ) -> CoreResult<WriteOutcome> {
        let accepted = self.validate(expected_device, &command)?;
        let Accepted {
            point,
            device,
            value,
            priority,
        } = accepted;

        let old_value = self.cache.get(point.id).map(|v| v.value);
        let result = match self.scheduler.handle(device.id) {
            Some(handle) => {
                handle
                    .write(Arc::clone(&point), value.clone(), priority)
                    .await
            }
            // Disabled, deleted, or never started
            None => Err(CoreError::Cancelled(device.id)),
        };

        let kind = if value.is_some() {
            AuditKind::Write
        } else {
            AuditKind::Relinquish
        };
        let mut event = AuditEvent::new(
            kind,
            format!("point:{}", point.id),
            match &result {
                Ok(_) => AuditOutcome::Ok,
                Err(e) => AuditOutcome::Failed(e.to_string()),
            },
        )
        .with_actor(command.actor.as_deref())
        .with_values(old_value.clone(), value.clone());
        if let Some(priority) = priority {
            event = event.with_detail(format!("priority {}", priority));
        }
        self.audit.persist(event);

        let present_value = result?;
        let (expected, active_priority) =
            self.apply_shadow(&point, value.clone(), priority, old_value);

        tracing::info!(
            device_id = device.id,
            point_id = point.id,
            value = ?value,
            priority = ?priority,
            present = ?present_value,
            "Point written"
        );

        Ok(WriteOutcome {
            point_id: point.id,
            written: value,
            effective_value: present_value.clone().or(expected),
            present_value,
            active_priority,
        })
    }

    fn validate(
        &self,
        expected_device: Option<DeviceId>,
        command: &WriteCommand,
    ) -> CoreResult<Accepted> {
        let point = self
            .registry
            .point(command.point_id)
            .ok_or_else(|| CoreError::point_not_found(command.point_id))?;
        if let Some(device_id) = expected_device {
            if !self.registry.contains(device_id) {
                return Err(CoreError::device_not_found(device_id));
            }
            if point.device_id != device_id {
                return Err(ValidationError::WrongDevice {
                    point: point.id,
                    device: device_id,
                }
                .into());
            }
        }
        let device = self
            .registry
            .get(point.device_id)
            .ok_or_else(|| CoreError::device_not_found(point.device_id))?;

        if !point.is_writable() {
            return Err(ValidationError::NotWritable(point.id).into());
        }

        let value = match &command.value {
            Some(value) => Some(coerce_for_point(&point, value)?),
            None if device.protocol() == Protocol::Modbus => {
                return Err(ValidationError::RelinquishUnsupported(Protocol::Modbus).into());
            }
            None => None,
        };

        let priority = match device.protocol() {
            Protocol::Bacnet => command.priority,
            Protocol::Modbus => {
                if let Some(priority) = command.priority {
                    tracing::debug!(point_id = point.id, %priority, "Priority ignored for Modbus");
                }
                None
            }
        };

        Ok(Accepted {
            point,
            device,
            value,
            priority,
        })
    }

    /// Record the write in the point's shadow and return the value and slot
    /// it implies
    fn apply_shadow(
        &self,
        point: &Point,
        value: Option<Value>,
        priority: Option<Priority>,
        previous: Option<Value>,
    ) -> (Option<Value>, Option<Priority>) {
        let commandable = matches!(
            point.address,
            PointAddress::Bacnet { object_type, .. } if object_type.is_commandable()
        );
        if !commandable {
            return (value, None);
        }

        // Before the first write the observed value is the best relinquish default
        let mut shadow = self.shadows.entry(point.id).or_insert_with(|| match previous {
            Some(value) => PriorityArray::with_relinquish_default(value),
            None => PriorityArray::new(),
        });
        shadow.write(priority.unwrap_or(Priority::LOWEST), value);
        (shadow.effective().cloned(), shadow.active_priority())
    }
}

impl ChangeListener for CommandDispatcher {
    fn on_change(&self, change: &RegistryChange) {
        if let RegistryChange::PointsRemoved { point_ids, .. } = change {
            for point_id in point_ids {
                self.shadows.remove(point_id);
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
