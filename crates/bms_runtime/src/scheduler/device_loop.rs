//! Device Loop
//!
//! One task per enabled device. The loop owns the device's adapter, so polls
//! and queued commands share a single operation slot and never overlap on the
//! wire.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use bms_types::{
    CoreError, CoreResult, Device, DeviceId, Point, PointId, PointTemplate, Priority, Value,
};

use super::handle::{DeviceCommand, DeviceHealth, DeviceStatus, LoopState};
use super::SchedulerConfig;
use crate::cache::PointValueCache;
use crate::protocol::{AdapterError, AdapterResult, ProtocolAdapter};
use crate::registry::DeviceRegistry;

/// Why the loop exited
enum Exit {
    /// Device deleted or core shutting down
    Stop,
    /// Reconfigured; the command queue moves to the replacement loop
    Restart,
}

enum Event {
    Exit(Exit),
    Command(DeviceCommand),
    Tick,
}

pub(crate) struct DeviceLoop {
    pub device: Device,
    pub adapter: Box<dyn ProtocolAdapter>,
    pub registry: Arc<DeviceRegistry>,
    pub cache: Arc<PointValueCache>,
    pub commands: mpsc::Receiver<DeviceCommand>,
    pub stop: CancellationToken,
    pub restart: CancellationToken,
    pub state: Arc<AtomicU8>,
    pub health: Arc<RwLock<DeviceHealth>>,
    pub interval_ms: Arc<AtomicU64>,
    pub config: SchedulerConfig,
}

impl DeviceLoop {
    fn device_id(&self) -> DeviceId {
        self.device.id
    }

    fn cancelled(&self) -> bool {
        self.stop.is_cancelled() || self.restart.is_cancelled()
    }

    /// Whether the registry still places this point on our device
    fn owns(&self, point_id: PointId) -> bool {
        self.registry
            .point(point_id)
            .is_some_and(|p| p.device_id == self.device_id())
    }

    fn set_state(&self, state: LoopState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::SeqCst))
    }

    /// Deadline for one adapter call touching `requests` wire round trips
    fn deadline(&self, requests: usize) -> Duration {
        let requests = u32::try_from(requests).unwrap_or(u32::MAX).max(1);
        self.device
            .operation_timeout()
            .max(Duration::from_millis(100))
            .saturating_mul(requests)
    }

    /// Run until stopped. Returns the command queue when handing over to a
    /// restarted loop.
    pub async fn run(mut self) -> Option<mpsc::Receiver<DeviceCommand>> {
        let device_id = self.device_id();
        tracing::info!(
            device_id,
            device = %self.device.name,
            address = %self.device.address,
            interval_ms = self.interval().as_millis() as u64,
            "Device loop started"
        );

        let mut next_tick = Instant::now();
        let mut transport_failures: u32 = 0;
        let mut resting = LoopState::Idle;
        self.set_state(resting);

        let exit = loop {
            let event = tokio::select! {
                biased;
                _ = self.stop.cancelled() => Event::Exit(Exit::Stop),
                _ = self.restart.cancelled() => Event::Exit(Exit::Restart),
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => Event::Command(cmd),
                    None => Event::Exit(Exit::Stop),
                },
                _ = tokio::time::sleep_until(next_tick) => Event::Tick,
            };

            match event {
                Event::Exit(exit) => break exit,
                Event::Command(cmd) => {
                    self.handle_command(cmd).await;
                    self.set_state(resting);
                }
                Event::Tick => {
                    let started = Instant::now();
                    let outcome = self.poll().await;

                    // Read at scheduling time so interval changes apply from here on
                    let interval = self.interval();
                    next_tick = match outcome {
                        Err(e) if e.is_transport() => {
                            transport_failures = transport_failures.saturating_add(1);
                            self.adapter.close().await;
                            let delay =
                                backoff_delay(interval, transport_failures, self.config.max_backoff);
                            tracing::debug!(
                                device_id,
                                failures = transport_failures,
                                delay_ms = delay.as_millis() as u64,
                                "Backing off"
                            );
                            resting = LoopState::Backoff;
                            started + delay
                        }
                        _ => {
                            transport_failures = 0;
                            resting = LoopState::Idle;
                            started + interval
                        }
                    };
                    // An overrunning poll starts the next one right away without catching up
                    next_tick = next_tick.max(Instant::now());
                    self.set_state(resting);
                }
            }
        };

        self.adapter.close().await;
        match exit {
            Exit::Restart if !self.stop.is_cancelled() => {
                tracing::debug!(device_id, "Device loop handing over");
                Some(self.commands)
            }
            _ => {
                self.commands.close();
                let mut cancelled = 0;
                while let Ok(cmd) = self.commands.try_recv() {
                    cmd.cancel(device_id);
                    cancelled += 1;
                }
                self.set_state(LoopState::Stopped);
                tracing::info!(device_id, cancelled, "Device loop stopped");
                None
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Polling
    // ─────────────────────────────────────────────────────────────────────────

    /// Read every point once. Returns the device-level failure, if any.
    async fn poll(&mut self) -> AdapterResult<()> {
        let device_id = self.device_id();
        let points = self.registry.points_for(device_id);
        if points.is_empty() || self.cancelled() {
            return Ok(());
        }

        self.set_state(LoopState::Polling);
        let started = Instant::now();
        let deadline = self.deadline(points.len() + 1);
        let result = match tokio::time::timeout(deadline, self.adapter.read(&points)).await {
            Ok(result) => result,
            Err(_) => {
                // Abandoned mid-transaction; start the next one on a fresh connection
                self.adapter.close().await;
                Err(AdapterError::Timeout(deadline))
            }
        };
        let completed_at = std::time::Instant::now();

        // Results of a poll that outlived its loop are discarded
        if self.cancelled() {
            return Ok(());
        }

        match result {
            Ok(mut results) => {
                let mut point_errors = 0usize;
                for point in &points {
                    // Removed while the read was on the wire
                    if !self.owns(point.id) {
                        continue;
                    }
                    match results.remove(&point.id) {
                        Some(Ok(value)) => {
                            self.cache.update_good(point.id, value, completed_at);
                        }
                        Some(Err(e)) => {
                            point_errors += 1;
                            tracing::debug!(device_id, point_id = point.id, error = %e, "Point read failed");
                            self.cache.mark_error(point.id, &e.0, completed_at);
                        }
                        None => {
                            point_errors += 1;
                            self.cache.mark_error(point.id, "no result", completed_at);
                        }
                    }
                }
                self.health
                    .write()
                    .record_success(started.elapsed(), point_errors);
                tracing::debug!(
                    device_id,
                    points = points.len(),
                    point_errors,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Poll complete"
                );
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                for point in &points {
                    self.cache.mark_stale(point.id, &reason, completed_at);
                }
                let (status, failures) = {
                    let mut health = self.health.write();
                    health.record_failure(&reason, self.config.offline_after);
                    (health.status, health.consecutive_failures)
                };
                if status == DeviceStatus::Offline && failures == self.config.offline_after {
                    tracing::warn!(device_id, failures, error = %e, "Device offline");
                } else {
                    tracing::warn!(device_id, failures, error = %e, "Poll failed");
                }
                Err(e)
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Commands
    // ─────────────────────────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: DeviceCommand) {
        match cmd {
            DeviceCommand::Write {
                point,
                value,
                priority,
                reply,
            } => {
                let result = self.write(point, value, priority).await;
                let _ = reply.send(result);
            }
            DeviceCommand::Enumerate { reply } => {
                let result = self.enumerate().await;
                let _ = reply.send(result);
            }
        }
    }

    async fn write(
        &mut self,
        point: Arc<Point>,
        value: Option<Value>,
        priority: Option<Priority>,
    ) -> CoreResult<Option<Value>> {
        let device_id = self.device_id();
        if self.cancelled() {
            return Err(CoreError::Cancelled(device_id));
        }
        // The point may have been removed while the write was queued
        if !self.owns(point.id) {
            return Err(CoreError::point_not_found(point.id));
        }

        self.set_state(LoopState::Polling);
        let deadline = self.deadline(1);
        let result = match tokio::time::timeout(
            deadline,
            self.adapter.write(&point, value.as_ref(), priority),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                self.adapter.close().await;
                Err(AdapterError::Timeout(deadline))
            }
        };

        if let Err(e) = result {
            if e.is_transport() {
                self.adapter.close().await;
            }
            tracing::warn!(device_id, point_id = point.id, error = %e, "Write failed");
            return Err(e.into_core(device_id));
        }
        tracing::debug!(device_id, point_id = point.id, value = ?value, priority = ?priority, "Write complete");

        Ok(self.refresh(&point).await)
    }

    /// Read a point right after writing it
    async fn refresh(&mut self, point: &Arc<Point>) -> Option<Value> {
        let device_id = self.device_id();
        if self.cancelled() {
            return None;
        }
        let deadline = self.deadline(1);
        let result =
            tokio::time::timeout(deadline, self.adapter.read(std::slice::from_ref(point))).await;
        let completed_at = std::time::Instant::now();
        if self.cancelled() {
            return None;
        }

        match result {
            Ok(Ok(mut results)) => match results.remove(&point.id) {
                Some(Ok(value)) => {
                    if self.owns(point.id) {
                        self.cache.update_good(point.id, value.clone(), completed_at);
                    }
                    Some(value)
                }
                Some(Err(e)) => {
                    self.cache.mark_error(point.id, &e.0, completed_at);
                    None
                }
                None => None,
            },
            Ok(Err(e)) => {
                if e.is_transport() {
                    self.adapter.close().await;
                }
                tracing::debug!(device_id, point_id = point.id, error = %e, "Refresh after write failed");
                None
            }
            Err(_) => {
                self.adapter.close().await;
                tracing::debug!(device_id, point_id = point.id, "Refresh after write timed out");
                None
            }
        }
    }

    async fn enumerate(&mut self) -> CoreResult<Vec<PointTemplate>> {
        let device_id = self.device_id();
        if self.cancelled() {
            return Err(CoreError::Cancelled(device_id));
        }
        self.set_state(LoopState::Polling);
        match tokio::time::timeout(self.config.enumerate_timeout, self.adapter.enumerate()).await {
            Ok(Ok(templates)) => {
                tracing::info!(device_id, objects = templates.len(), "Device enumerated");
                Ok(templates)
            }
            Ok(Err(e)) => {
                if e.is_transport() {
                    self.adapter.close().await;
                }
                Err(e.into_core(device_id))
            }
            Err(_) => {
                self.adapter.close().await;
                Err(CoreError::Timeout(device_id))
            }
        }
    }
}

/// Delay after the n-th consecutive transport failure
///
/// `interval × 2^(n-1)`, capped, plus up to 10% jitter from the second
/// failure on so devices behind one dead gateway spread their retries.
pub(crate) fn backoff_delay(interval: Duration, failures: u32, cap: Duration) -> Duration {
    let cap = cap.max(interval);
    let exponent = failures.saturating_sub(1).min(16);
    let base = interval.saturating_mul(1u32 << exponent).min(cap);
    if failures < 2 {
        return base;
    }
    let spread = base.as_millis() as u64 / 10;
    if spread == 0 {
        return base;
    }
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=spread));
    (base + jitter).min(cap)
}
