//! Device Handle
//!
//! A handle to communicate with a running device loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use bms_types::{CoreError, CoreResult, DeviceId, Point, PointTemplate, Priority, Value};

// ─────────────────────────────────────────────────────────────────────────────
// Loop State
// ─────────────────────────────────────────────────────────────────────────────

/// Current state of a device loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum LoopState {
    /// Waiting for the next tick or a command
    Idle = 0,
    /// A poll or write is on the wire
    Polling = 1,
    /// Waiting out a transport failure
    Backoff = 2,
    /// Loop has exited
    Stopped = 3,
}

impl LoopState {
    /// Convert from u8
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Idle,
            1 => Self::Polling,
            2 => Self::Backoff,
            _ => Self::Stopped,
        }
    }

    pub fn is_terminal(&self) -> bool {
        *self == LoopState::Stopped
    }
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoopState::Idle => write!(f, "idle"),
            LoopState::Polling => write!(f, "polling"),
            LoopState::Backoff => write!(f, "backoff"),
            LoopState::Stopped => write!(f, "stopped"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Health
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Not polled yet
    #[default]
    Unknown,
    Online,
    /// Failing, or answering with point errors
    Degraded,
    /// Failed the configured number of consecutive polls
    Offline,
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceStatus::Unknown => write!(f, "unknown"),
            DeviceStatus::Online => write!(f, "online"),
            DeviceStatus::Degraded => write!(f, "degraded"),
            DeviceStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Observability snapshot of one device loop
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceHealth {
    pub status: DeviceStatus,
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub polls: u64,
    pub failures: u64,
    pub last_duration_ms: Option<u64>,
}

impl DeviceHealth {
    pub(crate) fn record_success(&mut self, duration: Duration, point_errors: usize) {
        self.polls += 1;
        self.consecutive_failures = 0;
        self.last_success = Some(Utc::now());
        self.last_duration_ms = Some(duration.as_millis() as u64);
        self.status = if point_errors == 0 {
            DeviceStatus::Online
        } else {
            DeviceStatus::Degraded
        };
    }

    pub(crate) fn record_failure(&mut self, error: &str, offline_after: u32) {
        self.polls += 1;
        self.failures += 1;
        self.consecutive_failures += 1;
        self.last_error = Some(error.to_string());
        self.status = if self.consecutive_failures >= offline_after {
            DeviceStatus::Offline
        } else {
            DeviceStatus::Degraded
        };
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Device Command
// ─────────────────────────────────────────────────────────────────────────────

/// Work queued on a device's single operation slot
pub(crate) enum DeviceCommand {
    /// Write, then refresh the point. Replies with the refreshed value when
    /// the refresh read succeeded.
    Write {
        point: Arc<Point>,
        value: Option<Value>,
        priority: Option<Priority>,
        reply: oneshot::Sender<CoreResult<Option<Value>>>,
    },

    /// List the device's addressable objects
    Enumerate {
        reply: oneshot::Sender<CoreResult<Vec<PointTemplate>>>,
    },
}

impl DeviceCommand {
    /// Answer a command that will never run
    pub(crate) fn cancel(self, device_id: DeviceId) {
        match self {
            DeviceCommand::Write { reply, .. } => {
                let _ = reply.send(Err(CoreError::Cancelled(device_id)));
            }
            DeviceCommand::Enumerate { reply } => {
                let _ = reply.send(Err(CoreError::Cancelled(device_id)));
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Device Handle
// ─────────────────────────────────────────────────────────────────────────────

/// Cloneable handle to a device loop
///
/// Survives loop restarts caused by reconfiguration; only deletion or
/// shutdown cancels it.
#[derive(Clone)]
pub struct DeviceHandle {
    pub device_id: DeviceId,
    command_tx: mpsc::Sender<DeviceCommand>,
    state: Arc<AtomicU8>,
    health: Arc<RwLock<DeviceHealth>>,
    interval_ms: Arc<AtomicU64>,
    stop: CancellationToken,
}

impl DeviceHandle {
    pub(crate) fn new(
        device_id: DeviceId,
        command_tx: mpsc::Sender<DeviceCommand>,
        interval: Duration,
        stop: CancellationToken,
    ) -> Self {
        Self {
            device_id,
            command_tx,
            state: Arc::new(AtomicU8::new(LoopState::Idle as u8)),
            health: Arc::new(RwLock::new(DeviceHealth::default())),
            interval_ms: Arc::new(AtomicU64::new(interval.as_millis() as u64)),
            stop,
        }
    }

    pub fn state(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn health(&self) -> DeviceHealth {
        self.health.read().clone()
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::SeqCst))
    }

    /// Applies when the loop schedules its next tick
    pub fn set_interval(&self, interval: Duration) {
        self.interval_ms
            .store(interval.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub(crate) fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub(crate) fn state_cell(&self) -> Arc<AtomicU8> {
        Arc::clone(&self.state)
    }

    pub(crate) fn health_cell(&self) -> Arc<RwLock<DeviceHealth>> {
        Arc::clone(&self.health)
    }

    pub(crate) fn interval_cell(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.interval_ms)
    }

    /// Cancel the loop. Queued commands are answered with `Cancelled`.
    pub fn cancel(&self) {
        self.stop.cancel();
    }

    /// Queue a write and wait for the device loop to perform it
    pub(crate) async fn write(
        &self,
        point: Arc<Point>,
        value: Option<Value>,
        priority: Option<Priority>,
    ) -> CoreResult<Option<Value>> {
        let (reply, rx) = oneshot::channel();
        self.send(DeviceCommand::Write {
            point,
            value,
            priority,
            reply,
        })
        .await?;
        rx.await.map_err(|_| CoreError::Cancelled(self.device_id))?
    }

    pub(crate) async fn enumerate(&self) -> CoreResult<Vec<PointTemplate>> {
        let (reply, rx) = oneshot::channel();
        self.send(DeviceCommand::Enumerate { reply }).await?;
        rx.await.map_err(|_| CoreError::Cancelled(self.device_id))?
    }

    async fn send(&self, command: DeviceCommand) -> CoreResult<()> {
        if self.stop.is_cancelled() {
            return Err(CoreError::Cancelled(self.device_id));
        }
        self.command_tx
            .send(command)
            .await
            .map_err(|_| CoreError::Cancelled(self.device_id))
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("device_id", &self.device_id)
            .field("state", &self.state())
            .field("interval", &self.interval())
            .finish()
    }
}
