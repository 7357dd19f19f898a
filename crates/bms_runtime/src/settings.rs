//! Polling settings supplied by the host application

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bms_types::Protocol;

/// Fallback interval for devices without an override
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Settings collaborator consulted whenever a loop is (re)scheduled
pub trait SettingsProvider: Send + Sync + 'static {
    fn global_poll_interval(&self) -> Duration;

    /// Lower bound on a device's poll interval
    fn interval_floor(&self, protocol: Protocol) -> Duration {
        protocol.default_interval_floor()
    }
}

/// Settings held in memory. The global interval can be changed at runtime.
#[derive(Debug)]
pub struct StaticSettings {
    global_poll_interval_ms: AtomicU64,
    bacnet_floor: Duration,
    modbus_floor: Duration,
}

impl Default for StaticSettings {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

impl StaticSettings {
    pub fn new(global_poll_interval: Duration) -> Self {
        Self {
            global_poll_interval_ms: AtomicU64::new(global_poll_interval.as_millis() as u64),
            bacnet_floor: Protocol::Bacnet.default_interval_floor(),
            modbus_floor: Protocol::Modbus.default_interval_floor(),
        }
    }

    pub fn with_floor(mut self, protocol: Protocol, floor: Duration) -> Self {
        match protocol {
            Protocol::Bacnet => self.bacnet_floor = floor,
            Protocol::Modbus => self.modbus_floor = floor,
        }
        self
    }

    /// Takes effect when each loop next schedules a tick
    pub fn set_global_poll_interval(&self, interval: Duration) {
        self.global_poll_interval_ms
            .store(interval.as_millis() as u64, Ordering::SeqCst);
    }
}

impl SettingsProvider for StaticSettings {
    fn global_poll_interval(&self) -> Duration {
        Duration::from_millis(self.global_poll_interval_ms.load(Ordering::SeqCst))
    }

    fn interval_floor(&self, protocol: Protocol) -> Duration {
        match protocol {
            Protocol::Bacnet => self.bacnet_floor,
            Protocol::Modbus => self.modbus_floor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floors_default_per_protocol() {
        let settings = StaticSettings::default();
        assert_eq!(settings.interval_floor(Protocol::Bacnet), Duration::from_millis(1000));
        assert_eq!(settings.interval_floor(Protocol::Modbus), Duration::from_millis(500));

        let settings = settings.with_floor(Protocol::Modbus, Duration::from_millis(100));
        assert_eq!(settings.interval_floor(Protocol::Modbus), Duration::from_millis(100));
    }

    #[test]
    fn test_global_interval_is_adjustable() {
        let settings = StaticSettings::new(Duration::from_secs(30));
        settings.set_global_poll_interval(Duration::from_secs(5));
        assert_eq!(settings.global_poll_interval(), Duration::from_secs(5));
    }
}
