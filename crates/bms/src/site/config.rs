//! Site Configuration Types
//!
//! Defines the structure of site files on disk.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use bms_runtime::protocol::{BacnetNetConfig, ModbusProbeConfig};
use bms_runtime::{SchedulerConfig, StaticSettings};
use bms_types::{
    BacnetAddress, DataType, Device, DeviceAddress, DeviceId, ModbusAddress, ObjectType, Point,
    PointAddress, PointId, Protocol, RegisterKind,
};

/// Site manifest (site.toml)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteManifest {
    pub site: SiteInfo,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub bacnet: BacnetNetConfig,
    #[serde(default)]
    pub modbus: ModbusProbeConfig,
}

/// Site information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteInfo {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Polling
// ─────────────────────────────────────────────────────────────────────────────

/// Poll scheduling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Interval for devices without their own override
    #[serde(default = "default_interval_ms")]
    pub default_interval_ms: u64,
    pub bacnet_floor_ms: Option<u64>,
    pub modbus_floor_ms: Option<u64>,
    /// Consecutive failed polls before a device is reported offline
    #[serde(default = "default_offline_after")]
    pub offline_after: u32,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_enumerate_timeout_ms")]
    pub enumerate_timeout_ms: u64,
}

fn default_interval_ms() -> u64 {
    10_000
}

fn default_offline_after() -> u32 {
    3
}

fn default_max_backoff_ms() -> u64 {
    300_000
}

fn default_enumerate_timeout_ms() -> u64 {
    60_000
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            default_interval_ms: default_interval_ms(),
            bacnet_floor_ms: None,
            modbus_floor_ms: None,
            offline_after: default_offline_after(),
            max_backoff_ms: default_max_backoff_ms(),
            enumerate_timeout_ms: default_enumerate_timeout_ms(),
        }
    }
}

impl PollingConfig {
    pub fn settings(&self) -> StaticSettings {
        let mut settings = StaticSettings::new(Duration::from_millis(self.default_interval_ms));
        if let Some(floor) = self.bacnet_floor_ms {
            settings = settings.with_floor(Protocol::Bacnet, Duration::from_millis(floor));
        }
        if let Some(floor) = self.modbus_floor_ms {
            settings = settings.with_floor(Protocol::Modbus, Duration::from_millis(floor));
        }
        settings
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            offline_after: self.offline_after.max(1),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            enumerate_timeout: Duration::from_millis(self.enumerate_timeout_ms),
            ..SchedulerConfig::default()
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Devices
// ─────────────────────────────────────────────────────────────────────────────

/// Device configuration (devices/*.device.toml)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub device: DeviceInfo,
    #[serde(default)]
    pub points: Vec<PointConfig>,
}

/// Device information
///
/// Exactly one of `bacnet` and `modbus` must be present and it must match
/// `protocol`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub name: String,
    pub protocol: Protocol,
    pub description: Option<String>,
    pub poll_interval_ms: Option<u64>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub parent_id: Option<DeviceId>,
    pub bacnet: Option<BacnetAddress>,
    pub modbus: Option<ModbusAddress>,
}

fn default_true() -> bool {
    true
}

/// Point configuration
///
/// BACnet points are addressed by `object_type` and `instance`, Modbus points
/// by `register` and `address`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointConfig {
    pub id: PointId,
    pub name: String,
    pub object_type: Option<ObjectType>,
    pub instance: Option<u32>,
    pub register: Option<RegisterKind>,
    pub address: Option<u16>,
    /// Defaults to the object's natural type for BACnet and uint16 for Modbus
    pub data_type: Option<DataType>,
    pub scale: Option<f64>,
    #[serde(default)]
    pub writable: bool,
    pub units: Option<String>,
    pub description: Option<String>,
}

impl DeviceConfig {
    /// Build the runtime device and its points
    pub fn resolve(&self) -> Result<(Device, Vec<Point>), String> {
        let device = self.device.to_device()?;
        let points = self
            .points
            .iter()
            .map(|p| p.to_point(&device))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((device, points))
    }
}

impl DeviceInfo {
    pub fn to_device(&self) -> Result<Device, String> {
        let address = match (self.protocol, &self.bacnet, &self.modbus) {
            (Protocol::Bacnet, Some(bacnet), None) => DeviceAddress::Bacnet(bacnet.clone()),
            (Protocol::Modbus, None, Some(modbus)) => DeviceAddress::Modbus(modbus.clone()),
            (Protocol::Bacnet, _, _) => {
                return Err(format!(
                    "device {} needs a [device.bacnet] table and no [device.modbus]",
                    self.id
                ));
            }
            (Protocol::Modbus, _, _) => {
                return Err(format!(
                    "device {} needs a [device.modbus] table and no [device.bacnet]",
                    self.id
                ));
            }
        };

        let mut device = Device::new(self.id, &self.name, address);
        device.poll_interval_ms = self.poll_interval_ms;
        device.enabled = self.enabled;
        device.parent_id = self.parent_id;
        Ok(device)
    }
}

impl PointConfig {
    pub fn to_point(&self, device: &Device) -> Result<Point, String> {
        let mut point = match device.protocol() {
            Protocol::Bacnet => {
                let (Some(object_type), Some(instance)) = (self.object_type, self.instance) else {
                    return Err(format!(
                        "point {} needs object_type and instance",
                        self.id
                    ));
                };
                Point::bacnet(self.id, device.id, object_type, instance)
            }
            Protocol::Modbus => {
                let (Some(register), Some(address)) = (self.register, self.address) else {
                    return Err(format!("point {} needs register and address", self.id));
                };
                let data_type = if register.is_bit() {
                    DataType::Boolean
                } else {
                    DataType::UInt16
                };
                Point::modbus(self.id, device.id, register, address, data_type)
            }
        };

        if let PointAddress::Modbus { register, .. } = point.address {
            if register.is_bit() && self.data_type.is_some_and(|t| t != DataType::Boolean) {
                return Err(format!(
                    "point {} on a {} must be boolean",
                    self.id, register
                ));
            }
        }

        point.name = self.name.clone();
        if let Some(data_type) = self.data_type {
            point.data_type = data_type;
        }
        point.scale = self.scale;
        point.writable = self.writable;
        point.units = self.units.clone();
        Ok(point)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Loaded Site
// ─────────────────────────────────────────────────────────────────────────────

/// A device file that resolved cleanly
#[derive(Debug, Clone)]
pub struct SiteDevice {
    pub device: Device,
    pub points: Vec<Point>,
    /// File the device was loaded from
    pub source: PathBuf,
}

/// Loaded site with all configuration
#[derive(Debug, Clone)]
pub struct Site {
    /// Site root path
    pub path: PathBuf,
    pub manifest: SiteManifest,
    /// Loaded devices by id
    pub devices: HashMap<DeviceId, SiteDevice>,
    /// Files that were skipped, with the reason
    pub rejected: Vec<(PathBuf, String)>,
}

impl Site {
    pub fn id(&self) -> &str {
        &self.manifest.site.id
    }

    pub fn name(&self) -> &str {
        &self.manifest.site.name
    }

    pub fn point_count(&self) -> usize {
        self.devices.values().map(|d| d.points.len()).sum()
    }

    /// BACnet network settings with environment overrides applied
    pub fn bacnet_config(&self) -> BacnetNetConfig {
        self.manifest.bacnet.clone().with_env_overrides()
    }

    /// Devices ordered by id
    pub fn sorted_devices(&self) -> Vec<&SiteDevice> {
        let mut devices: Vec<_> = self.devices.values().collect();
        devices.sort_by_key(|d| d.device.id);
        devices
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AHU: &str = r#"
        [device]
        id = 1
        name = "AHU-1"
        protocol = "bacnet"
        poll_interval_ms = 5000

        [device.bacnet]
        instance = 1001
        endpoint = "10.0.1.50"

        [[points]]
        id = 11
        name = "Supply Air Temp"
        object_type = "analog_input"
        instance = 1
        units = "degF"

        [[points]]
        id = 12
        name = "Cooling Valve"
        object_type = "analog_output"
        instance = 2
        writable = true
    "#;

    #[test]
    fn test_bacnet_device_file() {
        let config: DeviceConfig = toml::from_str(AHU).unwrap();
        let (device, points) = config.resolve().unwrap();

        assert_eq!(device.id, 1);
        assert_eq!(device.protocol(), Protocol::Bacnet);
        assert_eq!(device.poll_interval(), Some(Duration::from_secs(5)));
        assert_eq!(device.as_bacnet().unwrap().endpoint.as_deref(), Some("10.0.1.50"));

        assert_eq!(points.len(), 2);
        assert_eq!(points[0].name, "Supply Air Temp");
        assert_eq!(points[0].data_type, DataType::Float32);
        assert_eq!(points[0].units.as_deref(), Some("degF"));
        assert!(!points[0].is_writable());
        assert!(points[1].is_writable());
    }

    #[test]
    fn test_modbus_device_file() {
        let config: DeviceConfig = toml::from_str(
            r#"
            [device]
            id = 2
            name = "Meter"
            protocol = "modbus"

            [device.modbus]
            unit_id = 3

            [device.modbus.transport]
            kind = "tcp"
            host = "10.0.2.10"

            [[points]]
            id = 21
            name = "Demand"
            register = "holding_register"
            address = 100
            data_type = "float32"
            scale = 0.1

            [[points]]
            id = 22
            name = "Pump Run"
            register = "coil"
            address = 5
            writable = true
            "#,
        )
        .unwrap();
        let (device, points) = config.resolve().unwrap();

        match &device.address {
            DeviceAddress::Modbus(address) => {
                assert_eq!(address.unit_id, 3);
                assert_eq!(
                    address.transport,
                    Some(bms_types::ModbusTransport::tcp("10.0.2.10", 502))
                );
            }
            other => panic!("unexpected address {:?}", other),
        }
        assert_eq!(points[0].data_type, DataType::Float32);
        assert_eq!(points[0].scale, Some(0.1));
        assert_eq!(points[1].data_type, DataType::Boolean);
        assert!(points[1].is_writable());
    }

    #[test]
    fn test_mismatched_address_table_is_rejected() {
        let config: DeviceConfig = toml::from_str(
            r#"
            [device]
            id = 3
            name = "Broken"
            protocol = "modbus"

            [device.bacnet]
            instance = 5
            "#,
        )
        .unwrap();
        let err = config.resolve().unwrap_err();
        assert!(err.contains("[device.modbus]"));
    }

    #[test]
    fn test_point_without_address_is_rejected() {
        let config: DeviceConfig = toml::from_str(
            r#"
            [device]
            id = 4
            name = "VAV"
            protocol = "bacnet"

            [device.bacnet]
            instance = 4

            [[points]]
            id = 41
            name = "Damper"
            register = "coil"
            address = 1
            "#,
        )
        .unwrap();
        let err = config.resolve().unwrap_err();
        assert!(err.contains("object_type and instance"));
    }

    #[test]
    fn test_polling_defaults_and_floors() {
        let manifest: SiteManifest = toml::from_str(
            r#"
            [site]
            id = "hq"
            name = "Headquarters"

            [polling]
            default_interval_ms = 2000
            modbus_floor_ms = 250
            offline_after = 5
            "#,
        )
        .unwrap();

        use bms_runtime::SettingsProvider;
        let settings = manifest.polling.settings();
        assert_eq!(settings.global_poll_interval(), Duration::from_secs(2));
        assert_eq!(settings.interval_floor(Protocol::Modbus), Duration::from_millis(250));
        assert_eq!(settings.interval_floor(Protocol::Bacnet), Duration::from_secs(1));

        let config = manifest.polling.scheduler_config();
        assert_eq!(config.offline_after, 5);
        assert_eq!(config.max_backoff, Duration::from_secs(300));
        assert_eq!(manifest.bacnet.port, 47808);
        assert_eq!(manifest.modbus.unit_ids, vec![1]);
    }
}
