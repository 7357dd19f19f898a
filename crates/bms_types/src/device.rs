//! Device model
//!
//! A device is a field controller or gateway reachable over one protocol.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Stable device identifier
pub type DeviceId = i64;

// ─────────────────────────────────────────────────────────────────────────────
// Protocol Tag
// ─────────────────────────────────────────────────────────────────────────────

/// Protocol spoken by a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    #[serde(alias = "bacnet")]
    Bacnet,
    #[serde(alias = "modbus")]
    Modbus,
}

impl Protocol {
    /// Lower bound for the poll interval of devices speaking this protocol
    pub fn default_interval_floor(&self) -> Duration {
        match self {
            Protocol::Bacnet => Duration::from_millis(1000),
            Protocol::Modbus => Duration::from_millis(500),
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Bacnet => write!(f, "BACNET"),
            Protocol::Modbus => write!(f, "MODBUS"),
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bacnet" => Ok(Protocol::Bacnet),
            "modbus" => Ok(Protocol::Modbus),
            other => Err(format!("unknown protocol '{}'", other)),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// BACnet Addressing
// ─────────────────────────────────────────────────────────────────────────────

/// BACnet device address and tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacnetAddress {
    /// Device object instance number
    pub instance: u32,
    /// Network number (0 = local network)
    #[serde(default)]
    pub network: u16,
    /// IP endpoint ("10.0.1.50:47808"). Resolved with Who-Is when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// MAC address on the remote network for routed devices
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mac: Vec<u8>,
    #[serde(default)]
    pub tuning: BacnetTuning,
}

impl BacnetAddress {
    pub fn new(instance: u32) -> Self {
        Self {
            instance,
            network: 0,
            endpoint: None,
            mac: Vec::new(),
            tuning: BacnetTuning::default(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Whether the device sits behind a router on another network
    pub fn is_routed(&self) -> bool {
        self.network != 0 && !self.mac.is_empty()
    }
}

/// BACnet protocol tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacnetTuning {
    /// Time to wait for a confirmed-request reply before retrying
    #[serde(default = "default_apdu_timeout_ms")]
    pub apdu_timeout_ms: u64,
    /// Number of retransmissions after the first attempt
    #[serde(default = "default_apdu_retries")]
    pub apdu_retries: u8,
    /// Objects per ReadPropertyMultiple request
    #[serde(default = "default_rpm_objects")]
    pub max_rpm_objects: usize,
}

fn default_apdu_timeout_ms() -> u64 {
    3000
}

fn default_apdu_retries() -> u8 {
    2
}

fn default_rpm_objects() -> usize {
    16
}

impl Default for BacnetTuning {
    fn default() -> Self {
        Self {
            apdu_timeout_ms: default_apdu_timeout_ms(),
            apdu_retries: default_apdu_retries(),
            max_rpm_objects: default_rpm_objects(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Modbus Addressing
// ─────────────────────────────────────────────────────────────────────────────

/// Byte or word ordering of multi-byte register values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endianness {
    #[default]
    #[serde(alias = "big_endian", alias = "be")]
    Big,
    #[serde(alias = "little_endian", alias = "le")]
    Little,
}

/// Serial parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

/// Physical transport of a Modbus device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ModbusTransport {
    Tcp {
        host: String,
        #[serde(default = "default_modbus_port")]
        port: u16,
    },
    Rtu {
        path: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        #[serde(default = "default_data_bits")]
        data_bits: u8,
        #[serde(default)]
        parity: Parity,
        #[serde(default = "default_stop_bits")]
        stop_bits: u8,
    },
}

fn default_modbus_port() -> u16 {
    502
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

impl ModbusTransport {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        ModbusTransport::Tcp {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for ModbusTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModbusTransport::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            ModbusTransport::Rtu {
                path, baud_rate, ..
            } => write!(f, "rtu://{}@{}", path, baud_rate),
        }
    }
}

/// Modbus device address and tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModbusAddress {
    /// Unit (slave) identifier
    pub unit_id: u8,
    /// Transport endpoint. Inherited from the parent gateway when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<ModbusTransport>,
    #[serde(default)]
    pub tuning: ModbusTuning,
}

impl ModbusAddress {
    pub fn new(unit_id: u8) -> Self {
        Self {
            unit_id,
            transport: None,
            tuning: ModbusTuning::default(),
        }
    }

    pub fn with_transport(mut self, transport: ModbusTransport) -> Self {
        self.transport = Some(transport);
        self
    }
}

/// Modbus protocol tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModbusTuning {
    #[serde(default)]
    pub byte_order: Endianness,
    #[serde(default)]
    pub word_order: Endianness,
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    /// Largest address gap bridged when coalescing reads
    #[serde(default = "default_max_gap")]
    pub max_gap: u16,
    /// Largest register span of one read request
    #[serde(default = "default_max_span")]
    pub max_span: u16,
}

fn default_response_timeout_ms() -> u64 {
    3000
}

fn default_max_gap() -> u16 {
    8
}

fn default_max_span() -> u16 {
    120
}

impl Default for ModbusTuning {
    fn default() -> Self {
        Self {
            byte_order: Endianness::Big,
            word_order: Endianness::Big,
            response_timeout_ms: default_response_timeout_ms(),
            max_gap: default_max_gap(),
            max_span: default_max_span(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Device
// ─────────────────────────────────────────────────────────────────────────────

/// Protocol-specific device address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceAddress {
    Bacnet(BacnetAddress),
    Modbus(ModbusAddress),
}

impl DeviceAddress {
    pub fn protocol(&self) -> Protocol {
        match self {
            DeviceAddress::Bacnet(_) => Protocol::Bacnet,
            DeviceAddress::Modbus(_) => Protocol::Modbus,
        }
    }
}

impl std::fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceAddress::Bacnet(a) => match &a.endpoint {
                Some(ep) => write!(f, "bacnet:{}@{}", a.instance, ep),
                None => write!(f, "bacnet:{}", a.instance),
            },
            DeviceAddress::Modbus(a) => match &a.transport {
                Some(t) => write!(f, "modbus:{}@{}", a.unit_id, t),
                None => write!(f, "modbus:{}", a.unit_id),
            },
        }
    }
}

/// A field controller or gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub address: DeviceAddress,
    /// Poll interval override; the global default applies when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Parent gateway sharing its transport endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<DeviceId>,
}

fn default_enabled() -> bool {
    true
}

impl Device {
    pub fn new(id: DeviceId, name: impl Into<String>, address: DeviceAddress) -> Self {
        Self {
            id,
            name: name.into(),
            address,
            poll_interval_ms: None,
            enabled: true,
            parent_id: None,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = Some(interval.as_millis() as u64);
        self
    }

    pub fn with_parent(mut self, parent_id: DeviceId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn protocol(&self) -> Protocol {
        self.address.protocol()
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        self.poll_interval_ms.map(Duration::from_millis)
    }

    /// Effective poll interval given the global default and the protocol floor
    pub fn effective_interval(&self, global_default: Duration, floor: Duration) -> Duration {
        self.poll_interval().unwrap_or(global_default).max(floor)
    }

    /// Per-operation deadline derived from the protocol tuning
    pub fn operation_timeout(&self) -> Duration {
        match &self.address {
            DeviceAddress::Bacnet(a) => {
                let attempts = u64::from(a.tuning.apdu_retries) + 1;
                Duration::from_millis(a.tuning.apdu_timeout_ms.saturating_mul(attempts))
            }
            DeviceAddress::Modbus(a) => Duration::from_millis(a.tuning.response_timeout_ms),
        }
    }

    pub fn as_bacnet(&self) -> Option<&BacnetAddress> {
        match &self.address {
            DeviceAddress::Bacnet(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_modbus(&self) -> Option<&ModbusAddress> {
        match &self.address {
            DeviceAddress::Modbus(a) => Some(a),
            _ => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
