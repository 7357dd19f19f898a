//! Protocol Adapters
//!
//! Every field protocol is driven through the same capability interface:
//! batched reads, prioritized writes, discovery, enumeration and close. The
//! scheduler and dispatcher never see protocol details; they hold a boxed
//! adapter chosen from the device's protocol tag by an [`AdapterFactory`].
//!
//! Adapters connect lazily. `close` drops the transport and the next
//! operation reconnects, which is how the poll loop recovers from transport
//! failures.

pub mod bacnet;
pub mod modbus;
pub mod sim;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use bms_types::{
    Candidate, CoreError, Device, DeviceAddress, Point, PointId, PointTemplate, Priority,
    Protocol, Value,
};

pub use bacnet::{BacnetAdapter, BacnetNetConfig};
pub use modbus::{ModbusAdapter, ModbusProbeConfig};
pub use sim::{SimAdapter, SimNetwork};

// ─────────────────────────────────────────────────────────────────────────────
// Adapter Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Device-level failure of an adapter operation
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AdapterError {
    /// No answer within the protocol deadline (after retries)
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// Connection refused/reset, socket failure or malformed frame
    #[error("transport error: {0}")]
    Transport(String),

    /// Device answered with an error, reject, abort or exception
    #[error("device error: {0}")]
    Remote(String),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl AdapterError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, AdapterError::Timeout(_))
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, AdapterError::Transport(_))
    }

    /// Map onto the public taxonomy for a given device
    pub fn into_core(self, device_id: bms_types::DeviceId) -> CoreError {
        match self {
            AdapterError::Timeout(_) => CoreError::Timeout(device_id),
            AdapterError::Transport(message) => CoreError::Transport {
                device: device_id,
                message,
            },
            AdapterError::Remote(message) => CoreError::DeviceRejected(message),
            AdapterError::Unsupported(message) => CoreError::Unsupported(message),
        }
    }
}

impl From<std::io::Error> for AdapterError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => AdapterError::Timeout(Duration::ZERO),
            _ => AdapterError::Transport(err.to_string()),
        }
    }
}

/// Result type for adapter operations
pub type AdapterResult<T> = Result<T, AdapterError>;

/// Failure of a single point inside an otherwise successful read
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{0}")]
pub struct PointError(pub String);

impl PointError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Per-point outcome of a batched read
pub type ReadResults = HashMap<PointId, Result<Value, PointError>>;

// ─────────────────────────────────────────────────────────────────────────────
// Adapter Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Uniform capability interface over one protocol transport
///
/// An adapter instance is exclusive to its owner: a device loop or a single
/// discovery run. Calls are never issued concurrently on one instance.
#[async_trait]
pub trait ProtocolAdapter: Send + 'static {
    fn protocol(&self) -> Protocol;

    /// Read the present value of every point, batched where the wire allows
    ///
    /// Returns `Err` only when the device as a whole failed. Individual point
    /// failures are reported inside the map.
    async fn read(&mut self, points: &[Arc<Point>]) -> AdapterResult<ReadResults>;

    /// Write a value, or relinquish when `value` is `None`
    async fn write(
        &mut self,
        point: &Point,
        value: Option<&Value>,
        priority: Option<Priority>,
    ) -> AdapterResult<()>;

    /// Collect candidates until `timeout` elapses, deduplicated by identity
    async fn discover(&mut self, timeout: Duration) -> AdapterResult<Vec<Candidate>>;

    /// List the addressable objects of the bound device
    async fn enumerate(&mut self) -> AdapterResult<Vec<PointTemplate>> {
        Ok(Vec::new())
    }

    /// Release the transport. Idempotent.
    async fn close(&mut self);
}

// ─────────────────────────────────────────────────────────────────────────────
// Adapter Factory
// ─────────────────────────────────────────────────────────────────────────────

/// Builds adapters from the device's protocol tag
pub trait AdapterFactory: Send + Sync + 'static {
    /// Adapter bound to one device. `device` has inherited gateway settings
    /// already applied.
    fn device_adapter(&self, device: &Device) -> AdapterResult<Box<dyn ProtocolAdapter>>;

    /// Fresh, unbound adapter for one discovery run
    fn discovery_adapter(&self, protocol: Protocol) -> AdapterResult<Box<dyn ProtocolAdapter>>;
}

/// Factory for the real BACnet/IP and Modbus transports
#[derive(Debug, Clone, Default)]
pub struct WireAdapterFactory {
    bacnet: BacnetNetConfig,
    modbus_probe: ModbusProbeConfig,
}

impl WireAdapterFactory {
    pub fn new(bacnet: BacnetNetConfig, modbus_probe: ModbusProbeConfig) -> Self {
        Self {
            bacnet,
            modbus_probe,
        }
    }

    /// Verify the BACnet socket can be bound. Failure here means the protocol
    /// cannot work at all and should abort startup.
    pub async fn preflight(&self) -> AdapterResult<()> {
        bacnet::BacnetClient::bind_ephemeral(&self.bacnet)
            .await
            .map(drop)
    }
}

impl AdapterFactory for WireAdapterFactory {
    fn device_adapter(&self, device: &Device) -> AdapterResult<Box<dyn ProtocolAdapter>> {
        match &device.address {
            DeviceAddress::Bacnet(address) => Ok(Box::new(BacnetAdapter::for_device(
                self.bacnet.clone(),
                address.clone(),
            ))),
            DeviceAddress::Modbus(address) => {
                let transport = address.transport.clone().ok_or_else(|| {
                    AdapterError::Unsupported(format!(
                        "modbus device {} has no transport endpoint",
                        device.id
                    ))
                })?;
                Ok(Box::new(ModbusAdapter::for_device(
                    transport,
                    address.unit_id,
                    address.tuning.clone(),
                )))
            }
        }
    }

    fn discovery_adapter(&self, protocol: Protocol) -> AdapterResult<Box<dyn ProtocolAdapter>> {
        match protocol {
            Protocol::Bacnet => Ok(Box::new(BacnetAdapter::for_discovery(self.bacnet.clone()))),
            Protocol::Modbus => Ok(Box::new(ModbusAdapter::for_discovery(
                self.modbus_probe.clone(),
            ))),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
