//! BMS Runtime - Polling and command core for BACnet and Modbus field devices
//!
//! This crate contains the protocol adapters, the device registry, the point
//! value cache, the per-device poll loops, the command dispatcher and the
//! discovery coordinator, tied together by [`FieldCore`].

pub use bms_types;

pub mod audit;
pub mod cache;
pub mod discovery;
pub mod dispatcher;
mod field_core;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod settings;

pub use audit::{
    AuditEvent, AuditKind, AuditOutcome, AuditSink, BroadcastAuditSink, TracingAuditSink,
};
pub use cache::PointValueCache;
pub use discovery::DiscoveryCoordinator;
pub use dispatcher::CommandDispatcher;
pub use field_core::{DeviceHealthReport, FieldCore, FieldCoreBuilder, PointReading};
pub use protocol::{AdapterFactory, ProtocolAdapter, SimNetwork, WireAdapterFactory};
pub use registry::{ChangeListener, DeviceRegistry, RegistryChange};
pub use scheduler::{
    DeviceHandle, DeviceHealth, DeviceStatus, LoopState, PollScheduler, SchedulerConfig,
};
pub use settings::{SettingsProvider, StaticSettings};
