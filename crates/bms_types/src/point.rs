//! Point model
//!
//! A point is one addressable value inside a device.

use serde::{Deserialize, Serialize};

use crate::{DeviceId, Protocol};

/// Stable point identifier
pub type PointId = i64;

// ─────────────────────────────────────────────────────────────────────────────
// BACnet Object Types
// ─────────────────────────────────────────────────────────────────────────────

/// BACnet object type, serialized with its standard kebab-case name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ObjectType {
    AnalogInput,
    AnalogOutput,
    AnalogValue,
    BinaryInput,
    BinaryOutput,
    BinaryValue,
    Device,
    MultiStateInput,
    MultiStateOutput,
    MultiStateValue,
    Accumulator,
    PulseConverter,
    CharacterStringValue,
    IntegerValue,
    LargeAnalogValue,
    PositiveIntegerValue,
    /// Any object type without a dedicated variant
    Other(u16),
}

const OBJECT_TYPE_NAMES: &[(ObjectType, u16, &str)] = &[
    (ObjectType::AnalogInput, 0, "analog-input"),
    (ObjectType::AnalogOutput, 1, "analog-output"),
    (ObjectType::AnalogValue, 2, "analog-value"),
    (ObjectType::BinaryInput, 3, "binary-input"),
    (ObjectType::BinaryOutput, 4, "binary-output"),
    (ObjectType::BinaryValue, 5, "binary-value"),
    (ObjectType::Device, 8, "device"),
    (ObjectType::MultiStateInput, 13, "multi-state-input"),
    (ObjectType::MultiStateOutput, 14, "multi-state-output"),
    (ObjectType::MultiStateValue, 19, "multi-state-value"),
    (ObjectType::Accumulator, 23, "accumulator"),
    (ObjectType::PulseConverter, 24, "pulse-converter"),
    (ObjectType::CharacterStringValue, 40, "characterstring-value"),
    (ObjectType::IntegerValue, 45, "integer-value"),
    (ObjectType::LargeAnalogValue, 46, "large-analog-value"),
    (ObjectType::PositiveIntegerValue, 48, "positive-integer-value"),
];

impl ObjectType {
    /// Numeric object type code used on the wire
    pub fn code(&self) -> u16 {
        match self {
            ObjectType::Other(code) => *code,
            known => OBJECT_TYPE_NAMES
                .iter()
                .find(|(t, _, _)| t == known)
                .map(|(_, code, _)| *code)
                .unwrap_or_default(),
        }
    }

    pub fn from_code(code: u16) -> Self {
        OBJECT_TYPE_NAMES
            .iter()
            .find(|(_, c, _)| *c == code)
            .map(|(t, _, _)| *t)
            .unwrap_or(ObjectType::Other(code))
    }

    /// Whether the object carries a pollable present-value property
    pub fn has_present_value(&self) -> bool {
        !matches!(self, ObjectType::Device | ObjectType::Other(_))
    }

    /// Input objects are read-only from the network
    pub fn is_input(&self) -> bool {
        matches!(
            self,
            ObjectType::AnalogInput
                | ObjectType::BinaryInput
                | ObjectType::MultiStateInput
                | ObjectType::Accumulator
                | ObjectType::PulseConverter
        )
    }

    /// Whether present-value writes go through the priority array
    pub fn is_commandable(&self) -> bool {
        matches!(
            self,
            ObjectType::AnalogOutput
                | ObjectType::AnalogValue
                | ObjectType::BinaryOutput
                | ObjectType::BinaryValue
                | ObjectType::MultiStateOutput
                | ObjectType::MultiStateValue
                | ObjectType::CharacterStringValue
                | ObjectType::IntegerValue
                | ObjectType::LargeAnalogValue
                | ObjectType::PositiveIntegerValue
        )
    }

    /// Natural data type of the object's present-value
    pub fn default_data_type(&self) -> DataType {
        match self {
            ObjectType::BinaryInput | ObjectType::BinaryOutput | ObjectType::BinaryValue => {
                DataType::Boolean
            }
            ObjectType::MultiStateInput
            | ObjectType::MultiStateOutput
            | ObjectType::MultiStateValue => DataType::Multistate,
            ObjectType::CharacterStringValue => DataType::Text,
            ObjectType::IntegerValue => DataType::Int32,
            ObjectType::PositiveIntegerValue | ObjectType::Accumulator => DataType::UInt32,
            _ => DataType::Float32,
        }
    }
}

impl std::fmt::Display for ObjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectType::Other(code) => write!(f, "object-type-{}", code),
            known => {
                let name = OBJECT_TYPE_NAMES
                    .iter()
                    .find(|(t, _, _)| t == known)
                    .map(|(_, _, name)| *name)
                    .unwrap_or("unknown");
                write!(f, "{}", name)
            }
        }
    }
}

impl std::str::FromStr for ObjectType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        if let Some((t, _, _)) = OBJECT_TYPE_NAMES.iter().find(|(_, _, n)| *n == normalized) {
            return Ok(*t);
        }
        if let Some(code) = normalized.strip_prefix("object-type-") {
            return code
                .parse::<u16>()
                .map(ObjectType::from_code)
                .map_err(|_| format!("invalid object type '{}'", s));
        }
        Err(format!("unknown object type '{}'", s))
    }
}

impl TryFrom<String> for ObjectType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ObjectType> for String {
    fn from(value: ObjectType) -> Self {
        value.to_string()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Modbus Register Kinds
// ─────────────────────────────────────────────────────────────────────────────

/// Modbus data table a point lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterKind {
    Coil,
    DiscreteInput,
    HoldingRegister,
    InputRegister,
}

impl RegisterKind {
    /// Single-bit tables
    pub fn is_bit(&self) -> bool {
        matches!(self, RegisterKind::Coil | RegisterKind::DiscreteInput)
    }

    /// Tables a master may write
    pub fn is_writable(&self) -> bool {
        matches!(self, RegisterKind::Coil | RegisterKind::HoldingRegister)
    }
}

impl std::fmt::Display for RegisterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegisterKind::Coil => write!(f, "coil"),
            RegisterKind::DiscreteInput => write!(f, "discrete_input"),
            RegisterKind::HoldingRegister => write!(f, "holding_register"),
            RegisterKind::InputRegister => write!(f, "input_register"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Data Types
// ─────────────────────────────────────────────────────────────────────────────

/// Value format of a point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    #[serde(alias = "bool", alias = "binary")]
    Boolean,
    Int16,
    #[serde(alias = "u16")]
    UInt16,
    Int32,
    #[serde(alias = "u32")]
    UInt32,
    #[serde(alias = "float", alias = "real")]
    Float32,
    Multistate,
    #[serde(alias = "string")]
    Text,
}

impl DataType {
    /// Number of 16-bit registers occupied by this type
    pub fn register_count(&self) -> u16 {
        match self {
            DataType::Int32 | DataType::UInt32 | DataType::Float32 => 2,
            _ => 1,
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            DataType::Int16
                | DataType::UInt16
                | DataType::Int32
                | DataType::UInt32
                | DataType::Multistate
        )
    }

    /// Inclusive raw range for integer types
    pub fn integer_bounds(&self) -> Option<(f64, f64)> {
        match self {
            DataType::Int16 => Some((i16::MIN as f64, i16::MAX as f64)),
            DataType::UInt16 => Some((0.0, u16::MAX as f64)),
            DataType::Int32 => Some((i32::MIN as f64, i32::MAX as f64)),
            DataType::UInt32 => Some((0.0, u32::MAX as f64)),
            DataType::Multistate => Some((1.0, u32::MAX as f64)),
            _ => None,
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DataType::Boolean => "boolean",
            DataType::Int16 => "int16",
            DataType::UInt16 => "uint16",
            DataType::Int32 => "int32",
            DataType::UInt32 => "uint32",
            DataType::Float32 => "float32",
            DataType::Multistate => "multistate",
            DataType::Text => "text",
        };
        write!(f, "{}", name)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Point
// ─────────────────────────────────────────────────────────────────────────────

/// Protocol-specific point address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum PointAddress {
    Bacnet {
        object_type: ObjectType,
        instance: u32,
    },
    Modbus {
        register: RegisterKind,
        address: u16,
    },
}

impl PointAddress {
    pub fn protocol(&self) -> Protocol {
        match self {
            PointAddress::Bacnet { .. } => Protocol::Bacnet,
            PointAddress::Modbus { .. } => Protocol::Modbus,
        }
    }

    /// Whether the addressed object can be written at all
    pub fn supports_write(&self) -> bool {
        match self {
            PointAddress::Bacnet { object_type, .. } => {
                object_type.has_present_value() && !object_type.is_input()
            }
            PointAddress::Modbus { register, .. } => register.is_writable(),
        }
    }
}

impl std::fmt::Display for PointAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PointAddress::Bacnet {
                object_type,
                instance,
            } => write!(f, "{}:{}", object_type, instance),
            PointAddress::Modbus { register, address } => write!(f, "{}:{}", register, address),
        }
    }
}

/// One addressable value within a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub id: PointId,
    pub device_id: DeviceId,
    pub name: String,
    pub address: PointAddress,
    pub data_type: DataType,
    /// Engineering value = raw value × scale
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,
    #[serde(default)]
    pub writable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
}

impl Point {
    pub fn new(
        id: PointId,
        device_id: DeviceId,
        name: impl Into<String>,
        address: PointAddress,
        data_type: DataType,
    ) -> Self {
        Self {
            id,
            device_id,
            name: name.into(),
            address,
            data_type,
            scale: None,
            writable: false,
            units: None,
        }
    }

    /// BACnet point with the object's natural data type
    pub fn bacnet(id: PointId, device_id: DeviceId, object_type: ObjectType, instance: u32) -> Self {
        Self::new(
            id,
            device_id,
            format!("{}:{}", object_type, instance),
            PointAddress::Bacnet {
                object_type,
                instance,
            },
            object_type.default_data_type(),
        )
    }

    pub fn modbus(
        id: PointId,
        device_id: DeviceId,
        register: RegisterKind,
        address: u16,
        data_type: DataType,
    ) -> Self {
        Self::new(
            id,
            device_id,
            format!("{}:{}", register, address),
            PointAddress::Modbus { register, address },
            data_type,
        )
    }

    pub fn writable(mut self) -> Self {
        self.writable = true;
        self
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = Some(scale);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Scale factor, 1.0 when unset or zero
    pub fn scale_factor(&self) -> f64 {
        match self.scale {
            Some(s) if s != 0.0 && s.is_finite() => s,
            _ => 1.0,
        }
    }

    /// Whether a write must be rejected before reaching the wire
    pub fn is_writable(&self) -> bool {
        self.writable && self.address.supports_write()
    }
}

/// Point description produced by enumerating a device, ready to be persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointTemplate {
    pub name: String,
    pub address: PointAddress,
    pub data_type: DataType,
    pub writable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_type_names_and_codes() {
        assert_eq!(ObjectType::AnalogOutput.code(), 1);
        assert_eq!(ObjectType::from_code(19), ObjectType::MultiStateValue);
        assert_eq!(ObjectType::from_code(999), ObjectType::Other(999));
        assert_eq!("analog_input".parse::<ObjectType>().unwrap(), ObjectType::AnalogInput);
        assert_eq!(ObjectType::Other(130).to_string(), "object-type-130");
        assert_eq!(
            "object-type-130".parse::<ObjectType>().unwrap(),
            ObjectType::Other(130)
        );
    }

    #[test]
    fn test_point_address_serde() {
        let addr = PointAddress::Bacnet {
            object_type: ObjectType::BinaryOutput,
            instance: 3,
        };
        let json = serde_json::to_value(addr).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"protocol": "bacnet", "object_type": "binary-output", "instance": 3})
        );
        let back: PointAddress = serde_json::from_value(json).unwrap();
        assert_eq!(back, addr);
    }

    #[test]
    fn test_input_objects_never_writable() {
        let ai = Point::bacnet(1, 1, ObjectType::AnalogInput, 1).writable();
        let ao = Point::bacnet(2, 1, ObjectType::AnalogOutput, 1).writable();
        let ir = Point::modbus(3, 1, RegisterKind::InputRegister, 0, DataType::UInt16).writable();
        assert!(!ai.is_writable());
        assert!(ao.is_writable());
        assert!(!ir.is_writable());
    }

    #[test]
    fn test_register_counts() {
        assert_eq!(DataType::Float32.register_count(), 2);
        assert_eq!(DataType::Int16.register_count(), 1);
        assert_eq!(DataType::Boolean.register_count(), 1);
    }
}
