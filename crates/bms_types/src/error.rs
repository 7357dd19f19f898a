//! Error taxonomy shared by the core and its callers

use crate::{DataType, DeviceId, PointId, Protocol};

/// Result type alias
pub type CoreResult<T> = std::result::Result<T, CoreError>;

/// Reasons a write request is rejected before reaching the wire
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("point {0} is not writable")]
    NotWritable(PointId),

    #[error("value {value} is out of range for {data_type}")]
    OutOfRange { value: String, data_type: DataType },

    #[error("expected {expected}, got {got}")]
    InvalidType { expected: &'static str, got: String },

    #[error("invalid priority {0}, expected 1..=16")]
    InvalidPriority(u8),

    #[error("{0} points cannot be relinquished")]
    RelinquishUnsupported(Protocol),

    #[error("address {0} already used on device {1}")]
    DuplicateAddress(String, DeviceId),

    #[error("point {point} does not belong to device {device}")]
    WrongDevice { point: PointId, device: DeviceId },

    #[error("point protocol does not match device {0}")]
    ProtocolMismatch(DeviceId),
}

impl ValidationError {
    /// Short machine-readable reason
    pub fn reason(&self) -> &'static str {
        match self {
            ValidationError::NotWritable(_) => "not-writable",
            ValidationError::OutOfRange { .. } => "out-of-range",
            ValidationError::InvalidType { .. } => "invalid-type",
            ValidationError::InvalidPriority(_) => "invalid-priority",
            ValidationError::RelinquishUnsupported(_) => "relinquish-unsupported",
            ValidationError::DuplicateAddress(..) => "duplicate-address",
            ValidationError::WrongDevice { .. } => "wrong-device",
            ValidationError::ProtocolMismatch(_) => "protocol-mismatch",
        }
    }
}

/// Errors surfaced by the public core operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoreError {
    #[error("device {0} did not respond in time")]
    Timeout(DeviceId),

    #[error("transport error on device {device}: {message}")]
    Transport { device: DeviceId, message: String },

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("device {0} was removed while the operation was pending")]
    Cancelled(DeviceId),

    #[error("device rejected the request: {0}")]
    DeviceRejected(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl CoreError {
    pub fn device_not_found(id: DeviceId) -> Self {
        CoreError::NotFound(format!("device {}", id))
    }

    pub fn point_not_found(id: PointId) -> Self {
        CoreError::NotFound(format!("point {}", id))
    }

    /// Short machine-readable reason shown to operators
    pub fn reason(&self) -> &'static str {
        match self {
            CoreError::Timeout(_) | CoreError::Transport { .. } => "device-unreachable",
            CoreError::Validation(e) => e.reason(),
            CoreError::NotFound(_) => "not-found",
            CoreError::Cancelled(_) => "cancelled",
            CoreError::DeviceRejected(_) => "device-rejected",
            CoreError::Unsupported(_) => "unsupported",
            CoreError::Config(_) => "config",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reasons_are_specific() {
        assert_eq!(
            CoreError::from(ValidationError::NotWritable(3)).reason(),
            "not-writable"
        );
        assert_eq!(
            CoreError::from(ValidationError::OutOfRange {
                value: "70000".into(),
                data_type: DataType::UInt16,
            })
            .reason(),
            "out-of-range"
        );
        assert_eq!(CoreError::Timeout(1).reason(), "device-unreachable");
        assert_eq!(
            CoreError::Transport {
                device: 1,
                message: "connection refused".into()
            }
            .reason(),
            "device-unreachable"
        );
    }
}
