//! Point values, quality and write coercion

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::{DataType, Point, PointAddress, ValidationError};

// ─────────────────────────────────────────────────────────────────────────────
// Value
// ─────────────────────────────────────────────────────────────────────────────

/// A point value as read from or written to a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Text(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Text(_) => "text",
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::Text(s) => write!(f, "\"{}\"", s),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Quality
// ─────────────────────────────────────────────────────────────────────────────

/// Freshness of a cached value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    /// Read successfully on the last attempt
    Good,
    /// Device did not answer; value is the last known one
    Stale,
    /// Device answered with an error for this point
    Error,
}

impl std::fmt::Display for Quality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Quality::Good => write!(f, "good"),
            Quality::Stale => write!(f, "stale"),
            Quality::Error => write!(f, "error"),
        }
    }
}

/// Cache entry holding the latest observed state of a point
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointValue {
    pub value: Value,
    pub quality: Quality,
    /// Time of the last successful read
    pub timestamp: DateTime<Utc>,
    /// Reason for the current non-good quality
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Completion time of the operation that produced this entry
    #[serde(skip, default = "Instant::now")]
    pub completed_at: Instant,
}

impl PointValue {
    pub fn good(value: Value, completed_at: Instant) -> Self {
        Self {
            value,
            quality: Quality::Good,
            timestamp: Utc::now(),
            error: None,
            completed_at,
        }
    }

    pub fn is_good(&self) -> bool {
        self.quality == Quality::Good
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Write Coercion
// ─────────────────────────────────────────────────────────────────────────────

/// Binary coercion: "active", 1 and true map to ON, everything else to OFF
pub fn coerce_binary(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => *n == 1.0,
        Value::Text(s) => s.trim().eq_ignore_ascii_case("active"),
    }
}

/// Validate and normalize a requested value for a point's data format.
///
/// Returns the engineering value that will be written.
pub fn coerce_for_point(point: &Point, value: &Value) -> Result<Value, ValidationError> {
    match point.data_type {
        DataType::Boolean => Ok(Value::Bool(coerce_binary(value))),
        DataType::Text => {
            let text = match value {
                Value::Text(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                other => {
                    return Err(ValidationError::InvalidType {
                        expected: "text",
                        got: other.kind().to_string(),
                    });
                }
            };
            // Register-backed text has a fixed byte capacity
            if let PointAddress::Modbus { .. } = point.address {
                let capacity = usize::from(point.data_type.register_count()) * 2;
                if text.len() > capacity {
                    return Err(ValidationError::OutOfRange {
                        value: format!("\"{}\"", text),
                        data_type: point.data_type,
                    });
                }
            }
            Ok(Value::Text(text))
        }
        DataType::Float32 => {
            let n = numeric_input(value)?;
            let raw = n / point.scale_factor();
            if !raw.is_finite() || raw.abs() > f32::MAX as f64 {
                return Err(ValidationError::OutOfRange {
                    value: n.to_string(),
                    data_type: point.data_type,
                });
            }
            Ok(Value::Number(n))
        }
        data_type => {
            let n = numeric_input(value)?;
            let scale = point.scale_factor();
            let raw = n / scale;
            if point.scale.is_none() && raw.fract() != 0.0 {
                return Err(ValidationError::InvalidType {
                    expected: "integer",
                    got: n.to_string(),
                });
            }
            let raw = raw.round();
            let (min, max) = data_type
                .integer_bounds()
                .unwrap_or((f64::MIN, f64::MAX));
            if raw < min || raw > max {
                return Err(ValidationError::OutOfRange {
                    value: n.to_string(),
                    data_type,
                });
            }
            Ok(Value::Number(raw * scale))
        }
    }
}

fn numeric_input(value: &Value) -> Result<f64, ValidationError> {
    let n = match value {
        Value::Number(n) => *n,
        Value::Text(s) => s.trim().parse::<f64>().map_err(|_| ValidationError::InvalidType {
            expected: "number",
            got: format!("\"{}\"", s),
        })?,
        Value::Bool(_) => {
            return Err(ValidationError::InvalidType {
                expected: "number",
                got: "boolean".to_string(),
            });
        }
    };
    if n.is_finite() {
        Ok(n)
    } else {
        Err(ValidationError::InvalidType {
            expected: "finite number",
            got: n.to_string(),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ObjectType, RegisterKind};

    #[test]
    fn test_binary_coercion() {
        assert!(coerce_binary(&Value::from("active")));
        assert!(coerce_binary(&Value::from("ACTIVE")));
        assert!(coerce_binary(&Value::Number(1.0)));
        assert!(coerce_binary(&Value::Bool(true)));
        assert!(!coerce_binary(&Value::from("inactive")));
        assert!(!coerce_binary(&Value::Number(2.0)));
        assert!(!coerce_binary(&Value::from("on please")));
        assert!(!coerce_binary(&Value::from("on")));
        assert!(!coerce_binary(&Value::from("true")));
        assert!(!coerce_binary(&Value::from("1")));
    }

    #[test]
    fn test_untagged_value_deserialization() {
        let v: Value = serde_json::from_str("42.5").unwrap();
        assert_eq!(v, Value::Number(42.5));
        let v: Value = serde_json::from_str("\"active\"").unwrap();
        assert_eq!(v, Value::Text("active".into()));
        let v: Value = serde_json::from_str("true").unwrap();
        assert_eq!(v, Value::Bool(true));
    }

    #[test]
    fn test_integer_range_validation() {
        let point = Point::modbus(1, 1, RegisterKind::HoldingRegister, 0, DataType::UInt16);
        assert_eq!(
            coerce_for_point(&point, &Value::Number(65535.0)).unwrap(),
            Value::Number(65535.0)
        );
        assert!(matches!(
            coerce_for_point(&point, &Value::Number(65536.0)),
            Err(ValidationError::OutOfRange { .. })
        ));
        assert!(matches!(
            coerce_for_point(&point, &Value::Number(-1.0)),
            Err(ValidationError::OutOfRange { .. })
        ));
        assert!(matches!(
            coerce_for_point(&point, &Value::Number(1.5)),
            Err(ValidationError::InvalidType { .. })
        ));
    }

    #[test]
    fn test_scaled_integer_rounds_to_raw_step() {
        let point = Point::modbus(1, 1, RegisterKind::HoldingRegister, 0, DataType::Int16)
            .with_scale(0.1);
        let coerced = coerce_for_point(&point, &Value::Number(21.53)).unwrap();
        let n = coerced.as_f64().unwrap();
        assert!((n - 21.5).abs() < 1e-9);

        // 3276.8 / 0.1 = 32768 exceeds i16
        assert!(coerce_for_point(&point, &Value::Number(3276.8)).is_err());
    }

    #[test]
    fn test_numeric_string_accepted_for_analog() {
        let point = Point::bacnet(1, 1, ObjectType::AnalogOutput, 1);
        assert_eq!(
            coerce_for_point(&point, &Value::from("42.0")).unwrap(),
            Value::Number(42.0)
        );
        assert!(coerce_for_point(&point, &Value::from("warm")).is_err());
        assert!(coerce_for_point(&point, &Value::Bool(true)).is_err());
    }

    #[test]
    fn test_register_text_is_bounded_by_capacity() {
        let point = Point::modbus(1, 1, RegisterKind::HoldingRegister, 0, DataType::Text);
        assert_eq!(
            coerce_for_point(&point, &Value::from("AB")).unwrap(),
            Value::Text("AB".into())
        );
        assert!(matches!(
            coerce_for_point(&point, &Value::from("ABC")),
            Err(ValidationError::OutOfRange { .. })
        ));

        let bacnet = Point::bacnet(2, 1, ObjectType::CharacterStringValue, 1);
        assert!(coerce_for_point(&bacnet, &Value::from("a longer label")).is_ok());
    }

    #[test]
    fn test_multistate_rejects_zero() {
        let point = Point::bacnet(1, 1, ObjectType::MultiStateValue, 1);
        assert!(coerce_for_point(&point, &Value::Number(0.0)).is_err());
        assert!(coerce_for_point(&point, &Value::Number(3.0)).is_ok());
    }
}
