//! Register value codec
//!
//! Converts between 16-bit register words and engineering values, honoring
//! byte order, word order and the point's scale factor.

use bms_types::{DataType, Endianness, Point, Value, coerce_binary};

use crate::protocol::{AdapterError, AdapterResult, PointError};

/// Raw bytes of a register run. `Little` word order reverses the words,
/// `Little` byte order swaps the two bytes of each word.
pub fn words_to_bytes(words: &[u16], byte_order: Endianness, word_order: Endianness) -> Vec<u8> {
    let mut ordered: Vec<u16> = words.to_vec();
    if word_order == Endianness::Little {
        ordered.reverse();
    }
    ordered
        .into_iter()
        .flat_map(|w| match byte_order {
            Endianness::Big => w.to_be_bytes(),
            Endianness::Little => w.to_le_bytes(),
        })
        .collect()
}

/// Inverse of [`words_to_bytes`]
pub fn bytes_to_words(bytes: &[u8], byte_order: Endianness, word_order: Endianness) -> Vec<u16> {
    let mut words: Vec<u16> = bytes
        .chunks(2)
        .map(|pair| {
            let pair = [pair[0], pair.get(1).copied().unwrap_or(0)];
            match byte_order {
                Endianness::Big => u16::from_be_bytes(pair),
                Endianness::Little => u16::from_le_bytes(pair),
            }
        })
        .collect();
    if word_order == Endianness::Little {
        words.reverse();
    }
    words
}

/// Decode a point's registers into its engineering value
pub fn decode_registers(
    words: &[u16],
    point: &Point,
    byte_order: Endianness,
    word_order: Endianness,
) -> Result<Value, PointError> {
    let needed = usize::from(point.data_type.register_count());
    if words.len() < needed {
        return Err(PointError(format!(
            "expected {} registers, got {}",
            needed,
            words.len()
        )));
    }
    let bytes = words_to_bytes(&words[..needed], byte_order, word_order);
    let raw = match point.data_type {
        DataType::Boolean => return Ok(Value::Bool(words[0] != 0)),
        DataType::Text => {
            let text: String = bytes
                .iter()
                .take_while(|b| **b != 0)
                .map(|b| char::from(*b))
                .collect();
            return Ok(Value::Text(text));
        }
        DataType::Int16 => f64::from(i16::from_be_bytes([bytes[0], bytes[1]])),
        DataType::UInt16 | DataType::Multistate => f64::from(u16::from_be_bytes([bytes[0], bytes[1]])),
        DataType::Int32 => f64::from(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
        DataType::UInt32 => f64::from(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
        DataType::Float32 => {
            let f = f32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            if !f.is_finite() {
                return Err(PointError(format!("non-finite float {}", f)));
            }
            f64::from(f)
        }
    };
    Ok(Value::Number(raw * point.scale_factor()))
}

/// Encode an engineering value into the point's registers
pub fn encode_registers(
    value: &Value,
    point: &Point,
    byte_order: Endianness,
    word_order: Endianness,
) -> AdapterResult<Vec<u16>> {
    let numeric = || {
        value
            .as_f64()
            .map(|n| n / point.scale_factor())
            .ok_or_else(|| AdapterError::Unsupported(format!("{} is not numeric", value)))
    };
    let bytes: Vec<u8> = match point.data_type {
        DataType::Boolean => return Ok(vec![u16::from(coerce_binary(value))]),
        DataType::Text => {
            let Value::Text(text) = value else {
                return Err(AdapterError::Unsupported(format!("{} is not text", value)));
            };
            let capacity = usize::from(point.data_type.register_count()) * 2;
            if text.len() > capacity {
                return Err(AdapterError::Unsupported(format!(
                    "text of {} bytes exceeds {} register bytes",
                    text.len(),
                    capacity
                )));
            }
            let mut bytes = text.as_bytes().to_vec();
            bytes.resize(capacity, 0);
            bytes
        }
        DataType::Int16 => (numeric()?.round() as i16).to_be_bytes().to_vec(),
        DataType::UInt16 | DataType::Multistate => (numeric()?.round() as u16).to_be_bytes().to_vec(),
        DataType::Int32 => (numeric()?.round() as i32).to_be_bytes().to_vec(),
        DataType::UInt32 => (numeric()?.round() as u32).to_be_bytes().to_vec(),
        DataType::Float32 => (numeric()? as f32).to_be_bytes().to_vec(),
    };
    Ok(bytes_to_words(&bytes, byte_order, word_order))
}
