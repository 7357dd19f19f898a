//! BACnet command priorities
//!
//! A commandable object holds sixteen priority slots. The lowest numbered
//! occupied slot determines the effective value; when every slot is empty the
//! relinquish default applies.

use serde::{Deserialize, Serialize};

use crate::{ValidationError, Value};

/// Number of slots in a priority array
pub const PRIORITY_LEVELS: usize = 16;

/// Write priority, 1 (highest authority) through 16 (lowest)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub const HIGHEST: Priority = Priority(1);
    pub const LOWEST: Priority = Priority(16);

    pub fn new(level: u8) -> Result<Self, ValidationError> {
        if (1..=PRIORITY_LEVELS as u8).contains(&level) {
            Ok(Self(level))
        } else {
            Err(ValidationError::InvalidPriority(level))
        }
    }

    pub fn level(&self) -> u8 {
        self.0
    }

    fn slot(&self) -> usize {
        (self.0 - 1) as usize
    }
}

impl TryFrom<u8> for Priority {
    type Error = ValidationError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Priority::new(value)
    }
}

impl From<Priority> for u8 {
    fn from(value: Priority) -> Self {
        value.0
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sixteen-slot priority array with a relinquish default
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriorityArray {
    slots: [Option<Value>; PRIORITY_LEVELS],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    relinquish_default: Option<Value>,
}

impl PriorityArray {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_relinquish_default(value: Value) -> Self {
        Self {
            relinquish_default: Some(value),
            ..Self::default()
        }
    }

    /// Command a slot. Writing the same slot again overwrites it; `None`
    /// relinquishes it.
    pub fn write(&mut self, priority: Priority, value: Option<Value>) {
        self.slots[priority.slot()] = value;
    }

    pub fn relinquish(&mut self, priority: Priority) {
        self.slots[priority.slot()] = None;
    }

    pub fn get(&self, priority: Priority) -> Option<&Value> {
        self.slots[priority.slot()].as_ref()
    }

    /// Highest-authority occupied slot
    pub fn active_priority(&self) -> Option<Priority> {
        self.slots
            .iter()
            .position(Option::is_some)
            .map(|slot| Priority(slot as u8 + 1))
    }

    /// Value the object would expose as its present-value
    pub fn effective(&self) -> Option<&Value> {
        self.slots
            .iter()
            .find_map(Option::as_ref)
            .or(self.relinquish_default.as_ref())
    }

    pub fn relinquish_default(&self) -> Option<&Value> {
        self.relinquish_default.as_ref()
    }

    pub fn set_relinquish_default(&mut self, value: Option<Value>) {
        self.relinquish_default = value;
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
