//! Write commands and their outcome

use serde::{Deserialize, Serialize};

use crate::{PointId, Priority, Value};

/// Request to set (or relinquish) a point's value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteCommand {
    pub point_id: PointId,
    /// Desired value; `None` relinquishes the priority slot
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    /// Who issued the command, forwarded to the audit trail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
}

impl WriteCommand {
    pub fn new(point_id: PointId, value: impl Into<Value>) -> Self {
        Self {
            point_id,
            value: Some(value.into()),
            priority: None,
            actor: None,
        }
    }

    pub fn relinquish(point_id: PointId, priority: Priority) -> Self {
        Self {
            point_id,
            value: None,
            priority: Some(priority),
            actor: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn is_relinquish(&self) -> bool {
        self.value.is_none()
    }
}

/// Result of an accepted write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteOutcome {
    pub point_id: PointId,
    /// Value sent to the device (`None` for a relinquish)
    pub written: Option<Value>,
    /// Present value observed right after the write, when the refresh read succeeded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub present_value: Option<Value>,
    /// Effective value implied by the local priority-array shadow
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_priority: Option<Priority>,
}
