//! Audit Events
//!
//! One event per accepted write and per discovery run, handed to an
//! [`AuditSink`]. Sinks must not block; the dispatcher calls them inline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use bms_types::Value;

// ─────────────────────────────────────────────────────────────────────────────
// Event
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Write,
    Relinquish,
    Discovery,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum AuditOutcome {
    Ok,
    Failed(String),
}

impl AuditOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, AuditOutcome::Ok)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Who asked for the operation; "system" when unknown
    pub actor: String,
    pub kind: AuditKind,
    /// "point:<id>" or "discovery:<protocol>"
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
    pub outcome: AuditOutcome,
    /// Free-form context, e.g. the priority or candidate count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl AuditEvent {
    pub fn new(kind: AuditKind, target: impl Into<String>, outcome: AuditOutcome) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            actor: "system".to_string(),
            kind,
            target: target.into(),
            old_value: None,
            new_value: None,
            outcome,
            detail: None,
        }
    }

    pub fn with_actor(mut self, actor: Option<&str>) -> Self {
        if let Some(actor) = actor {
            self.actor = actor.to_string();
        }
        self
    }

    pub fn with_values(mut self, old_value: Option<Value>, new_value: Option<Value>) -> Self {
        self.old_value = old_value;
        self.new_value = new_value;
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sinks
// ─────────────────────────────────────────────────────────────────────────────

/// External audit log
pub trait AuditSink: Send + Sync + 'static {
    fn persist(&self, event: AuditEvent);
}

/// Writes audit events to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn persist(&self, event: AuditEvent) {
        match &event.outcome {
            AuditOutcome::Ok => tracing::info!(
                audit_id = %event.id,
                actor = %event.actor,
                kind = ?event.kind,
                target = %event.target,
                old = ?event.old_value,
                new = ?event.new_value,
                detail = ?event.detail,
                "Audit"
            ),
            AuditOutcome::Failed(reason) => tracing::warn!(
                audit_id = %event.id,
                actor = %event.actor,
                kind = ?event.kind,
                target = %event.target,
                new = ?event.new_value,
                reason = %reason,
                "Audit"
            ),
        }
    }
}

/// Publishes audit events on a broadcast channel
#[derive(Clone)]
pub struct BroadcastAuditSink {
    tx: broadcast::Sender<AuditEvent>,
}

impl BroadcastAuditSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuditEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastAuditSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl AuditSink for BroadcastAuditSink {
    fn persist(&self, event: AuditEvent) {
        // No subscribers is not an error
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_outcome_reason() {
        let event = AuditEvent::new(
            AuditKind::Write,
            "point:7",
            AuditOutcome::Failed("device-unreachable".into()),
        )
        .with_actor(Some("operator"))
        .with_values(Some(Value::Number(40.0)), Some(Value::Number(42.0)));

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["actor"], "operator");
        assert_eq!(json["outcome"]["status"], "failed");
        assert_eq!(json["outcome"]["reason"], "device-unreachable");
        assert_eq!(json["new_value"], 42.0);
    }

    #[tokio::test]
    async fn test_broadcast_sink_delivers() {
        let sink = BroadcastAuditSink::new(8);
        let mut rx = sink.subscribe();
        sink.persist(AuditEvent::new(AuditKind::Discovery, "discovery:BACNET", AuditOutcome::Ok));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, AuditKind::Discovery);
        assert!(event.outcome.is_ok());
    }
}
