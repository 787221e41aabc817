//! Audit event sink.
//!
//! Components receive an [`AuditSink`] at construction and report rule
//! changes, limit violations and coordinator lifecycle events through it.
//! Emission is fire-and-forget: a failing sink never changes a decision.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::error::Result;

/// Event categories.
pub const CATEGORY_RATE_LIMIT: &str = "rate_limit";
pub const CATEGORY_RULES: &str = "rate_limiter_rules";
pub const CATEGORY_CLUSTER: &str = "cluster";

/// Severity of an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// A single audit event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub category: String,
    pub action: String,
    pub severity: Severity,
    #[serde(default)]
    pub context: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    /// Create an event stamped with wall-clock time.
    pub fn new(category: &str, action: &str, severity: Severity) -> Self {
        Self {
            category: category.to_string(),
            action: action.to_string(),
            severity,
            context: Map::new(),
            timestamp: Utc::now(),
        }
    }

    /// Stamp the event with a time taken from the emitter's clock.
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Attach a context field.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }
}

/// Destination for audit events.
pub trait AuditSink: Send + Sync {
    fn emit(&self, event: AuditEvent) -> Result<()>;
}

/// Emit an event, swallowing sink failures.
pub fn emit(sink: &dyn AuditSink, event: AuditEvent) {
    let action = event.action.clone();
    if let Err(e) = sink.emit(event) {
        debug!(action = %action, error = %e, "Audit emission failed");
    }
}

/// Writes audit events as `tracing` events on the `audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: AuditEvent) -> Result<()> {
        let context = Value::Object(event.context).to_string();
        match event.severity {
            Severity::Info => info!(
                target: "audit",
                category = %event.category,
                action = %event.action,
                context = %context,
                "audit"
            ),
            Severity::Warning => warn!(
                target: "audit",
                category = %event.category,
                action = %event.action,
                context = %context,
                "audit"
            ),
            Severity::Critical => error!(
                target: "audit",
                category = %event.category,
                action = %event.action,
                context = %context,
                "audit"
            ),
        }
        Ok(())
    }
}

/// Keeps audit events in memory for inspection.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded events, oldest first.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    /// Actions of all recorded events, oldest first.
    pub fn actions(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.action.clone()).collect()
    }

    /// Forget recorded events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl AuditSink for MemoryAuditSink {
    fn emit(&self, event: AuditEvent) -> Result<()> {
        self.events.lock().push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SwarmGuardError;

    struct FailingSink;

    impl AuditSink for FailingSink {
        fn emit(&self, _event: AuditEvent) -> Result<()> {
            Err(SwarmGuardError::Audit("sink down".to_string()))
        }
    }

    #[test]
    fn test_event_context() {
        let event = AuditEvent::new(CATEGORY_RATE_LIMIT, "reset", Severity::Info)
            .with("key", "rate_limit:ip:1.2.3.4")
            .with("count", 3);
        assert_eq!(event.context["key"], "rate_limit:ip:1.2.3.4");
        assert_eq!(event.context["count"], 3);
    }

    #[test]
    fn test_event_timestamp_from_clock() {
        let clock = crate::clock::ManualClock::new(1_600_000_000.0);
        let event = AuditEvent::new(CATEGORY_CLUSTER, "primary_elected", Severity::Info)
            .at(crate::clock::Clock::now_utc(&clock));
        assert_eq!(event.timestamp.timestamp(), 1_600_000_000);
    }

    #[test]
    fn test_memory_sink_records() {
        let sink = MemoryAuditSink::new();
        emit(&sink, AuditEvent::new(CATEGORY_RULES, "rule_added", Severity::Info));
        emit(&sink, AuditEvent::new(CATEGORY_RULES, "rule_removed", Severity::Warning));
        assert_eq!(sink.actions(), vec!["rule_added", "rule_removed"]);
        sink.clear();
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_failing_sink_is_swallowed() {
        emit(&FailingSink, AuditEvent::new(CATEGORY_CLUSTER, "node_registered", Severity::Info));
    }

    #[test]
    fn test_severity_serialization() {
        let json = serde_json::to_string(&Severity::Critical).unwrap();
        assert_eq!(json, "\"critical\"");
    }
}
