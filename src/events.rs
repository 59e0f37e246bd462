use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};

/// Severity of an anti-cheat event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

/// A single anti-cheat event.
#[derive(Debug, Clone, Serialize)]
pub struct AcEvent {
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    #[serde(rename = "type")]
    pub event_type: String,
    pub description: String,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,
}

impl AcEvent {
    /// The key-value payload as a single-line JSON object, for `events.log`.
    pub fn payload_json(&self) -> String {
        serde_json::to_string(&self.data).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Append-only in-memory log of anti-cheat events.
///
/// Lives for the session only; durability is the recorder's concern.
/// Appends are serialized; retrieval copies a snapshot.
#[derive(Default)]
pub struct EventLog {
    events: Mutex<Vec<AcEvent>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log a paste attempt (critical).
    pub fn log_paste_attempt(&self, source: &str, length: usize) -> AcEvent {
        let mut data = Map::new();
        data.insert("source".into(), Value::from(source));
        data.insert("length".into(), Value::from(length));
        self.log_custom(
            Severity::Critical,
            "paste_attempt",
            &format!("Paste attempt detected from {source}"),
            data,
        )
    }

    /// Log a rate-limit violation (warning).
    pub fn log_rapid_input(&self, chars_per_second: usize, burst_size: usize) -> AcEvent {
        let mut data = Map::new();
        data.insert("chars_per_second".into(), Value::from(chars_per_second));
        data.insert("burst_size".into(), Value::from(burst_size));
        self.log_custom(
            Severity::Warning,
            "rapid_input",
            &format!("Rapid input detected: {chars_per_second} chars/sec"),
            data,
        )
    }

    /// Log an unusual typing pattern (warning).
    pub fn log_typing_anomaly(&self, anomaly_type: &str, details: Map<String, Value>) -> AcEvent {
        self.log_custom(
            Severity::Warning,
            "typing_anomaly",
            &format!("Typing anomaly detected: {anomaly_type}"),
            details,
        )
    }

    /// Log window/tab focus loss (info).
    pub fn log_focus_loss(&self, duration_ms: i64) -> AcEvent {
        let mut data = Map::new();
        data.insert("duration_ms".into(), Value::from(duration_ms));
        self.log_custom(Severity::Info, "focus_loss", "Window/tab lost focus", data)
    }

    /// Log an arbitrary event.
    pub fn log_custom(
        &self,
        severity: Severity,
        event_type: &str,
        description: &str,
        data: Map<String, Value>,
    ) -> AcEvent {
        let event = AcEvent {
            timestamp: Utc::now(),
            severity,
            event_type: event_type.to_string(),
            description: description.to_string(),
            data,
        };
        self.events.lock().push(event.clone());
        event
    }

    /// Snapshot of all events in append order.
    pub fn events(&self) -> Vec<AcEvent> {
        self.events.lock().clone()
    }

    /// Snapshot of events with the given severity.
    pub fn events_by_severity(&self, severity: Severity) -> Vec<AcEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.severity == severity)
            .cloned()
            .collect()
    }

    /// Count of events with the given severity.
    pub fn count_by_severity(&self, severity: Severity) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.severity == severity)
            .count()
    }

    /// Summary counters keyed `"<severity>_<type>"`, plus per-severity and
    /// `"total"` counters.
    pub fn summary(&self) -> HashMap<String, u64> {
        let mut summary = HashMap::new();
        for event in self.events.lock().iter() {
            *summary
                .entry(format!("{}_{}", event.severity.as_str(), event.event_type))
                .or_insert(0) += 1;
            *summary.entry(event.severity.as_str().to_string()).or_insert(0) += 1;
            *summary.entry("total".to_string()).or_insert(0) += 1;
        }
        summary
    }
}
