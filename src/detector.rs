use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::events::{AcEvent, EventLog, Severity};
use crate::ratelimit::{BurstMeter, RateMeter};

/// Chunks with more than one character arriving closer together than this are
/// flagged as a typing anomaly.
const MULTI_CHAR_ANOMALY_GAP: Duration = Duration::from_millis(50);

/// Burst meter parameters: 30 chars within 100 ms reads as a paste.
const BURST_CHARS: usize = 30;
const BURST_WINDOW: Duration = Duration::from_millis(100);

struct KeystrokeTracking {
    keystroke_count: usize,
    session_start: Instant,
    last_keystroke: Instant,
}

/// Real-time anti-cheat detector.
///
/// Combines the sliding-window rate meter, the fixed-window burst meter, and
/// the in-memory event log. All findings are advisory: `check_input` always
/// allows, and the WS bridge separately enforces the hard oversized-chunk
/// block.
pub struct Detector {
    rate: RateMeter,
    burst: BurstMeter,
    log: EventLog,
    tracking: Mutex<KeystrokeTracking>,
}

/// Observability snapshot of the detector's session counters.
#[derive(Debug, Serialize)]
pub struct DetectorStats {
    pub total_keystrokes: usize,
    pub session_duration_seconds: f64,
    pub average_wpm: f64,
    pub current_rate: usize,
    pub event_summary: std::collections::HashMap<String, u64>,
    pub critical_events: usize,
    pub warning_events: usize,
    pub info_events: usize,
}

impl Detector {
    pub fn new(max_chars_per_second: usize) -> Self {
        let now = Instant::now();
        Self {
            rate: RateMeter::new(max_chars_per_second),
            burst: BurstMeter::new(BURST_CHARS, BURST_WINDOW),
            log: EventLog::new(),
            tracking: Mutex::new(KeystrokeTracking {
                keystroke_count: 0,
                session_start: now,
                last_keystroke: now,
            }),
        }
    }

    /// Inspect an inbound chunk.
    ///
    /// Returns `(allowed, violations)`. `allowed` mirrors the rate meter's
    /// advisory result; every violation has already been appended to the
    /// event log when this returns.
    pub fn check_input(&self, data: &[u8]) -> (bool, Vec<AcEvent>) {
        let length = data.len();
        let mut violations = Vec::new();

        let time_since_last = {
            let mut tracking = self.tracking.lock();
            tracking.keystroke_count += length;
            let now = Instant::now();
            let gap = now.duration_since(tracking.last_keystroke);
            tracking.last_keystroke = now;
            gap
        };

        let decision = self.rate.check(length);
        if decision.violation {
            let event = self.log.log_rapid_input(decision.current_rate, length);
            tracing::warn!(
                current_rate = decision.current_rate,
                limit = self.rate.limit(),
                "rate limit exceeded"
            );
            violations.push(event);
        }

        let (is_burst, burst_size) = self.burst.check(length);
        if is_burst {
            let event = self.log.log_paste_attempt("server_burst_detection", burst_size);
            tracing::warn!(burst_size, "paste-like input burst detected");
            violations.push(event);
        }

        if length > 1 && time_since_last < MULTI_CHAR_ANOMALY_GAP {
            let mut details = Map::new();
            details.insert("chars".into(), Value::from(length));
            details.insert(
                "time_since_last_ms".into(),
                Value::from(time_since_last.as_millis() as u64),
            );
            violations.push(self.log.log_typing_anomaly("fast_multi_char", details));
        }

        (decision.allowed, violations)
    }

    /// Record the bridge's hard block of an oversized inbound chunk.
    pub fn record_blocked_chunk(&self, length: usize) -> AcEvent {
        let mut data = Map::new();
        data.insert("chars".into(), Value::from(length));
        self.log.log_custom(
            Severity::Critical,
            "paste_blocked",
            "Oversized input chunk blocked before reaching the shell",
            data,
        )
    }

    /// Record a structured client-side report.
    ///
    /// Client reports are trusted only as hints; the authoritative events are
    /// the server-side decisions. Severity mapping: paste → critical,
    /// rapid input → warning, focus/visibility → info.
    pub fn record_client_event(&self, event_type: &str, data: Map<String, Value>) -> AcEvent {
        let (severity, description) = match event_type {
            "paste_attempt" => (Severity::Critical, "Client-side paste attempt blocked".to_string()),
            "rapid_input" => (Severity::Warning, "Client detected rapid input".to_string()),
            "window_focus" => {
                let gained = data.get("gained").and_then(Value::as_bool).unwrap_or(true);
                let description = if gained {
                    "Window gained focus"
                } else {
                    "Window lost focus"
                };
                (Severity::Info, description.to_string())
            }
            "tab_visibility" => {
                let hidden = data.get("hidden").and_then(Value::as_bool).unwrap_or(false);
                let description = if hidden { "Tab hidden" } else { "Tab visible" };
                (Severity::Info, description.to_string())
            }
            other => (Severity::Info, format!("Client event: {other}")),
        };

        self.log.log_custom(severity, event_type, &description, data)
    }

    /// Session statistics for observability.
    pub fn statistics(&self) -> DetectorStats {
        let (keystroke_count, duration) = {
            let tracking = self.tracking.lock();
            (
                tracking.keystroke_count,
                tracking.session_start.elapsed().as_secs_f64(),
            )
        };

        let average_wpm = if duration > 0.0 {
            (keystroke_count as f64 / 5.0) / (duration / 60.0)
        } else {
            0.0
        };

        DetectorStats {
            total_keystrokes: keystroke_count,
            session_duration_seconds: duration,
            average_wpm,
            current_rate: self.rate.current_rate(),
            event_summary: self.log.summary(),
            critical_events: self.log.count_by_severity(Severity::Critical),
            warning_events: self.log.count_by_severity(Severity::Warning),
            info_events: self.log.count_by_severity(Severity::Info),
        }
    }

    /// The underlying event log.
    pub fn event_log(&self) -> &EventLog {
        &self.log
    }

    /// Reset both meters (session start / tests).
    pub fn reset_meters(&self) {
        self.rate.reset();
        self.burst.reset();
    }
}
