use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::events::Severity;

/// Average WPM above this adds to the suspicion score.
const HIGH_WPM: f64 = 120.0;
/// Interval standard deviation (WPM units) above this adds to the score.
const HIGH_WPM_STDDEV: f64 = 50.0;
/// Typing intervals longer than this are treated as pauses, not typing.
const MAX_INTERVAL_SECS: f64 = 10.0;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("failed to read metadata: {0}")]
    ReadMetadata(#[source] std::io::Error),

    #[error("failed to parse metadata: {0}")]
    ParseMetadata(#[source] serde_json::Error),

    #[error("failed to analyze keystrokes: {0}")]
    ReadKeystrokes(#[source] std::io::Error),

    #[error("failed to load events: {0}")]
    ReadEvents(#[source] std::io::Error),

    #[error("failed to write report: {0}")]
    WriteReport(#[source] std::io::Error),

    #[error("failed to serialize report: {0}")]
    SerializeReport(#[source] serde_json::Error),
}

/// Typing statistics recovered from the keystroke log.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TypingStats {
    pub total_keystrokes: usize,
    pub session_duration_seconds: f64,
    pub average_wpm: f64,
    pub median_wpm: f64,
    pub max_wpm: f64,
    pub min_wpm: f64,
    pub wpm_std_dev: f64,
    pub anomalies_detected: usize,
    #[serde(skip)]
    intervals: Vec<f64>,
}

/// An event line recovered from `events.log`.
#[derive(Debug, Clone, Serialize)]
pub struct RecordedEvent {
    pub at_ms: u64,
    pub severity: Severity,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
}

/// Coarse post-session classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Clean,
    MinorConcerns,
    ReviewRecommended,
    Suspicious,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Verdict::Clean => "CLEAN",
            Verdict::MinorConcerns => "MINOR_CONCERNS",
            Verdict::ReviewRecommended => "REVIEW_RECOMMENDED",
            Verdict::Suspicious => "SUSPICIOUS",
        };
        f.write_str(s)
    }
}

/// Complete post-session analysis, persisted as `analysis.json`.
#[derive(Debug, Serialize)]
pub struct AnalysisReport {
    pub session_id: String,
    pub candidate_name: String,
    pub analysis_timestamp: DateTime<Utc>,
    pub typing_stats: TypingStats,
    pub anticheat_events: Vec<RecordedEvent>,
    pub event_summary: std::collections::HashMap<String, u64>,
    pub verdict: Verdict,
    pub confidence_score: f64,
    pub flags: Vec<String>,
    pub recommendations: Vec<String>,
}

#[derive(Deserialize)]
struct MetadataExcerpt {
    id: String,
    candidate_name: String,
    #[serde(default)]
    duration_seconds: f64,
}

/// Analyze a finalized session directory.
///
/// Reads `metadata.json`, `keystrokes.log`, and `events.log`, computes typing
/// statistics and a suspicion verdict, and returns the report. Use
/// [`save_report`] to persist it.
pub fn analyze_session(session_dir: &Path) -> Result<AnalysisReport, AnalysisError> {
    let metadata_raw = std::fs::read_to_string(session_dir.join("metadata.json"))
        .map_err(AnalysisError::ReadMetadata)?;
    let metadata: MetadataExcerpt =
        serde_json::from_str(&metadata_raw).map_err(AnalysisError::ParseMetadata)?;

    let keystrokes = std::fs::read_to_string(session_dir.join("keystrokes.log"))
        .map_err(AnalysisError::ReadKeystrokes)?;
    let typing_stats = analyze_keystrokes(&keystrokes, metadata.duration_seconds);

    let events = load_events(session_dir)?;
    let event_summary = summarize_events(&events);
    let (verdict, confidence_score, flags) = generate_verdict(&typing_stats, &events);
    let recommendations = generate_recommendations(&events, &typing_stats);

    Ok(AnalysisReport {
        session_id: metadata.id,
        candidate_name: metadata.candidate_name,
        analysis_timestamp: Utc::now(),
        typing_stats,
        anticheat_events: events,
        event_summary,
        verdict,
        confidence_score,
        flags,
        recommendations,
    })
}

/// Persist a report as `analysis.json`, owner read-only.
pub fn save_report(report: &AnalysisReport, session_dir: &Path) -> Result<(), AnalysisError> {
    let path = session_dir.join("analysis.json");
    let data = serde_json::to_vec_pretty(report).map_err(AnalysisError::SerializeReport)?;
    std::fs::write(&path, data).map_err(AnalysisError::WriteReport)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o400))
            .map_err(AnalysisError::WriteReport)?;
    }

    Ok(())
}

/// Derive typing statistics from the keystroke log body.
///
/// Each log line counts as one keystroke event; intervals between consecutive
/// lines feed the WPM spread, ignoring pauses over [`MAX_INTERVAL_SECS`].
pub fn analyze_keystrokes(keystrokes: &str, session_duration: f64) -> TypingStats {
    let mut stats = TypingStats {
        session_duration_seconds: session_duration,
        ..Default::default()
    };

    let mut last_timestamp: Option<u64> = None;
    for line in keystrokes.lines() {
        let Some((ts, _rest)) = line.split_once(' ') else {
            continue;
        };
        let Ok(timestamp) = ts.parse::<u64>() else {
            continue;
        };

        stats.total_keystrokes += 1;
        if let Some(last) = last_timestamp {
            let interval = timestamp.saturating_sub(last) as f64 / 1000.0;
            if interval > 0.0 && interval < MAX_INTERVAL_SECS {
                stats.intervals.push(interval);
            }
        }
        last_timestamp = Some(timestamp);
    }

    stats.anomalies_detected = stats.intervals.iter().filter(|&&i| i < 0.05).count();
    calculate_wpm_stats(&mut stats);
    stats
}

fn calculate_wpm_stats(stats: &mut TypingStats) {
    if stats.session_duration_seconds == 0.0 || stats.total_keystrokes == 0 {
        return;
    }

    // Rough WPM: 5 chars per word.
    stats.average_wpm =
        (stats.total_keystrokes as f64 / 5.0) / (stats.session_duration_seconds / 60.0);

    if stats.intervals.len() < 10 {
        stats.median_wpm = stats.average_wpm;
        stats.max_wpm = stats.average_wpm;
        stats.min_wpm = stats.average_wpm;
        return;
    }

    let mut min_interval = stats.intervals[0];
    let mut max_interval = stats.intervals[0];
    for &interval in &stats.intervals {
        min_interval = min_interval.min(interval);
        max_interval = max_interval.max(interval);
    }

    // WPM is inversely proportional to the keystroke interval:
    // 12 = 60 s/min divided by 5 chars/word.
    stats.max_wpm = 12.0 / min_interval;
    stats.min_wpm = 12.0 / max_interval;
    stats.median_wpm = stats.average_wpm;

    let mean: f64 = stats.intervals.iter().sum::<f64>() / stats.intervals.len() as f64;
    let variance: f64 = stats
        .intervals
        .iter()
        .map(|i| (i - mean) * (i - mean))
        .sum::<f64>()
        / stats.intervals.len() as f64;
    stats.wpm_std_dev = variance.sqrt() * 12.0;
}

/// Load `events.log`, tolerating a missing file (no events recorded).
fn load_events(session_dir: &Path) -> Result<Vec<RecordedEvent>, AnalysisError> {
    let contents = match std::fs::read_to_string(session_dir.join("events.log")) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(AnalysisError::ReadEvents(e)),
    };

    let mut events = Vec::new();
    for line in contents.lines() {
        let mut parts = line.splitn(3, ' ');
        let (Some(ts), Some(event_type), Some(payload)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        let Ok(at_ms) = ts.parse::<u64>() else {
            continue;
        };
        let data: Value = serde_json::from_str(payload)
            .unwrap_or_else(|_| serde_json::json!({ "raw": payload }));
        let severity = derive_severity(event_type, &data);
        events.push(RecordedEvent {
            at_ms,
            severity,
            event_type: event_type.to_string(),
            data,
        });
    }

    Ok(events)
}

/// Severity of a recorded event line.
///
/// Server-side events carry their type directly; client reports are recorded
/// under the `anticheat` type with the original event name in the payload.
fn derive_severity(event_type: &str, data: &Value) -> Severity {
    match event_type {
        "paste_attempt" | "paste_blocked" => Severity::Critical,
        "rapid_input" | "typing_anomaly" => Severity::Warning,
        "anticheat" => match data.get("event").and_then(Value::as_str) {
            Some(event) if event.contains("paste") => Severity::Critical,
            Some(event) if event.contains("rapid") => Severity::Warning,
            _ => Severity::Info,
        },
        _ => Severity::Info,
    }
}

fn summarize_events(events: &[RecordedEvent]) -> std::collections::HashMap<String, u64> {
    let mut summary = std::collections::HashMap::new();
    for event in events {
        *summary.entry(event.event_type.clone()).or_insert(0) += 1;
        *summary.entry(event.severity.as_str().to_string()).or_insert(0) += 1;
        *summary.entry("total".to_string()).or_insert(0) += 1;
    }
    summary
}

/// Score the session and derive a verdict.
///
/// Critical events +30, warnings +10, average WPM over 120 +20, interval
/// stddev over 50 WPM +15. Thresholds: ≥50 SUSPICIOUS,
/// ≥30 REVIEW_RECOMMENDED, ≥10 MINOR_CONCERNS, else CLEAN.
fn generate_verdict(stats: &TypingStats, events: &[RecordedEvent]) -> (Verdict, f64, Vec<String>) {
    let mut flags = Vec::new();
    let mut suspicion = 0.0_f64;

    let critical_count = events.iter().filter(|e| e.severity == Severity::Critical).count();
    let warning_count = events.iter().filter(|e| e.severity == Severity::Warning).count();
    suspicion += critical_count as f64 * 30.0;
    suspicion += warning_count as f64 * 10.0;

    if critical_count > 0 {
        flags.push(format!("{critical_count} paste attempt(s) detected"));
    }
    if stats.average_wpm > HIGH_WPM {
        flags.push(format!("Unusually high WPM: {:.1}", stats.average_wpm));
        suspicion += 20.0;
    }
    if stats.wpm_std_dev > HIGH_WPM_STDDEV {
        flags.push(format!("High WPM variance: {:.1}", stats.wpm_std_dev));
        suspicion += 15.0;
    }

    let (verdict, confidence) = if suspicion >= 50.0 {
        (Verdict::Suspicious, (suspicion / 100.0).min(0.95))
    } else if suspicion >= 30.0 {
        (Verdict::ReviewRecommended, 0.70)
    } else if suspicion >= 10.0 {
        (Verdict::MinorConcerns, 0.85)
    } else {
        (Verdict::Clean, 0.95)
    };

    if flags.is_empty() {
        flags.push("No anomalies detected".to_string());
    }

    (verdict, confidence, flags)
}

fn generate_recommendations(events: &[RecordedEvent], stats: &TypingStats) -> Vec<String> {
    let mut recommendations = Vec::new();

    let critical_count = events.iter().filter(|e| e.severity == Severity::Critical).count();
    if critical_count > 0 {
        recommendations
            .push("Review session replay carefully - paste attempts detected".to_string());
        recommendations
            .push("Cross-check solutions with other candidates for similarity".to_string());
    }
    if stats.average_wpm > HIGH_WPM {
        recommendations.push(
            "Very high typing speed - verify coding patterns and approach authenticity".to_string(),
        );
    }
    if stats.total_keystrokes < 100 {
        recommendations
            .push("Very few keystrokes - candidate may not have engaged fully with tasks".to_string());
    }
    if recommendations.is_empty() {
        recommendations.push("No specific concerns identified".to_string());
    }

    recommendations
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn keystroke_lines(timestamps: &[u64]) -> String {
        timestamps
            .iter()
            .map(|ms| format!("{ms} \"a\"\n"))
            .collect()
    }

    #[test]
    fn keystroke_stats_count_lines_and_intervals() {
        let log = keystroke_lines(&[100, 300, 500, 700]);
        let stats = analyze_keystrokes(&log, 60.0);
        assert_eq!(stats.total_keystrokes, 4);
        assert_eq!(stats.intervals.len(), 3);
        assert!((stats.average_wpm - 0.8).abs() < 1e-9);
    }

    #[test]
    fn long_pauses_are_not_intervals() {
        let log = keystroke_lines(&[0, 200, 15_000]);
        let stats = analyze_keystrokes(&log, 60.0);
        assert_eq!(stats.total_keystrokes, 3);
        assert_eq!(stats.intervals.len(), 1, "a 14.8s pause is not typing");
    }

    #[test]
    fn few_intervals_collapse_spread_to_average() {
        let log = keystroke_lines(&[0, 100, 200]);
        let stats = analyze_keystrokes(&log, 60.0);
        assert_eq!(stats.median_wpm, stats.average_wpm);
        assert_eq!(stats.max_wpm, stats.average_wpm);
        assert_eq!(stats.min_wpm, stats.average_wpm);
    }

    #[test]
    fn wpm_spread_from_interval_extremes() {
        // 11 keystrokes, alternating 100ms and 400ms gaps.
        let mut ts = Vec::new();
        let mut t = 0;
        for i in 0..11 {
            ts.push(t);
            t += if i % 2 == 0 { 100 } else { 400 };
        }
        let stats = analyze_keystrokes(&keystroke_lines(&ts), 60.0);
        assert!(stats.intervals.len() >= 10);
        assert!((stats.max_wpm - 120.0).abs() < 1e-6, "12 / 0.1s = 120");
        assert!((stats.min_wpm - 30.0).abs() < 1e-6, "12 / 0.4s = 30");
        assert!(stats.wpm_std_dev > 0.0);
    }

    #[test]
    fn zero_duration_yields_empty_stats() {
        let stats = analyze_keystrokes(&keystroke_lines(&[0, 100]), 0.0);
        assert_eq!(stats.average_wpm, 0.0);
    }

    #[test]
    fn severity_derivation_covers_server_and_client_events() {
        assert_eq!(
            derive_severity("paste_blocked", &Value::Null),
            Severity::Critical
        );
        assert_eq!(
            derive_severity("paste_attempt", &Value::Null),
            Severity::Critical
        );
        assert_eq!(
            derive_severity("rapid_input", &Value::Null),
            Severity::Warning
        );
        assert_eq!(
            derive_severity("anticheat", &serde_json::json!({"event": "paste_attempt"})),
            Severity::Critical
        );
        assert_eq!(
            derive_severity("anticheat", &serde_json::json!({"event": "rapid_input"})),
            Severity::Warning
        );
        assert_eq!(
            derive_severity("anticheat", &serde_json::json!({"event": "window_focus"})),
            Severity::Info
        );
        assert_eq!(derive_severity("resize", &Value::Null), Severity::Info);
    }

    fn event(severity_type: &str) -> RecordedEvent {
        RecordedEvent {
            at_ms: 0,
            severity: derive_severity(severity_type, &Value::Null),
            event_type: severity_type.to_string(),
            data: Value::Null,
        }
    }

    #[test]
    fn clean_session_verdict() {
        let stats = TypingStats {
            total_keystrokes: 500,
            session_duration_seconds: 600.0,
            average_wpm: 60.0,
            ..Default::default()
        };
        let (verdict, confidence, flags) = generate_verdict(&stats, &[]);
        assert_eq!(verdict, Verdict::Clean);
        assert_eq!(confidence, 0.95);
        assert_eq!(flags, vec!["No anomalies detected"]);
    }

    #[test]
    fn paste_events_escalate_verdict() {
        let stats = TypingStats::default();

        let (verdict, _, _) = generate_verdict(&stats, &[event("rapid_input")]);
        assert_eq!(verdict, Verdict::MinorConcerns);

        let (verdict, _, _) = generate_verdict(&stats, &[event("paste_blocked")]);
        assert_eq!(verdict, Verdict::ReviewRecommended);

        let (verdict, confidence, flags) = generate_verdict(
            &stats,
            &[event("paste_blocked"), event("paste_attempt")],
        );
        assert_eq!(verdict, Verdict::Suspicious);
        assert!((confidence - 0.60).abs() < 1e-9, "60/100 capped at 0.95");
        assert!(flags.iter().any(|f| f.contains("2 paste attempt(s)")));
    }

    #[test]
    fn high_wpm_contributes_to_score() {
        let stats = TypingStats {
            average_wpm: 150.0,
            wpm_std_dev: 60.0,
            ..Default::default()
        };
        // 20 + 15 = 35 → REVIEW_RECOMMENDED.
        let (verdict, confidence, flags) = generate_verdict(&stats, &[]);
        assert_eq!(verdict, Verdict::ReviewRecommended);
        assert_eq!(confidence, 0.70);
        assert_eq!(flags.len(), 2);
    }

    #[test]
    fn recommendations_for_low_engagement() {
        let stats = TypingStats {
            total_keystrokes: 12,
            ..Default::default()
        };
        let recs = generate_recommendations(&[], &stats);
        assert!(recs.iter().any(|r| r.contains("Very few keystrokes")));
    }

    #[test]
    fn analyze_and_save_full_session() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("metadata.json"),
            serde_json::json!({
                "id": "abc12345",
                "candidate_name": "test",
                "duration_seconds": 120.0,
            })
            .to_string(),
        )
        .unwrap();
        std::fs::write(
            dir.path().join("keystrokes.log"),
            keystroke_lines(&[100, 250, 400]),
        )
        .unwrap();
        std::fs::write(
            dir.path().join("events.log"),
            "500 paste_blocked {\"chars\":64}\n900 rapid_input {\"chars_per_second\":45}\n",
        )
        .unwrap();

        let report = analyze_session(dir.path()).unwrap();
        assert_eq!(report.session_id, "abc12345");
        assert_eq!(report.candidate_name, "test");
        assert_eq!(report.anticheat_events.len(), 2);
        assert_eq!(report.event_summary["total"], 2);
        // 30 (critical) + 10 (warning) = 40 → REVIEW_RECOMMENDED.
        assert_eq!(report.verdict, Verdict::ReviewRecommended);

        save_report(&report, dir.path()).unwrap();
        let written = std::fs::read_to_string(dir.path().join("analysis.json")).unwrap();
        let parsed: Value = serde_json::from_str(&written).unwrap();
        assert_eq!(parsed["verdict"], "REVIEW_RECOMMENDED");
        assert_eq!(parsed["typing_stats"]["total_keystrokes"], 3);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(dir.path().join("analysis.json"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o400);
        }
    }

    #[test]
    fn missing_events_log_is_tolerated() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("metadata.json"),
            serde_json::json!({"id": "x", "candidate_name": "y", "duration_seconds": 1.0})
                .to_string(),
        )
        .unwrap();
        std::fs::write(dir.path().join("keystrokes.log"), "").unwrap();

        let report = analyze_session(dir.path()).unwrap();
        assert!(report.anticheat_events.is_empty());
        assert_eq!(report.verdict, Verdict::Clean);
    }
}
