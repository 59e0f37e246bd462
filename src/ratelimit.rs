use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Outcome of a rate meter admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    /// Whether the chunk may be forwarded. The meter is advisory and always
    /// allows; hard enforcement lives in the WS bridge.
    pub allowed: bool,
    /// Total characters admitted inside the current 1-second window.
    pub current_rate: usize,
    /// True when `current_rate` exceeds the configured threshold.
    pub violation: bool,
}

struct TimedInput {
    at: Instant,
    length: usize,
}

/// Sliding-window input rate meter.
///
/// Tracks every admission inside a 1-second window and reports the summed
/// character count. Admissions append in wall-clock order; entries older than
/// the window are discarded on every check.
pub struct RateMeter {
    max_chars_per_second: usize,
    window: Duration,
    events: Mutex<Vec<TimedInput>>,
}

impl RateMeter {
    pub fn new(max_chars_per_second: usize) -> Self {
        Self {
            max_chars_per_second,
            window: Duration::from_secs(1),
            events: Mutex::new(Vec::new()),
        }
    }

    /// Threshold this meter reports violations against.
    pub fn limit(&self) -> usize {
        self.max_chars_per_second
    }

    /// Admit a chunk of `length` characters and report the window state.
    pub fn check(&self, length: usize) -> RateDecision {
        let now = Instant::now();
        let mut events = self.events.lock();

        events.push(TimedInput { at: now, length });
        events.retain(|e| now.duration_since(e.at) < self.window);

        let current_rate: usize = events.iter().map(|e| e.length).sum();
        RateDecision {
            allowed: true,
            current_rate,
            violation: current_rate > self.max_chars_per_second,
        }
    }

    /// Characters admitted inside the current window, without admitting.
    pub fn current_rate(&self) -> usize {
        let now = Instant::now();
        let events = self.events.lock();
        events
            .iter()
            .filter(|e| now.duration_since(e.at) < self.window)
            .map(|e| e.length)
            .sum()
    }

    /// Drop all tracked admissions.
    pub fn reset(&self) {
        self.events.lock().clear();
    }
}

struct BurstWindow {
    last_input: Option<Instant>,
    burst_chars: usize,
}

/// Fixed-window burst detector for paste detection.
///
/// Consecutive admissions closer together than the window accumulate into one
/// burst; a gap strictly greater than the window starts a new burst. An
/// admission exactly at the window boundary continues the current burst.
pub struct BurstMeter {
    max_chars_in_burst: usize,
    burst_window: Duration,
    inner: Mutex<BurstWindow>,
}

impl BurstMeter {
    pub fn new(max_chars_in_burst: usize, burst_window: Duration) -> Self {
        Self {
            max_chars_in_burst,
            burst_window,
            inner: Mutex::new(BurstWindow {
                last_input: None,
                burst_chars: 0,
            }),
        }
    }

    /// Admit a chunk of `length` characters.
    /// Returns `(is_burst, burst_chars)`; the first admission of a new burst
    /// never reports a burst regardless of its length.
    pub fn check(&self, length: usize) -> (bool, usize) {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let new_burst = match inner.last_input {
            None => true,
            Some(last) => now.duration_since(last).as_millis() > self.burst_window.as_millis(),
        };

        inner.last_input = Some(now);
        if new_burst {
            inner.burst_chars = length;
            return (false, length);
        }

        inner.burst_chars += length;
        (inner.burst_chars > self.max_chars_in_burst, inner.burst_chars)
    }

    /// Clear burst tracking.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.last_input = None;
        inner.burst_chars = 0;
    }
}
