use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Direction of a recorded WebSocket message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("recorder is closed")]
    Closed,

    #[error("failed to create {name}: {source}")]
    Create {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{stream}: {source}")]
    Stream {
        stream: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("flush errors: {0}")]
    Flush(String),
}

struct Stream {
    name: &'static str,
    path: PathBuf,
    writer: BufWriter<File>,
}

impl Stream {
    fn open(dir: &Path, name: &'static str) -> Result<Self, RecorderError> {
        let path = dir.join(name);
        let mut opts = OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o600);
        }
        let file = opts
            .open(&path)
            .map_err(|source| RecorderError::Create { name, source })?;
        Ok(Self {
            name,
            path,
            writer: BufWriter::new(file),
        })
    }

    fn flush_and_sync(&mut self) -> Result<(), std::io::Error> {
        self.writer.flush()?;
        // Sync errors are not actionable mid-session; surface flush errors only.
        let _ = self.writer.get_ref().sync_all();
        Ok(())
    }
}

struct Streams {
    keystrokes: Stream,
    terminal: Stream,
    timing: Stream,
    websocket: Stream,
    events: Stream,
    last_output: Instant,
}

/// Multi-stream session recorder.
///
/// Owns the five append-only log files in the session directory, each behind
/// a buffered writer. All record calls serialize through one mutex so every
/// stream stays monotonic in its timestamp column. A periodic flusher pushes
/// buffers (and the page cache) to disk every `flush_interval`.
///
/// Write failures are surfaced to the caller but never tear the session down;
/// the bridge logs them and the candidate keeps typing.
pub struct Recorder {
    start: Instant,
    inner: Mutex<Option<Streams>>,
    stop_flush: CancellationToken,
}

impl Recorder {
    /// Open the five streams in `session_dir` (mode 0600) and start the
    /// periodic flusher.
    pub fn new(session_dir: &Path, flush_interval: Duration) -> Result<Arc<Self>, RecorderError> {
        let now = Instant::now();
        let streams = Streams {
            keystrokes: Stream::open(session_dir, "keystrokes.log")?,
            terminal: Stream::open(session_dir, "terminal.log")?,
            timing: Stream::open(session_dir, "timing.log")?,
            websocket: Stream::open(session_dir, "websocket.log")?,
            events: Stream::open(session_dir, "events.log")?,
            last_output: now,
        };

        let recorder = Arc::new(Self {
            start: now,
            inner: Mutex::new(Some(streams)),
            stop_flush: CancellationToken::new(),
        });

        let flusher = Arc::clone(&recorder);
        let stop = recorder.stop_flush.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // the first tick fires immediately
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = flusher.flush() {
                            tracing::warn!(error = %e, "periodic recorder flush failed");
                        }
                    }
                    _ = stop.cancelled() => break,
                }
            }
        });

        tracing::info!(dir = %session_dir.display(), "session recording started");
        Ok(recorder)
    }

    /// Milliseconds since the recorder started.
    fn elapsed_ms(&self) -> u128 {
        self.start.elapsed().as_millis()
    }

    /// Record an inbound keystroke chunk: `<ms> <quoted_bytes>`.
    pub fn record_input(&self, data: &[u8]) -> Result<(), RecorderError> {
        let mut guard = self.inner.lock();
        let streams = guard.as_mut().ok_or(RecorderError::Closed)?;
        let line = format!("{} {}\n", self.elapsed_ms(), quote_bytes(data));
        streams
            .keystrokes
            .writer
            .write_all(line.as_bytes())
            .map_err(|source| RecorderError::Stream {
                stream: "keystrokes",
                source,
            })
    }

    /// Record an outbound terminal chunk.
    ///
    /// Writes the `timing.log` line (`<seconds_since_prev_output> <len>`)
    /// before the raw payload so a crash between the two leaves a recoverable
    /// prefix: every payload byte in `terminal.log` is accounted for by a
    /// preceding timing entry.
    pub fn record_output(&self, data: &[u8]) -> Result<(), RecorderError> {
        let mut guard = self.inner.lock();
        let streams = guard.as_mut().ok_or(RecorderError::Closed)?;

        let now = Instant::now();
        let elapsed = now.duration_since(streams.last_output).as_secs_f64();
        streams.last_output = now;

        let timing_line = format!("{:.6} {}\n", elapsed, data.len());
        streams
            .timing
            .writer
            .write_all(timing_line.as_bytes())
            .map_err(|source| RecorderError::Stream {
                stream: "timing",
                source,
            })?;

        streams
            .terminal
            .writer
            .write_all(data)
            .map_err(|source| RecorderError::Stream {
                stream: "terminal",
                source,
            })
    }

    /// Record a framed WebSocket message in either direction:
    /// `<ms> <direction> <type> <len> <quoted_sample>`. The sample is capped
    /// at 100 bytes with a `...` marker when truncated.
    pub fn record_ws_message(
        &self,
        direction: Direction,
        message_type: &str,
        data: &[u8],
    ) -> Result<(), RecorderError> {
        let mut guard = self.inner.lock();
        let streams = guard.as_mut().ok_or(RecorderError::Closed)?;

        let mut sample = data[..data.len().min(100)].to_vec();
        if data.len() > 100 {
            sample.extend_from_slice(b"...");
        }
        let line = format!(
            "{} {} {} {} {}\n",
            self.elapsed_ms(),
            direction.as_str(),
            message_type,
            data.len(),
            quote_bytes(&sample),
        );
        streams
            .websocket
            .writer
            .write_all(line.as_bytes())
            .map_err(|source| RecorderError::Stream {
                stream: "websocket",
                source,
            })
    }

    /// Record an anti-cheat or session event: `<ms> <event_type> <json>`.
    pub fn record_event(&self, event_type: &str, payload_json: &str) -> Result<(), RecorderError> {
        let mut guard = self.inner.lock();
        let streams = guard.as_mut().ok_or(RecorderError::Closed)?;
        let line = format!("{} {} {}\n", self.elapsed_ms(), event_type, payload_json);
        streams
            .events
            .writer
            .write_all(line.as_bytes())
            .map_err(|source| RecorderError::Stream {
                stream: "events",
                source,
            })
    }

    /// Flush all buffered writers and sync to disk.
    /// A no-op returning success once the recorder is closed.
    pub fn flush(&self) -> Result<(), RecorderError> {
        let mut guard = self.inner.lock();
        let streams = match guard.as_mut() {
            Some(s) => s,
            None => return Ok(()),
        };
        Self::flush_streams(streams)
    }

    fn flush_streams(streams: &mut Streams) -> Result<(), RecorderError> {
        let mut errors = Vec::new();
        for stream in [
            &mut streams.keystrokes,
            &mut streams.terminal,
            &mut streams.timing,
            &mut streams.websocket,
            &mut streams.events,
        ] {
            if let Err(e) = stream.flush_and_sync() {
                errors.push(format!("{}: {}", stream.name, e));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(RecorderError::Flush(errors.join("; ")))
        }
    }

    /// Close the recorder: stop the flusher, final flush, close each file,
    /// and demote the recorded files to owner read-only (0400).
    ///
    /// Idempotent; only the first call has effect. Permission demotion
    /// failures are logged, not fatal.
    pub fn close(&self) -> Result<(), RecorderError> {
        let mut streams = match self.inner.lock().take() {
            Some(s) => s,
            None => return Ok(()),
        };
        self.stop_flush.cancel();

        tracing::info!("closing recorder, flushing all logs");
        let flush_result = Self::flush_streams(&mut streams);

        for stream in [
            streams.keystrokes,
            streams.terminal,
            streams.timing,
            streams.websocket,
            streams.events,
        ] {
            let path = stream.path.clone();
            drop(stream); // flushes remaining bytes and closes the file
            if let Err(e) = set_read_only(&path) {
                tracing::warn!(file = %path.display(), error = %e, "could not demote log permissions");
            }
        }

        flush_result
    }
}

#[cfg(unix)]
fn set_read_only(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o400))
}

#[cfg(not(unix))]
fn set_read_only(path: &Path) -> std::io::Result<()> {
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_readonly(true);
    std::fs::set_permissions(path, perms)
}

/// Quote a byte string for the log-line grammar: printable ASCII passes
/// through, `\n`/`\r`/`\t`/`\\`/`\"` are escaped, everything else becomes
/// `\xNN`. The result is wrapped in double quotes.
pub fn quote_bytes(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() + 2);
    out.push('"');
    for &b in data {
        match b {
            b'\\' => out.push_str("\\\\"),
            b'"' => out.push_str("\\\""),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7e => out.push(b as char),
            _ => out.push_str(&format!("\\x{:02x}", b)),
        }
    }
    out.push('"');
    out
}

/// Invert [`quote_bytes`]. Returns `None` on malformed input.
pub fn unquote_bytes(quoted: &str) -> Option<Vec<u8>> {
    let inner = quoted.strip_prefix('"')?.strip_suffix('"')?;
    let mut out = Vec::with_capacity(inner.len());
    let mut chars = inner.bytes();
    while let Some(b) = chars.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match chars.next()? {
            b'\\' => out.push(b'\\'),
            b'"' => out.push(b'"'),
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'x' => {
                let hi = chars.next()?;
                let lo = chars.next()?;
                let hex = [hi, lo];
                let hex = std::str::from_utf8(&hex).ok()?;
                out.push(u8::from_str_radix(hex, 16).ok()?);
            }
            _ => return None,
        }
    }
    Some(out)
}
