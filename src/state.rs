use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use subtle::ConstantTimeEq;
use uuid::Uuid;

/// Rolling terminal buffer cap: the last 100 KiB of output is replayed on
/// reconnect.
pub const MAX_TERMINAL_BUFFER: usize = 100 * 1024;

/// Connection state of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Active,
    Disconnected,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

/// Connection statistics snapshot for observability.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub state: ConnectionState,
    pub connection_count: u32,
    pub disconnect_count: u32,
    pub seconds_since_connect: f64,
    pub seconds_since_disconnect: Option<f64>,
    pub token_age_seconds: f64,
}

struct StateInner {
    state: ConnectionState,
    last_connect: Instant,
    last_disconnect: Option<Instant>,
    connection_count: u32,
    disconnect_count: u32,
    terminal_buffer: Vec<u8>,
    terminal_size: TerminalSize,
}

/// Volatile runtime twin of the session: reconnect token, connection
/// lifecycle, and the rolling output buffer a reconnecting client replays.
///
/// State machine: active ↔ disconnected → expired (terminal). Expiry is
/// reached either explicitly via [`SessionState::mark_expired`] or implicitly
/// once the reconnect window has elapsed since the last disconnect.
pub struct SessionState {
    reconnect_token: String,
    token_created_at: Instant,
    reconnect_window: Duration,
    inner: RwLock<StateInner>,
}

impl SessionState {
    /// Create session state with a freshly generated 128-bit reconnect token.
    /// The session starts active with one connection counted, mirroring the
    /// engine's initial client.
    pub fn new(reconnect_window: Duration) -> Self {
        Self {
            reconnect_token: Uuid::new_v4().to_string(),
            token_created_at: Instant::now(),
            reconnect_window,
            inner: RwLock::new(StateInner {
                state: ConnectionState::Active,
                last_connect: Instant::now(),
                last_disconnect: None,
                connection_count: 1,
                disconnect_count: 0,
                terminal_buffer: Vec::new(),
                terminal_size: TerminalSize { cols: 80, rows: 24 },
            }),
        }
    }

    /// The opaque reconnect token handed to the client.
    pub fn reconnect_token(&self) -> &str {
        &self.reconnect_token
    }

    pub fn reconnect_window(&self) -> Duration {
        self.reconnect_window
    }

    /// Mark a new client connection.
    pub fn connect(&self) {
        let mut inner = self.inner.write();
        inner.state = ConnectionState::Active;
        inner.last_connect = Instant::now();
        inner.connection_count += 1;
    }

    /// Mark a client disconnection. Starts the reconnect window.
    pub fn disconnect(&self) {
        let mut inner = self.inner.write();
        inner.state = ConnectionState::Disconnected;
        inner.last_disconnect = Some(Instant::now());
        inner.disconnect_count += 1;
    }

    /// Whether `token` authorizes resuming this session right now.
    ///
    /// True iff the token matches (compared in constant time), the session is
    /// disconnected, and the reconnect window has not elapsed.
    pub fn can_reconnect(&self, token: &str) -> bool {
        let token_matches: bool = token
            .as_bytes()
            .ct_eq(self.reconnect_token.as_bytes())
            .into();
        if !token_matches {
            return false;
        }

        let inner = self.inner.read();
        inner.state == ConnectionState::Disconnected && !Self::expired_locked(&inner, self.reconnect_window)
    }

    /// Whether the reconnect window has expired.
    pub fn is_expired(&self) -> bool {
        let inner = self.inner.read();
        Self::expired_locked(&inner, self.reconnect_window)
    }

    fn expired_locked(inner: &StateInner, window: Duration) -> bool {
        match inner.state {
            ConnectionState::Expired => true,
            ConnectionState::Disconnected => inner
                .last_disconnect
                .map(|at| at.elapsed() > window)
                .unwrap_or(false),
            ConnectionState::Active => false,
        }
    }

    /// Transition to the terminal expired state. Only meaningful from
    /// disconnected; an active session cannot expire.
    pub fn mark_expired(&self) {
        let mut inner = self.inner.write();
        if inner.state == ConnectionState::Disconnected {
            inner.state = ConnectionState::Expired;
        }
    }

    /// Current connection state, with implicit expiry applied.
    pub fn state(&self) -> ConnectionState {
        let inner = self.inner.read();
        if Self::expired_locked(&inner, self.reconnect_window) {
            ConnectionState::Expired
        } else {
            inner.state
        }
    }

    /// Append outbound bytes to the rolling buffer, trimming the head so the
    /// total stays within [`MAX_TERMINAL_BUFFER`].
    pub fn update_terminal_buffer(&self, data: &[u8]) {
        let mut inner = self.inner.write();
        inner.terminal_buffer.extend_from_slice(data);
        let len = inner.terminal_buffer.len();
        if len > MAX_TERMINAL_BUFFER {
            inner.terminal_buffer.drain(..len - MAX_TERMINAL_BUFFER);
        }
    }

    /// Snapshot copy of the rolling buffer.
    pub fn terminal_buffer(&self) -> Vec<u8> {
        self.inner.read().terminal_buffer.clone()
    }

    pub fn update_terminal_size(&self, cols: u16, rows: u16) {
        self.inner.write().terminal_size = TerminalSize { cols, rows };
    }

    pub fn terminal_size(&self) -> TerminalSize {
        self.inner.read().terminal_size
    }

    /// Connection statistics snapshot.
    pub fn connection_stats(&self) -> ConnectionStats {
        let inner = self.inner.read();
        ConnectionStats {
            state: inner.state,
            connection_count: inner.connection_count,
            disconnect_count: inner.disconnect_count,
            seconds_since_connect: inner.last_connect.elapsed().as_secs_f64(),
            seconds_since_disconnect: inner.last_disconnect.map(|at| at.elapsed().as_secs_f64()),
            token_age_seconds: self.token_created_at.elapsed().as_secs_f64(),
        }
    }
}
