use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// One-shot finish latch.
///
/// The session ends when the client sends `finish`, the shell exits, or the
/// engine receives a signal; whichever fires first wins and every later call
/// is a no-op.
#[derive(Clone, Default)]
pub struct FinishSignal {
    token: CancellationToken,
}

impl FinishSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the finish signal. Idempotent.
    pub fn finish(&self) {
        if !self.token.is_cancelled() {
            tracing::info!("finish signal raised");
        }
        self.token.cancel();
    }

    /// Resolves once the signal has been raised.
    pub async fn finished(&self) {
        self.token.cancelled().await
    }

    pub fn is_finished(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Tracks live WebSocket connections and broadcasts a shutdown request.
///
/// Each connection registers on upgrade and holds the returned guard for its
/// lifetime; the engine's shutdown path flips the signal and then waits for
/// the count to drain before closing the HTTP server.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    signal: Arc<watch::Sender<bool>>,
    count: Arc<watch::Sender<usize>>,
}

/// RAII guard for one registered connection.
pub struct ConnectionGuard {
    count: Arc<watch::Sender<usize>>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.count.send_modify(|c| *c = c.saturating_sub(1));
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (signal, _) = watch::channel(false);
        let (count, _) = watch::channel(0);
        Self {
            signal: Arc::new(signal),
            count: Arc::new(count),
        }
    }

    /// Register a connection. Returns the guard that keeps it counted and a
    /// receiver that flips to `true` when shutdown is requested.
    pub fn register(&self) -> (ConnectionGuard, watch::Receiver<bool>) {
        self.count.send_modify(|c| *c += 1);
        (
            ConnectionGuard {
                count: Arc::clone(&self.count),
            },
            self.signal.subscribe(),
        )
    }

    /// Ask all registered connections to close.
    pub fn shutdown(&self) {
        let _ = self.signal.send(true);
    }

    pub fn active_count(&self) -> usize {
        *self.count.borrow()
    }

    /// Wait until every registered connection has dropped its guard.
    pub async fn wait_for_all_closed(&self) {
        let mut rx = self.count.subscribe();
        let _ = rx.wait_for(|&c| c == 0).await;
    }
}
