//! proctorsh - the proctored web shell.
//!
//! One engine instance = one recorded candidate session. Startup wires the
//! session directory, the multi-stream recorder, the anti-cheat detector, and
//! the PTY broker together behind an axum server exposing `/ws`, `/reconnect`,
//! and `/health`. The engine then parks on a select over its three exit
//! conditions:
//! - finish (client button or shell exit): graceful teardown, 3 s deadline
//! - OS signal (SIGINT/SIGTERM): same teardown marked interrupted, 5 s deadline
//! - server error: fatal
//!
//! Teardown order matters: close the broker first (unblocks the output path),
//! close the recorder (final flush), extract commands, run the analysis, then
//! finalize metadata and demote everything to read-only.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use proctorsh::analysis;
use proctorsh::commands;
use proctorsh::config::{Config, ConfigError};
use proctorsh::detector::Detector;
use proctorsh::pty::{PtyBroker, PtyError};
use proctorsh::recorder::{Recorder, RecorderError};
use proctorsh::server::{self, AppState};
use proctorsh::session::{SessionError, SessionManager};
use proctorsh::shutdown::{FinishSignal, ShutdownCoordinator};
use proctorsh::ws;

#[derive(Debug, Error)]
enum EngineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("session error: {0}")]
    Session(#[from] SessionError),

    #[error("recorder error: {0}")]
    Recorder(#[from] RecorderError),

    #[error("pty error: {0}")]
    Pty(#[from] PtyError),

    #[error("server error: {0}")]
    Io(#[from] std::io::Error),
}

enum ExitPath {
    Finish,
    Signal(&'static str),
    ServerError(std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), EngineError> {
    let cfg = Config::load()?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| format!("proctorsh={},tower_http=info", cfg.log_level)),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting proctorsh");
    tracing::info!(
        candidate = %cfg.candidate_name,
        port = cfg.port,
        session_timeout = ?cfg.session_timeout,
        network_isolated = cfg.network_isolated,
        "configuration loaded"
    );
    tracing::info!("{}", cfg.motd);

    let manager = Arc::new(SessionManager::new(
        &cfg.output_dir,
        &cfg.candidate_name,
        cfg.reconnect_window,
    )?);
    let session = manager.session();
    tracing::info!(id = %session.id, dir = %manager.session_dir().display(), "session created");

    let recorder = Recorder::new(manager.session_dir(), cfg.flush_interval)?;

    let detector = Arc::new(Detector::new(cfg.input_rate_limit));
    tracing::info!(rate_limit = cfg.input_rate_limit, "anti-cheat detector initialized");

    let broker = Arc::new(PtyBroker::spawn(&cfg.shell, cfg.shell_uid)?);
    tracing::info!(
        shell = %cfg.shell,
        pid = ?broker.child_pid(),
        home = %broker.candidate_home().display(),
        "pty created"
    );

    let finish = FinishSignal::new();
    let shutdown = ShutdownCoordinator::new();

    // Session-level recording pump: captures output and feeds the reconnect
    // buffer whether or not a client is attached.
    let pump = ws::spawn_output_pump(
        Arc::clone(&broker),
        Arc::clone(&recorder),
        manager.state(),
    );

    // Shell exit must end the session even when no client is connected to
    // observe the end-of-stream.
    {
        let closed = broker.closed();
        let finish = finish.clone();
        tokio::spawn(async move {
            closed.cancelled().await;
            finish.finish();
        });
    }

    let state = AppState {
        broker: Arc::clone(&broker),
        recorder: Arc::clone(&recorder),
        detector: Arc::clone(&detector),
        session_state: manager.state(),
        finish: finish.clone(),
        shutdown: shutdown.clone(),
        candidate_name: cfg.candidate_name.clone(),
    };
    let app = server::router(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", cfg.port)).await?;
    tracing::info!(port = cfg.port, "server listening");

    let (server_shutdown_tx, server_shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let mut server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                server_shutdown_rx.await.ok();
            })
            .await
    });

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    let exit = tokio::select! {
        result = &mut server_handle => {
            let error = match result {
                Ok(Err(e)) => e,
                Ok(Ok(())) => std::io::Error::other("server exited unexpectedly"),
                Err(join_error) => std::io::Error::other(join_error),
            };
            ExitPath::ServerError(error)
        }
        _ = finish.finished() => ExitPath::Finish,
        _ = tokio::signal::ctrl_c() => ExitPath::Signal("SIGINT"),
        _ = sigterm.recv() => ExitPath::Signal("SIGTERM"),
    };

    let (deadline, interrupted_by) = match exit {
        ExitPath::ServerError(error) => {
            tracing::error!(%error, "server failed");
            if let Err(e) = manager.error(&error.to_string()) {
                tracing::error!(%e, "could not record session error");
            }
            return Err(EngineError::Io(error));
        }
        ExitPath::Finish => {
            tracing::info!("session finished, shutting down");
            (Duration::from_secs(3), None)
        }
        ExitPath::Signal(name) => {
            tracing::info!(signal = name, "received signal, shutting down");
            (Duration::from_secs(5), Some(name))
        }
    };

    let stats = detector.statistics();
    tracing::info!(
        total_keystrokes = stats.total_keystrokes,
        average_wpm = stats.average_wpm,
        critical_events = stats.critical_events,
        warning_events = stats.warning_events,
        "session statistics"
    );
    let conn = manager.state().connection_stats();
    tracing::info!(
        connections = conn.connection_count,
        disconnects = conn.disconnect_count,
        "connection statistics"
    );

    finalize_session(&broker, &recorder, &manager, pump, interrupted_by).await;

    // Give in-flight socket writes a moment, then ask clients to close and
    // stop the HTTP server within the deadline.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let active = shutdown.active_count();
    if active > 0 {
        tracing::info!(active, "signaling clients to disconnect");
        shutdown.shutdown();
        let _ = tokio::time::timeout(deadline, shutdown.wait_for_all_closed()).await;
    }

    let _ = server_shutdown_tx.send(());
    match tokio::time::timeout(deadline, &mut server_handle).await {
        Ok(_) => tracing::info!("http server stopped"),
        Err(_) => {
            tracing::warn!("graceful shutdown deadline exceeded, forcing close");
            server_handle.abort();
        }
    }

    tracing::info!(dir = %manager.session_dir().display(), "session complete");
    Ok(())
}

/// Run the finalization sequence. Every step is attempted even when earlier
/// steps fail; the session directory should end up as complete as the disk
/// allows.
async fn finalize_session(
    broker: &PtyBroker,
    recorder: &Recorder,
    manager: &SessionManager,
    pump: tokio::task::JoinHandle<()>,
    interrupted_by: Option<&'static str>,
) {
    tracing::info!("closing pty");
    broker.close();

    // Let the recording pump drain the last output chunks before the
    // recorder goes away.
    if tokio::time::timeout(Duration::from_secs(2), pump).await.is_err() {
        tracing::warn!("output pump did not drain in time");
    }

    tracing::info!("closing recorder");
    if let Err(e) = recorder.close() {
        tracing::warn!(error = %e, "recorder close reported errors");
    }

    if let Err(e) = manager.record_end_time() {
        tracing::error!(error = %e, "could not record session end time");
    }

    tracing::info!("extracting commands");
    match commands::extract_commands(manager.session_dir()) {
        Ok(count) => tracing::info!(count, "commands extracted"),
        Err(e) => tracing::warn!(error = %e, "command extraction failed"),
    }

    tracing::info!("generating anti-cheat analysis");
    match analysis::analyze_session(manager.session_dir()) {
        Ok(report) => {
            if let Err(e) = analysis::save_report(&report, manager.session_dir()) {
                tracing::warn!(error = %e, "could not save analysis report");
            } else {
                tracing::info!(
                    verdict = %report.verdict,
                    confidence = report.confidence_score,
                    "analysis complete"
                );
            }
        }
        Err(e) => tracing::warn!(error = %e, "session analysis failed"),
    }

    tracing::info!("finalizing session metadata");
    let result = match interrupted_by {
        Some(signal) => manager.interrupted(signal),
        None => manager.complete(),
    };
    if let Err(e) = result {
        tracing::error!(error = %e, "could not finalize session");
    }
}
