use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::pty::PtyBroker;
use crate::recorder::{Direction, Recorder};
use crate::server::AppState;
use crate::state::SessionState;

/// Hard block: a single inbound chunk longer than this never reaches the
/// shell. Human typing produces 1-byte chunks (plus short escape sequences);
/// anything bigger arriving at once is a paste.
pub const MAX_INPUT_CHUNK: usize = 20;

/// Grace period for delivering the `session_ended` frame before the finish
/// signal tears the server down.
const SESSION_ENDED_GRACE: Duration = Duration::from_millis(500);

/// A parsed client control frame. Any valid JSON object with a non-empty
/// `type` is treated as control; everything else is input bytes.
#[derive(Debug, Deserialize)]
struct ControlMessage {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct ResizeData {
    cols: u16,
    rows: u16,
}

/// Serve one WebSocket connection: fan shell output to the client, feed
/// client input through the anti-cheat gauntlet into the shell, and dispatch
/// control messages.
pub async fn handle_socket(socket: WebSocket, state: AppState) {
    let (_guard, mut shutdown_rx) = state.shutdown.register();

    state.session_state.connect();
    let token = state.session_state.reconnect_token();
    tracing::info!(token_prefix = &token[..8.min(token.len())], "websocket connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut output_rx = state.broker.subscribe();
    let shell_closed = state.broker.closed();

    loop {
        tokio::select! {
            // Shell output → client.
            result = output_rx.recv() => {
                match result {
                    Ok(data) => {
                        record_ws(&state.recorder, Direction::Outbound, "output", &data);
                        let text = String::from_utf8_lossy(&data).into_owned();
                        if ws_tx.send(Message::Text(text)).await.is_err() {
                            tracing::debug!("websocket write failed, closing connection");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "client fell behind shell output");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            // Client frames → control dispatch or shell input.
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if !handle_inbound(&state, text.as_bytes(), "text").await {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if !handle_inbound(&state, &data, "binary").await {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::debug!("client closed websocket");
                        break;
                    }
                    Some(Ok(_)) => continue, // ping/pong handled by axum
                    Some(Err(e)) => {
                        tracing::debug!(?e, "websocket read error");
                        break;
                    }
                }
            }

            // Shell exited (or broker closed): tell the client, then finish.
            _ = shell_closed.cancelled() => {
                let payload =
                    serde_json::json!({"type": "session_ended", "data": {"reason": "shell_exited"}})
                        .to_string();
                record_ws(&state.recorder, Direction::Outbound, "session_ended", payload.as_bytes());
                let _ = ws_tx.send(Message::Text(payload)).await;
                tokio::time::sleep(SESSION_ENDED_GRACE).await;
                state.finish.finish();
                break;
            }

            // Engine shutdown: close frame, then drop the connection.
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::debug!("shutdown signal received, closing websocket");
                    let close = CloseFrame {
                        code: close_code::NORMAL,
                        reason: "server shutting down".into(),
                    };
                    let _ = ws_tx.send(Message::Close(Some(close))).await;
                    break;
                }
            }
        }
    }

    state.session_state.disconnect();
    tracing::info!("websocket disconnected");
}

/// Process one inbound frame. Returns `false` when the connection should
/// close (the shell input channel is gone).
async fn handle_inbound(state: &AppState, data: &[u8], frame_kind: &'static str) -> bool {
    record_ws(&state.recorder, Direction::Inbound, frame_kind, data);

    // Only text frames carry control messages; binary frames are always
    // input bytes.
    if frame_kind == "text" {
        if let Ok(ctrl) = serde_json::from_slice::<ControlMessage>(data) {
            if !ctrl.kind.is_empty() {
                dispatch_control(state, ctrl).await;
                return true;
            }
        }
    }

    // Input path. The oversized-chunk rule is the one hard enforcement site:
    // blocked chunks are recorded and dropped, never forwarded.
    if data.len() > MAX_INPUT_CHUNK {
        let event = state.detector.record_blocked_chunk(data.len());
        persist_event(state, &event.event_type, &event.payload_json());
        tracing::warn!(chars = data.len(), "blocked oversized input chunk");
        return true;
    }

    let (allowed, violations) = state.detector.check_input(data);
    for violation in &violations {
        persist_event(state, &violation.event_type, &violation.payload_json());
    }
    if !allowed {
        return true;
    }

    if let Err(e) = state.recorder.record_input(data) {
        tracing::warn!(error = %e, "failed to record keystrokes");
    }
    if state.broker.write(Bytes::copy_from_slice(data)).await.is_err() {
        tracing::debug!("shell input channel closed");
        return false;
    }
    true
}

async fn dispatch_control(state: &AppState, ctrl: ControlMessage) {
    match ctrl.kind.as_str() {
        "resize" => match serde_json::from_value::<ResizeData>(ctrl.data) {
            Ok(resize) => {
                state
                    .session_state
                    .update_terminal_size(resize.cols, resize.rows);
                if let Err(e) = state.broker.resize(resize.cols, resize.rows) {
                    tracing::warn!(error = %e, "failed to resize pty");
                }
            }
            Err(e) => tracing::debug!(?e, "invalid resize payload"),
        },

        "finish" => {
            tracing::info!("session finish requested by client");
            state.finish.finish();
        }

        "anticheat" => {
            let payload = ctrl.data.as_object().cloned().unwrap_or_default();
            let event_name = payload
                .get("event")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            let event = state.detector.record_client_event(&event_name, payload);
            tracing::info!(event = %event_name, severity = event.severity.as_str(), "client anti-cheat report");
            // Persisted under the umbrella type; the payload keeps the
            // original event name for the analyzer.
            persist_event(state, "anticheat", &event.payload_json());
        }

        other => tracing::debug!(message_type = other, "unknown control message type"),
    }
}

fn persist_event(state: &AppState, event_type: &str, payload_json: &str) {
    if let Err(e) = state.recorder.record_event(event_type, payload_json) {
        tracing::warn!(error = %e, "failed to persist anti-cheat event");
    }
}

fn record_ws(recorder: &Recorder, direction: Direction, message_type: &str, data: &[u8]) {
    if let Err(e) = recorder.record_ws_message(direction, message_type, data) {
        tracing::debug!(error = %e, "failed to record websocket message");
    }
}

/// Session-level output pump.
///
/// Subscribes to the broker once at startup and, for every output chunk,
/// records it as terminal output and feeds the reconnect rolling buffer.
/// Runs for the whole session so output produced while no client is attached
/// is still captured and replayable.
pub fn spawn_output_pump(
    broker: Arc<PtyBroker>,
    recorder: Arc<Recorder>,
    session_state: Arc<SessionState>,
) -> JoinHandle<()> {
    let mut rx = broker.subscribe();
    let closed = broker.closed();

    tokio::spawn(async move {
        let sink = |data: Bytes| {
            if let Err(e) = recorder.record_output(&data) {
                tracing::warn!(error = %e, "failed to record terminal output");
            }
            session_state.update_terminal_buffer(&data);
        };

        loop {
            tokio::select! {
                result = rx.recv() => match result {
                    Ok(data) => sink(data),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "output pump lagged, chunks lost to recording");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = closed.cancelled() => {
                    // Drain anything still queued before stopping.
                    loop {
                        match rx.try_recv() {
                            Ok(data) => sink(data),
                            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                            Err(_) => break,
                        }
                    }
                    break;
                }
            }
        }
        tracing::debug!("output pump stopped");
    })
}
