//! WebSocket end-to-end tests: a real axum server on an ephemeral port, a
//! real tungstenite client, a real shell behind the broker.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use proctorsh::detector::Detector;
use proctorsh::pty::PtyBroker;
use proctorsh::recorder::Recorder;
use proctorsh::server::{router, AppState};
use proctorsh::session::SessionManager;
use proctorsh::shutdown::{FinishSignal, ShutdownCoordinator};
use tempfile::TempDir;
use tokio_tungstenite::tungstenite::Message;

struct TestServer {
    state: AppState,
    manager: Arc<SessionManager>,
    addr: std::net::SocketAddr,
    _base: TempDir,
}

async fn start_server() -> TestServer {
    let base = TempDir::new().unwrap();
    let manager = Arc::new(
        SessionManager::new(base.path().to_str().unwrap(), "wse2e", Duration::from_secs(300))
            .unwrap(),
    );
    let recorder = Recorder::new(manager.session_dir(), Duration::from_secs(60)).unwrap();
    let broker = Arc::new(PtyBroker::spawn("/bin/sh", 34567).unwrap());

    proctorsh::ws::spawn_output_pump(
        Arc::clone(&broker),
        Arc::clone(&recorder),
        manager.state(),
    );

    let state = AppState {
        broker,
        recorder,
        detector: Arc::new(Detector::new(30)),
        session_state: manager.state(),
        finish: FinishSignal::new(),
        shutdown: ShutdownCoordinator::new(),
        candidate_name: "wse2e".to_string(),
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        state,
        manager,
        addr,
        _base: base,
    }
}

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn connect(server: &TestServer) -> WsStream {
    let url = format!("ws://{}/ws", server.addr);
    let (stream, _resp) = tokio_tungstenite::connect_async(url).await.unwrap();
    stream
}

/// Read text frames until one contains `marker` (or the deadline passes).
async fn read_until(ws: &mut WsStream, marker: &str, timeout: Duration) -> String {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut collected = String::new();
    loop {
        match tokio::time::timeout_at(deadline, ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                collected.push_str(&text);
                if collected.contains(marker) {
                    return collected;
                }
            }
            Ok(Some(Ok(_))) => continue,
            _ => return collected,
        }
    }
}

#[tokio::test]
async fn typed_input_round_trips_through_the_shell() {
    let server = start_server().await;
    let mut ws = connect(&server).await;

    ws.send(Message::Text("echo E2E_ROUND_TRIP\n".into()))
        .await
        .unwrap();

    let output = read_until(&mut ws, "E2E_ROUND_TRIP", Duration::from_secs(10)).await;
    assert!(
        output.contains("E2E_ROUND_TRIP"),
        "expected echo output, got: {output:?}"
    );

    // The exchange was recorded on both streams.
    server.state.recorder.flush().unwrap();
    let keystrokes =
        std::fs::read_to_string(server.manager.file_path("keystrokes.log")).unwrap();
    assert!(keystrokes.contains("E2E_ROUND_TRIP"));
    let ws_log = std::fs::read_to_string(server.manager.file_path("websocket.log")).unwrap();
    assert!(ws_log.lines().any(|l| l.contains(" inbound ")));
    assert!(ws_log.lines().any(|l| l.contains(" outbound ")));

    server.state.broker.close();
}

#[tokio::test]
async fn oversized_paste_never_reaches_the_shell() {
    let server = start_server().await;
    let mut ws = connect(&server).await;

    // Wait for the prompt so the shell is ready, then fire a 64-char paste.
    ws.send(Message::Text("echo READY_1\n".into())).await.unwrap();
    read_until(&mut ws, "READY_1", Duration::from_secs(10)).await;

    let paste = format!("echo STOLEN_{}\n", "x".repeat(50));
    ws.send(Message::Text(paste)).await.unwrap();

    // A legitimate command afterwards still works.
    ws.send(Message::Text("echo AFTER_2\n".into())).await.unwrap();
    let output = read_until(&mut ws, "AFTER_2", Duration::from_secs(10)).await;
    assert!(!output.contains("STOLEN_"), "paste must not execute: {output:?}");

    server.state.recorder.flush().unwrap();
    let events = std::fs::read_to_string(server.manager.file_path("events.log")).unwrap();
    assert_eq!(
        events.lines().filter(|l| l.contains("paste_blocked")).count(),
        1,
        "exactly one paste_blocked event: {events:?}"
    );
    let keystrokes =
        std::fs::read_to_string(server.manager.file_path("keystrokes.log")).unwrap();
    assert!(!keystrokes.contains("STOLEN_"));

    server.state.broker.close();
}

#[tokio::test]
async fn finish_control_raises_the_engine_signal() {
    let server = start_server().await;
    let mut ws = connect(&server).await;

    let frame = serde_json::json!({"type": "finish", "data": {"timestamp": 123}});
    ws.send(Message::Text(frame.to_string())).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !server.state.finish.is_finished() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "finish signal never raised"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    server.state.broker.close();
}

#[tokio::test]
async fn shell_exit_sends_session_ended() {
    let server = start_server().await;
    let mut ws = connect(&server).await;

    ws.send(Message::Text("exit\n".into())).await.unwrap();

    let output = read_until(&mut ws, "session_ended", Duration::from_secs(10)).await;
    assert!(
        output.contains(r#""reason":"shell_exited""#),
        "expected session_ended frame, got: {output:?}"
    );

    // Shell exit also finishes the session.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !server.state.finish.is_finished() {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn disconnect_enables_reconnect_with_buffer_replay() {
    let server = start_server().await;
    let mut ws = connect(&server).await;

    ws.send(Message::Text("echo REPLAY_ME\n".into())).await.unwrap();
    read_until(&mut ws, "REPLAY_ME", Duration::from_secs(10)).await;

    // Drop the socket; the bridge marks the session disconnected.
    drop(ws);
    let state = server.manager.state();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while state.state() != proctorsh::state::ConnectionState::Disconnected {
        assert!(
            tokio::time::Instant::now() < deadline,
            "disconnect never observed"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // The reconnect endpoint authorizes the stored token and replays output.
    let token = state.reconnect_token().to_string();
    let url = format!("http://{}/reconnect?token={}", server.addr, token);
    let body = http_get(&url).await;
    assert!(body.contains("Reconnection allowed"), "body: {body}");
    assert!(body.contains("REPLAY_ME"));

    // A fresh upgrade resumes the same live shell.
    let mut ws2 = connect(&server).await;
    ws2.send(Message::Text("echo RESUMED_OK\n".into())).await.unwrap();
    let output = read_until(&mut ws2, "RESUMED_OK", Duration::from_secs(10)).await;
    assert!(output.contains("RESUMED_OK"));

    server.state.broker.close();
}

#[tokio::test]
async fn engine_shutdown_closes_clients() {
    let server = start_server().await;
    let mut ws = connect(&server).await;

    // Make sure the connection is registered before signaling.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while server.state.shutdown.active_count() == 0 {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    server.state.shutdown.shutdown();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        match tokio::time::timeout_at(deadline, ws.next()).await {
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => break,
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(_))) => break,
            Err(_) => panic!("no close frame after shutdown signal"),
        }
    }

    tokio::time::timeout(Duration::from_secs(5), server.state.shutdown.wait_for_all_closed())
        .await
        .expect("connection count should drain");

    server.state.broker.close();
}

/// Minimal HTTP GET helper so the reconnect test does not need an HTTP
/// client dependency.
async fn http_get(url: &str) -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let rest = url.strip_prefix("http://").unwrap();
    let (host, path) = rest.split_once('/').unwrap();
    let mut stream = tokio::net::TcpStream::connect(host).await.unwrap();
    let request = format!("GET /{path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8_lossy(&response).into_owned()
}
