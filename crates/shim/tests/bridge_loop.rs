//! Integration test: boots an in-process WebSocket server that simulates
//! the daemon side of the wire protocol, points a real [`DaemonBridge`] at
//! it, and asserts the full handshake + call cycle:
//!
//! - `hello` carries the configured token; `hello_ack` completes the session
//! - `call_tool` round-trips, with progress frames surfaced to the callback
//! - daemon-side errors come back typed
//! - `list_tools` resolves through the FIFO waiter
//! - an incompatible daemon version is rejected

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use exai_domain::error::Error;
use exai_domain::paths::HEALTH_FILE;
use exai_domain::timeouts::TimeoutSet;
use exai_protocol::health::HealthFile;
use exai_protocol::{ProgressData, ToolSummary, WireError, WsMessage};
use exai_shim::bridge::{CallError, DaemonBridge};
use exai_shim::config::ShimConfig;

const TOKEN: &str = "bridge-token";

// ── Mini daemon ─────────────────────────────────────────────────────

/// Accepts one connection at a time and scripts the daemon side.
async fn start_mini_daemon(daemon_version: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _peer)) = listener.accept().await {
            tokio::spawn(async move {
                let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                let (mut sink, mut stream) = ws.split();

                // Expect hello with the right token.
                let hello = loop {
                    match stream.next().await {
                        Some(Ok(Message::Text(text))) => {
                            if let Ok(msg) = serde_json::from_str::<WsMessage>(&text) {
                                break msg;
                            }
                        }
                        _ => return,
                    }
                };
                let WsMessage::Hello { token, .. } = hello else { return };
                assert_eq!(token.as_deref(), Some(TOKEN));

                let ack = WsMessage::HelloAck {
                    session_id: "s-test".into(),
                    daemon_version: daemon_version.to_owned(),
                };
                let json = serde_json::to_string(&ack).unwrap();
                if sink.send(Message::Text(json)).await.is_err() {
                    return;
                }

                // Scripted replies.
                while let Some(Ok(msg)) = stream.next().await {
                    let Message::Text(text) = msg else { continue };
                    let Ok(parsed) = serde_json::from_str::<WsMessage>(&text) else {
                        continue;
                    };
                    match parsed {
                        WsMessage::CallTool { name, request_id, .. } => {
                            let rid = request_id.unwrap();
                            let replies = script_call(&name, &rid);
                            for reply in replies {
                                let json = serde_json::to_string(&reply).unwrap();
                                if sink.send(Message::Text(json)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        WsMessage::ListTools => {
                            let tools = WsMessage::Tools {
                                items: vec![ToolSummary {
                                    name: "chat".into(),
                                    description: "Chat with a model".into(),
                                    input_schema: json!({ "type": "object" }),
                                    kind: "simple".into(),
                                    provider: Some("glm".into()),
                                }],
                            };
                            let json = serde_json::to_string(&tools).unwrap();
                            if sink.send(Message::Text(json)).await.is_err() {
                                return;
                            }
                        }
                        _ => {}
                    }
                }
            });
        }
    });

    addr
}

fn script_call(name: &str, request_id: &str) -> Vec<WsMessage> {
    match name {
        "slow" => vec![
            WsMessage::Progress {
                request_id: request_id.to_owned(),
                data: ProgressData {
                    kind: "progress".into(),
                    ts: 1.0,
                    message: "halfway".into(),
                    elapsed_secs: 0.5,
                    estimated_remaining_secs: Some(0.5),
                    step: Some(1),
                    total_steps: Some(2),
                    metadata: None,
                },
            },
            WsMessage::CallToolResult {
                request_id: request_id.to_owned(),
                content: json!({ "answer": "done" }),
                metadata: Some(json!({ "duration_s": 1.0 })),
            },
        ],
        "boom" => vec![WsMessage::CallToolError {
            request_id: request_id.to_owned(),
            error: WireError {
                kind: "tool_error".into(),
                message: "tool exploded".into(),
                retry_after_s: None,
            },
        }],
        other => panic!("mini daemon got unexpected tool {other}"),
    }
}

// ── Harness ─────────────────────────────────────────────────────────

/// A fresh health file convinces the bridge the daemon is already up, so it
/// connects instead of trying to auto-start one.
fn write_fresh_health(log_dir: &Path) {
    let hf = HealthFile {
        pid: std::process::id(),
        sessions: 0,
        uptime_s: 1,
        ts: chrono::Utc::now().timestamp(),
    };
    std::fs::write(
        log_dir.join(HEALTH_FILE),
        serde_json::to_string(&hf).unwrap(),
    )
    .unwrap();
}

fn bridge_config(addr: SocketAddr, log_dir: &Path) -> ShimConfig {
    ShimConfig {
        daemon_host: addr.ip().to_string(),
        daemon_port: addr.port(),
        token: Some(TOKEN.into()),
        autostart: false,
        log_dir: log_dir.to_path_buf(),
        timeouts: TimeoutSet::default(),
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn call_tool_roundtrip_with_progress() {
    let dir = tempfile::tempdir().unwrap();
    write_fresh_health(dir.path());
    let addr = start_mini_daemon("0.1.0").await;
    let bridge = DaemonBridge::new(bridge_config(addr, dir.path()));

    let seen = Arc::new(Mutex::new(Vec::<String>::new()));
    let sink = seen.clone();
    let (content, metadata) = bridge
        .call_tool("slow", serde_json::Map::new(), move |data| {
            sink.lock().push(data.message.clone());
        })
        .await
        .unwrap();

    assert_eq!(content, json!({ "answer": "done" }));
    assert!(metadata.is_some());
    assert_eq!(*seen.lock(), vec!["halfway".to_string()]);
    assert_eq!(bridge.session_id().await.as_deref(), Some("s-test"));
}

#[tokio::test]
async fn daemon_error_comes_back_typed() {
    let dir = tempfile::tempdir().unwrap();
    write_fresh_health(dir.path());
    let addr = start_mini_daemon("0.1.0").await;
    let bridge = DaemonBridge::new(bridge_config(addr, dir.path()));

    let err = bridge
        .call_tool("boom", serde_json::Map::new(), |_| {})
        .await
        .unwrap_err();
    match err {
        CallError::Daemon(wire) => {
            assert_eq!(wire.kind, "tool_error");
            assert_eq!(wire.message, "tool exploded");
        }
        other => panic!("expected daemon error, got {other}"),
    }
}

#[tokio::test]
async fn list_tools_resolves() {
    let dir = tempfile::tempdir().unwrap();
    write_fresh_health(dir.path());
    let addr = start_mini_daemon("0.1.0").await;
    let bridge = DaemonBridge::new(bridge_config(addr, dir.path()));

    let tools = bridge.list_tools().await.unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "chat");
    assert_eq!(tools[0].provider.as_deref(), Some("glm"));
}

#[tokio::test]
async fn incompatible_daemon_version_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    write_fresh_health(dir.path());
    let addr = start_mini_daemon("9.0.0").await;
    let bridge = DaemonBridge::new(bridge_config(addr, dir.path()));

    let err = bridge.list_tools().await.unwrap_err();
    // The reconnect loop retries, then gives up carrying the version error.
    let message = err.to_string();
    assert!(matches!(err, Error::DaemonUnreachable(_)), "got: {message}");
    assert!(message.contains("incompatible"), "got: {message}");
}

#[tokio::test]
async fn unreachable_daemon_fails_after_backoff() {
    let dir = tempfile::tempdir().unwrap();
    // No health file, autostart disabled: every connect attempt fails fast.
    let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
    let bridge = DaemonBridge::new(bridge_config(addr, dir.path()));

    let started = std::time::Instant::now();
    let err = bridge
        .call_tool("chat", serde_json::Map::new(), |_| {})
        .await
        .unwrap_err();

    assert!(err.is_daemon_unreachable(), "got: {err}");
    // Immediate try + 1 s + 2 s + 4 s of backoff before giving up.
    assert!(started.elapsed() >= Duration::from_secs(7));
}
