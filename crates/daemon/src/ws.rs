//! WebSocket endpoint for client (shim) connections.
//!
//! Flow:
//! 1. Client connects to `ws://<host>:<port>/ws`
//! 2. Client sends `hello` with the bearer token (10 s grace)
//! 3. Daemon ensures a session and responds with `hello_ack`
//! 4. Message loop: `list_tools` / `call_tool` / `health` / `ping`;
//!    replies and `progress` frames multiplex over the session's
//!    outbound queue, matched by `request_id`

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use exai_domain::error::Error;
use exai_protocol::{CircuitStats, HealthMetrics, SessionStats, ToolSummary, WireError, WsMessage};
use exai_tools::ToolDescriptor;

use crate::pipeline;
use crate::state::DaemonState;

/// Grace period for the client to send `hello` after connecting.
const HELLO_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

pub fn router(state: DaemonState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<DaemonState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Socket handler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn handle_socket(socket: WebSocket, state: DaemonState) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    // 1. Wait for hello.
    let Some((token, requested_id)) = wait_for_hello(&mut ws_stream).await else {
        tracing::warn!("client disconnected before sending hello");
        return;
    };

    // 2. Authenticate.
    if !state.auth.check(token.as_deref()) {
        tracing::warn!("client presented an invalid token");
        let err = Error::Auth("invalid or missing token".into());
        let _ = send_ws_message(
            &mut ws_sink,
            &WsMessage::Error { error: WireError::from(&err) },
        )
        .await;
        return;
    }

    // 3. Ensure a session (capacity-capped).
    let session = match state.sessions.ensure(requested_id.as_deref()) {
        Ok(session) => session,
        Err(err) => {
            let _ = send_ws_message(
                &mut ws_sink,
                &WsMessage::Error { error: WireError::from(&err) },
            )
            .await;
            return;
        }
    };
    let session_id = session.id.clone();

    // 4. Acknowledge.
    let ack = WsMessage::HelloAck {
        session_id: session_id.clone(),
        daemon_version: env!("CARGO_PKG_VERSION").to_owned(),
    };
    if send_ws_message(&mut ws_sink, &ack).await.is_err() {
        tracing::warn!(session_id = %session_id, "failed to send hello_ack");
        state.sessions.remove(&session_id);
        return;
    }

    tracing::info!(session_id = %session_id, "client connected");

    // 5. Outbound queue: replies and progress frames funnel through here so
    //    concurrent call tasks never write to the sink directly.
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<WsMessage>(64);
    state.outbound.register(&session_id, outbound_tx);

    let writer = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            if send_ws_message(&mut ws_sink, &msg).await.is_err() {
                break;
            }
        }
    });

    // 6. Read loop, cut short by graceful shutdown.
    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            next = ws_stream.next() => match next {
                Some(Ok(Message::Text(text))) => {
                    handle_frame(&state, &session_id, &text).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {
                    // WS-level ping/pong; axum answers these itself.
                    state.sessions.update_activity(&session_id);
                }
                Some(Err(e)) => {
                    tracing::debug!(session_id = %session_id, error = %e, "read error");
                    break;
                }
            }
        }
    }

    // 7. Cleanup.
    writer.abort();
    state.outbound.remove(&session_id);
    state.sessions.remove(&session_id);
    tracing::info!(session_id = %session_id, "client disconnected");
}

async fn handle_frame(state: &DaemonState, session_id: &str, text: &str) {
    state.sessions.update_activity(session_id);

    let msg = match serde_json::from_str::<WsMessage>(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::debug!(session_id, error = %e, "ignoring unparseable frame");
            return;
        }
    };

    match msg {
        WsMessage::ListTools => {
            let items = state.tools.list().iter().map(tool_summary).collect();
            state
                .outbound
                .send_to(session_id, WsMessage::Tools { items })
                .await;
        }

        WsMessage::CallTool { name, args, request_id } => {
            let state = state.clone();
            let session_id = session_id.to_owned();
            tokio::spawn(async move {
                pipeline::handle_call_tool(state, session_id, name, args, request_id).await;
            });
        }

        WsMessage::Health => {
            let metrics = health_metrics(state);
            state
                .outbound
                .send_to(session_id, WsMessage::HealthAck { metrics })
                .await;
        }

        WsMessage::Shutdown { token, .. } => {
            if state.admin_auth.enabled() && state.admin_auth.check(token.as_deref()) {
                tracing::warn!(session_id, "shutdown requested by admin client");
                state.shutdown.cancel();
            } else {
                let err = Error::Auth("shutdown requires the admin token".into());
                state
                    .outbound
                    .send_to(session_id, WsMessage::Error { error: WireError::from(&err) })
                    .await;
            }
        }

        WsMessage::Ping { timestamp } => {
            state
                .outbound
                .send_to(session_id, WsMessage::Pong { timestamp })
                .await;
        }

        WsMessage::Pong { .. } | WsMessage::Hello { .. } => {}

        other => {
            tracing::debug!(
                session_id,
                msg = ?std::mem::discriminant(&other),
                "unexpected inbound message type"
            );
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn wait_for_hello(
    stream: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
) -> Option<(Option<String>, Option<String>)> {
    let result = tokio::time::timeout(HELLO_TIMEOUT, async {
        while let Some(Ok(msg)) = stream.next().await {
            if let Message::Text(text) = msg {
                if let Ok(WsMessage::Hello { token, session_id }) =
                    serde_json::from_str::<WsMessage>(&text)
                {
                    return Some((token, session_id));
                }
            }
        }
        None
    })
    .await;

    result.unwrap_or(None)
}

async fn send_ws_message(
    sink: &mut (impl SinkExt<Message> + Unpin),
    msg: &WsMessage,
) -> Result<(), ()> {
    let json = serde_json::to_string(msg).map_err(|_| ())?;
    sink.send(Message::Text(json)).await.map_err(|_| ())
}

fn tool_summary(descriptor: &ToolDescriptor) -> ToolSummary {
    ToolSummary {
        name: descriptor.name.clone(),
        description: descriptor.description.clone(),
        input_schema: descriptor.input_schema.clone(),
        kind: descriptor.kind.as_str().to_owned(),
        provider: descriptor.provider.map(|p| p.as_str().to_owned()),
    }
}

pub(crate) fn health_metrics(state: &DaemonState) -> HealthMetrics {
    let sessions = state.sessions.metrics();
    let circuits = state
        .degrader
        .breaker()
        .snapshot()
        .into_iter()
        .map(|c| CircuitStats {
            op: c.op,
            failures: c.failures,
            open: c.open,
            seconds_until_close: c.seconds_until_close,
        })
        .collect();

    HealthMetrics {
        pid: std::process::id(),
        uptime_s: state.uptime_s(),
        sessions: SessionStats {
            total: sessions.total_sessions,
            active: sessions.active_sessions,
            oldest_age_s: sessions.oldest_session_age.as_secs_f64(),
            newest_age_s: sessions.newest_session_age.as_secs_f64(),
            avg_age_s: sessions.avg_session_age.as_secs_f64(),
        },
        circuits,
    }
}
