//! The persistent WebSocket session against the daemon.
//!
//! One connection serves every MCP request.  A reader task routes inbound
//! frames to per-call channels by `request_id`; `tools` and other
//! request-id-less replies go to FIFO waiters.  On disconnect, the next
//! call reconnects with exponential backoff before giving up with a typed
//! error.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use exai_domain::error::{Error, Result, TimeoutLayer};
use exai_protocol::{ProgressData, ToolSummary, WireError, WsMessage};

use crate::autostart;
use crate::config::ShimConfig;
use crate::reconnect::ReconnectBackoff;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Grace period for `hello_ack` after connecting.
const HANDSHAKE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// A terminal call failure: either the daemon answered with a typed error,
/// or the transport gave out.
#[derive(Debug)]
pub enum CallError {
    Daemon(WireError),
    Transport(Error),
}

impl CallError {
    pub fn is_daemon_unreachable(&self) -> bool {
        matches!(self, Self::Transport(Error::DaemonUnreachable(_)))
    }
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Daemon(err) => write!(f, "{err}"),
            Self::Transport(err) => write!(f, "{err}"),
        }
    }
}

struct Connection {
    sink: SplitSink<WsStream, Message>,
    session_id: String,
    alive: Arc<AtomicBool>,
    reader: tokio::task::JoinHandle<()>,
}

impl Connection {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Routing tables shared with the reader task.
#[derive(Default)]
struct Routes {
    pending: Mutex<HashMap<String, mpsc::UnboundedSender<WsMessage>>>,
    tools_waiters: Mutex<VecDeque<oneshot::Sender<Vec<ToolSummary>>>>,
}

pub struct DaemonBridge {
    config: ShimConfig,
    backoff: ReconnectBackoff,
    conn: tokio::sync::Mutex<Option<Connection>>,
    routes: Arc<Routes>,
}

impl DaemonBridge {
    pub fn new(config: ShimConfig) -> Self {
        Self {
            config,
            backoff: ReconnectBackoff::default(),
            conn: tokio::sync::Mutex::new(None),
            routes: Arc::new(Routes::default()),
        }
    }

    pub async fn session_id(&self) -> Option<String> {
        self.conn
            .lock()
            .await
            .as_ref()
            .map(|c| c.session_id.clone())
    }

    /// Fetch the daemon's tool inventory.
    pub async fn list_tools(&self) -> Result<Vec<ToolSummary>> {
        let (tx, rx) = oneshot::channel();
        self.routes.tools_waiters.lock().push_back(tx);

        if let Err(err) = self.send_message(&WsMessage::ListTools).await {
            self.routes.tools_waiters.lock().pop_back();
            return Err(err);
        }

        match tokio::time::timeout(HANDSHAKE_TIMEOUT, rx).await {
            Ok(Ok(items)) => Ok(items),
            Ok(Err(_)) => Err(Error::DaemonUnreachable(
                "connection lost awaiting tool inventory".into(),
            )),
            Err(_) => Err(Error::Timeout {
                layer: TimeoutLayer::Shim,
                seconds: HANDSHAKE_TIMEOUT.as_secs(),
            }),
        }
    }

    /// Forward one `call_tool` and await its terminal reply, invoking
    /// `on_progress` for each intermediate progress frame.  Bounded by the
    /// shim timeout (workflow × 2).
    pub async fn call_tool(
        &self,
        name: &str,
        args: serde_json::Map<String, serde_json::Value>,
        mut on_progress: impl FnMut(&ProgressData),
    ) -> std::result::Result<(serde_json::Value, Option<serde_json::Value>), CallError> {
        let request_id = uuid::Uuid::new_v4().to_string();

        let (tx, mut rx) = mpsc::unbounded_channel();
        self.routes
            .pending
            .lock()
            .insert(request_id.clone(), tx);
        let _route = RouteGuard { routes: self.routes.as_ref(), request_id: &request_id };

        self.send_message(&WsMessage::CallTool {
            name: name.to_owned(),
            args,
            request_id: Some(request_id.clone()),
        })
        .await
        .map_err(CallError::Transport)?;

        let shim_deadline = self.config.timeouts.shim();
        let reply_loop = async {
            while let Some(frame) = rx.recv().await {
                match frame {
                    WsMessage::Progress { data, .. } => {
                        tracing::info!(
                            request_id = %request_id,
                            message = %data.message,
                            elapsed_s = data.elapsed_secs,
                            "progress"
                        );
                        on_progress(&data);
                    }
                    WsMessage::CallToolResult { content, metadata, .. } => {
                        return Ok((content, metadata));
                    }
                    WsMessage::CallToolError { error, .. } => {
                        return Err(CallError::Daemon(error));
                    }
                    other => {
                        tracing::debug!(frame = ?std::mem::discriminant(&other), "unexpected routed frame");
                    }
                }
            }
            Err(CallError::Transport(Error::DaemonUnreachable(
                "connection lost while awaiting reply".into(),
            )))
        };

        match tokio::time::timeout(shim_deadline, reply_loop).await {
            Ok(outcome) => outcome,
            Err(_) => Err(CallError::Transport(Error::Timeout {
                layer: TimeoutLayer::Shim,
                seconds: shim_deadline.as_secs(),
            })),
        }
    }

    /// Close the session cleanly (EOF shutdown path).
    pub async fn close(&self) {
        let mut conn = self.conn.lock().await;
        if let Some(mut connection) = conn.take() {
            let _ = connection.sink.send(Message::Close(None)).await;
        }
    }

    // ── Connection management ─────────────────────────────────────────

    async fn send_message(&self, msg: &WsMessage) -> Result<()> {
        let json = serde_json::to_string(msg)?;

        let mut conn = self.conn.lock().await;
        self.ensure_connected(&mut conn).await?;
        // Connected above; a send failure means the daemon dropped between
        // the health check and the write — reconnect once and retry.
        if let Some(connection) = conn.as_mut() {
            if connection.sink.send(Message::Text(json.clone())).await.is_ok() {
                return Ok(());
            }
        }
        *conn = None;
        self.ensure_connected(&mut conn).await?;
        let connection = conn
            .as_mut()
            .ok_or_else(|| Error::DaemonUnreachable("no connection".into()))?;
        connection
            .sink
            .send(Message::Text(json))
            .await
            .map_err(|e| Error::DaemonUnreachable(format!("send failed: {e}")))
    }

    async fn ensure_connected(&self, conn: &mut Option<Connection>) -> Result<()> {
        if conn.as_ref().is_some_and(Connection::is_alive) {
            return Ok(());
        }
        *conn = None;

        // First try immediately, then back off 1 s / 2 s / 4 s.
        let mut last_err = match self.connect_once().await {
            Ok(connection) => {
                *conn = Some(connection);
                return Ok(());
            }
            Err(err) => err,
        };

        for attempt in 0.. {
            if self.backoff.should_give_up(attempt) {
                break;
            }
            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            tracing::info!(attempt = attempt + 1, "reconnecting to daemon");
            match self.connect_once().await {
                Ok(connection) => {
                    *conn = Some(connection);
                    return Ok(());
                }
                Err(err) => last_err = err,
            }
        }

        Err(Error::DaemonUnreachable(format!(
            "gave up after {} reconnect attempts: {last_err}",
            self.backoff.max_attempts
        )))
    }

    async fn connect_once(&self) -> Result<Connection> {
        autostart::ensure_daemon(&self.config).await?;

        let url = self.config.ws_url();
        let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| Error::DaemonUnreachable(format!("connect {url}: {e}")))?;
        let (mut sink, mut stream) = ws.split();

        let hello = WsMessage::Hello {
            token: self.config.token.clone(),
            session_id: None,
        };
        let json = serde_json::to_string(&hello)?;
        sink.send(Message::Text(json))
            .await
            .map_err(|e| Error::DaemonUnreachable(format!("hello send failed: {e}")))?;

        let (session_id, daemon_version) = wait_for_ack(&mut stream).await?;
        check_version_compat(&daemon_version)?;
        tracing::info!(session_id = %session_id, daemon_version = %daemon_version, "daemon session established");

        let alive = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(reader_loop(
            stream,
            self.routes.clone(),
            alive.clone(),
        ));

        Ok(Connection { sink, session_id, alive, reader })
    }
}

/// Removes the pending route when the call winds down, on every exit path.
struct RouteGuard<'a> {
    routes: &'a Routes,
    request_id: &'a str,
}

impl Drop for RouteGuard<'_> {
    fn drop(&mut self) {
        self.routes.pending.lock().remove(self.request_id);
    }
}

async fn wait_for_ack(stream: &mut SplitStream<WsStream>) -> Result<(String, String)> {
    let ack = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        while let Some(Ok(msg)) = stream.next().await {
            if let Message::Text(text) = msg {
                match serde_json::from_str::<WsMessage>(&text) {
                    Ok(WsMessage::HelloAck { session_id, daemon_version }) => {
                        return Ok((session_id, daemon_version));
                    }
                    Ok(WsMessage::Error { error }) => {
                        return Err(Error::Auth(error.message));
                    }
                    _ => continue,
                }
            }
        }
        Err(Error::DaemonUnreachable(
            "connection closed during handshake".into(),
        ))
    })
    .await;

    match ack {
        Ok(result) => result,
        Err(_) => Err(Error::DaemonUnreachable("handshake timed out".into())),
    }
}

/// An incompatible daemon is a fatal shim error; auto-starting over it
/// would only mask the skew.
fn check_version_compat(daemon_version: &str) -> Result<()> {
    let shim_major = major(env!("CARGO_PKG_VERSION"));
    let daemon_major = major(daemon_version);
    if shim_major != daemon_major {
        return Err(Error::Config(format!(
            "daemon version {daemon_version} is incompatible with shim {}",
            env!("CARGO_PKG_VERSION")
        )));
    }
    Ok(())
}

fn major(version: &str) -> &str {
    version.split('.').next().unwrap_or(version)
}

async fn reader_loop(
    mut stream: SplitStream<WsStream>,
    routes: Arc<Routes>,
    alive: Arc<AtomicBool>,
) {
    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Text(text)) => route_frame(&routes, &text),
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    alive.store(false, Ordering::SeqCst);
    // Dropping the senders fails every in-flight call promptly.
    routes.pending.lock().clear();
    routes.tools_waiters.lock().clear();
    tracing::warn!("daemon connection closed");
}

fn route_frame(routes: &Routes, text: &str) {
    let msg = match serde_json::from_str::<WsMessage>(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::debug!(error = %e, "ignoring unparseable daemon frame");
            return;
        }
    };

    // Per-call frames route by request id; the rest are connection-level.
    let reply_id = match &msg {
        WsMessage::Progress { request_id, .. }
        | WsMessage::CallToolResult { request_id, .. }
        | WsMessage::CallToolError { request_id, .. } => Some(request_id.clone()),
        _ => None,
    };

    if let Some(request_id) = reply_id {
        let sender = routes.pending.lock().get(&request_id).cloned();
        match sender {
            Some(sender) => {
                let _ = sender.send(msg);
            }
            None => {
                tracing::debug!(request_id = %request_id, "reply for unknown request");
            }
        }
        return;
    }

    match msg {
        WsMessage::Tools { items } => {
            if let Some(waiter) = routes.tools_waiters.lock().pop_front() {
                let _ = waiter.send(items);
            }
        }
        WsMessage::Shutdown { reason, .. } => {
            tracing::warn!(reason = ?reason, "daemon announced shutdown");
        }
        WsMessage::Pong { .. } | WsMessage::HealthAck { .. } => {}
        other => {
            tracing::debug!(frame = ?std::mem::discriminant(&other), "unrouted daemon frame");
        }
    }
}
