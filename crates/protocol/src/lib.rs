//! Daemon ↔ shim wire protocol.
//!
//! Every WebSocket frame is one UTF-8 JSON object tagged by `op`.  The shim
//! speaks this protocol on one side and line-delimited MCP JSON-RPC on the
//! other; the daemon speaks it to every connected client.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use exai_domain::error::Error;

pub mod health;

/// WebSocket message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum WsMessage {
    /// Client → Daemon: initial handshake carrying the bearer token and an
    /// optional session id to resume.
    #[serde(rename = "hello")]
    Hello {
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },

    /// Daemon → Client: handshake accepted.
    #[serde(rename = "hello_ack")]
    HelloAck {
        session_id: String,
        daemon_version: String,
    },

    /// Client → Daemon: request the tool inventory.
    #[serde(rename = "list_tools")]
    ListTools,

    /// Daemon → Client: the tool inventory.
    #[serde(rename = "tools")]
    Tools { items: Vec<ToolSummary> },

    /// Client → Daemon: invoke a tool.
    #[serde(rename = "call_tool")]
    CallTool {
        name: String,
        #[serde(default)]
        args: serde_json::Map<String, Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    /// Daemon → Client: in-flight progress for a call.
    #[serde(rename = "progress")]
    Progress {
        request_id: String,
        data: ProgressData,
    },

    /// Daemon → Client: terminal success for a call.
    #[serde(rename = "call_tool_result")]
    CallToolResult {
        request_id: String,
        content: Value,
        #[serde(rename = "_metadata", skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },

    /// Daemon → Client: terminal failure for a call.
    #[serde(rename = "call_tool_error")]
    CallToolError {
        request_id: String,
        error: WireError,
    },

    /// Client → Daemon: request session metrics and circuit state.
    #[serde(rename = "health")]
    Health,

    /// Daemon → Client: health snapshot.
    #[serde(rename = "health_ack")]
    HealthAck { metrics: HealthMetrics },

    /// Client → Daemon: request graceful termination (admin token required).
    /// Daemon → Client: notice that the daemon is going down.
    #[serde(rename = "shutdown")]
    Shutdown {
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Daemon → Client: connection-level failure (auth, session limit,
    /// unparseable frame).  Sent once, then the connection closes.
    #[serde(rename = "error")]
    Error { error: WireError },

    /// Bidirectional application-level heartbeat.
    #[serde(rename = "ping")]
    Ping { timestamp: i64 },

    /// Bidirectional heartbeat response.
    #[serde(rename = "pong")]
    Pong { timestamp: i64 },
}

/// One entry in the `tools` inventory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSummary {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub input_schema: Value,
    /// `"simple"`, `"workflow"`, or `"expert"`.
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

/// The payload of a `progress` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressData {
    /// Always `"progress"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Unix seconds.
    pub ts: f64,
    pub message: String,
    pub elapsed_secs: f64,
    pub estimated_remaining_secs: Option<f64>,
    pub step: Option<u32>,
    pub total_steps: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// A typed error payload: `{kind, message}` plus an optional retry hint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_s: Option<u64>,
}

impl From<&Error> for WireError {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind().to_owned(),
            message: err.public_message(),
            retry_after_s: err.retry_after_s(),
        }
    }
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// The `metrics` payload of a `health_ack`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthMetrics {
    pub pid: u32,
    pub uptime_s: u64,
    pub sessions: SessionStats,
    pub circuits: Vec<CircuitStats>,
}

/// Aggregate session-table snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionStats {
    pub total: usize,
    /// Sessions that are not timed out.
    pub active: usize,
    pub oldest_age_s: f64,
    pub newest_age_s: f64,
    pub avg_age_s: f64,
}

/// Per-operation circuit-breaker snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitStats {
    pub op: String,
    pub failures: u32,
    pub open: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seconds_until_close: Option<u64>,
}
