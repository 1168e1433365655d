//! JSON-RPC 2.0 types for the MCP server role.
//!
//! Each message is a single line of JSON (newline-delimited) on
//! stdin/stdout.  The shim answers `initialize`, `tools/list`, `tools/call`
//! and `ping`; progress surfaces as `notifications/progress` when the call
//! carries a progress token.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

pub const PARSE_ERROR: i64 = -32700;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
/// Server-defined code for daemon-side tool failures.
pub const TOOL_CALL_FAILED: i64 = -32000;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Requests / responses
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An incoming JSON-RPC request or notification (no `id`).
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    /// Number or string; echoed back verbatim.  Absent for notifications.
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl JsonRpcRequest {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// An outgoing JSON-RPC response.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn result(id: Value, result: Value) -> Self {
        Self { jsonrpc: "2.0", id, result: Some(result), error: None }
    }

    pub fn error(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(JsonRpcError { code, message: message.into(), data: None }),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// An outgoing notification (no `id`).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: &'static str,
    pub method: &'static str,
    pub params: Value,
}

impl JsonRpcNotification {
    pub fn progress(token: &Value, progress: f64, total: Option<f64>, message: &str) -> Self {
        let mut params = serde_json::json!({
            "progressToken": token,
            "progress": progress,
            "message": message,
        });
        if let Some(total) = total {
            params["total"] = serde_json::json!(total);
        }
        Self { jsonrpc: "2.0", method: "notifications/progress", params }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// MCP payloads
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The result of `initialize`.
pub fn initialize_result() -> Value {
    serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": { "tools": {} },
        "serverInfo": {
            "name": "exai-shim",
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

/// One tool entry in a `tools/list` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpToolDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub input_schema: Value,
}

/// Parameters of a `tools/call` request.
#[derive(Debug, Clone, Deserialize)]
pub struct CallParams {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Map<String, Value>,
    /// `_meta.progressToken`, when the client wants progress notifications.
    #[serde(default, rename = "_meta")]
    pub meta: CallMeta,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallMeta {
    pub progress_token: Option<Value>,
}

/// Wrap a daemon tool result as MCP `tools/call` content.
pub fn call_result(content: &Value) -> Value {
    let text = match content {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    serde_json::json!({
        "content": [{ "type": "text", "text": text }],
        "isError": false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_request_with_numeric_id() {
        let raw = r#"{"jsonrpc":"2.0","id":7,"method":"tools/list"}"#;
        let req: JsonRpcRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(req.id, Some(json!(7)));
        assert_eq!(req.method, "tools/list");
        assert!(!req.is_notification());
        assert!(req.params.is_null());
    }

    #[test]
    fn parse_notification_without_id() {
        let raw = r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#;
        let req: JsonRpcRequest = serde_json::from_str(raw).unwrap();
        assert!(req.is_notification());
    }

    #[test]
    fn response_serialization_omits_empty_side() {
        let ok = JsonRpcResponse::result(json!(1), json!({"x": 1}));
        let raw = serde_json::to_string(&ok).unwrap();
        assert!(raw.contains("\"result\""));
        assert!(!raw.contains("\"error\""));

        let err = JsonRpcResponse::error(json!("abc"), METHOD_NOT_FOUND, "nope");
        let raw = serde_json::to_string(&err).unwrap();
        assert!(raw.contains("\"error\""));
        assert!(raw.contains("-32601"));
        assert!(!raw.contains("\"result\""));
    }

    #[test]
    fn call_params_extract_progress_token() {
        let raw = json!({
            "name": "chat",
            "arguments": { "prompt": "hi" },
            "_meta": { "progressToken": "tok-1" }
        });
        let params: CallParams = serde_json::from_value(raw).unwrap();
        assert_eq!(params.name, "chat");
        assert_eq!(params.meta.progress_token, Some(json!("tok-1")));
    }

    #[test]
    fn call_params_without_meta() {
        let params: CallParams =
            serde_json::from_value(json!({ "name": "chat" })).unwrap();
        assert!(params.meta.progress_token.is_none());
        assert!(params.arguments.is_empty());
    }

    #[test]
    fn progress_notification_shape() {
        let notif =
            JsonRpcNotification::progress(&json!("tok"), 2.0, Some(5.0), "step 2");
        let raw = serde_json::to_value(&notif).unwrap();
        assert_eq!(raw["method"], "notifications/progress");
        assert_eq!(raw["params"]["progressToken"], json!("tok"));
        assert_eq!(raw["params"]["total"], json!(5.0));
    }

    #[test]
    fn call_result_wraps_text() {
        let wrapped = call_result(&json!({"answer": 42}));
        assert_eq!(wrapped["content"][0]["type"], "text");
        assert!(wrapped["content"][0]["text"]
            .as_str()
            .unwrap()
            .contains("42"));
        assert_eq!(wrapped["isError"], json!(false));
    }

    #[test]
    fn initialize_result_announces_tools_capability() {
        let init = initialize_result();
        assert_eq!(init["protocolVersion"], PROTOCOL_VERSION);
        assert!(init["capabilities"]["tools"].is_object());
    }
}
