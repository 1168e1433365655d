//! The stdio MCP server loop.
//!
//! Reads line-delimited JSON-RPC from stdin, answers on stdout through a
//! single writer task (progress notifications interleave with responses),
//! and forwards `tools/call` to the daemon bridge.  Requests are processed
//! in arrival order; the shim never executes tools itself.

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use exai_domain::error::{Error, Result};
use exai_protocol::ToolSummary;

use crate::bridge::{CallError, DaemonBridge};
use crate::config::ShimConfig;
use crate::mcp::{
    self, CallParams, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, McpToolDef,
};

pub async fn run(config: ShimConfig) -> Result<()> {
    let bridge = DaemonBridge::new(config);

    // Single writer: responses and notifications are whole lines, never
    // interleaved mid-message.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if stdout.write_all(b"\n").await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let outcome = loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            // Clean EOF: the client closed our stdin.
            Ok(None) => break Ok(()),
            Err(e) => break Err(Error::Io(e)),
        };
        if line.trim().is_empty() {
            continue;
        }

        let request = match serde_json::from_str::<JsonRpcRequest>(&line) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = %e, "unparseable request line");
                respond(
                    &out_tx,
                    JsonRpcResponse::error(Value::Null, mcp::PARSE_ERROR, "parse error"),
                );
                continue;
            }
        };

        if request.is_notification() {
            tracing::debug!(method = %request.method, "notification received");
            continue;
        }

        if let Err(fatal) = dispatch(&bridge, &out_tx, request).await {
            // Daemon unreachable after retries: surface and stop.
            break Err(fatal);
        }
    };

    bridge.close().await;
    drop(out_tx);
    let _ = writer.await;
    outcome
}

/// Handle one request.  Returns `Err` only for fatal conditions that must
/// terminate the shim (exit code 1).
async fn dispatch(
    bridge: &DaemonBridge,
    out: &mpsc::UnboundedSender<String>,
    request: JsonRpcRequest,
) -> Result<()> {
    let JsonRpcRequest { id, method, params, .. } = request;
    // Checked by the caller: notifications never reach dispatch.
    let id = id.unwrap_or(Value::Null);
    tracing::debug!(method = %method, "request");

    match method.as_str() {
        "initialize" => {
            respond(out, JsonRpcResponse::result(id, mcp::initialize_result()));
            Ok(())
        }

        "ping" => {
            respond(out, JsonRpcResponse::result(id, json!({})));
            Ok(())
        }

        "tools/list" => match bridge.list_tools().await {
            Ok(items) => {
                let tools: Vec<McpToolDef> = items.iter().map(tool_def).collect();
                respond(
                    out,
                    JsonRpcResponse::result(id, json!({ "tools": tools })),
                );
                Ok(())
            }
            Err(err @ Error::DaemonUnreachable(_)) => {
                respond(
                    out,
                    JsonRpcResponse::error(id, mcp::INTERNAL_ERROR, err.to_string()),
                );
                Err(err)
            }
            Err(err) => {
                respond(
                    out,
                    JsonRpcResponse::error(id, mcp::INTERNAL_ERROR, err.to_string()),
                );
                Ok(())
            }
        },

        "tools/call" => {
            let params: CallParams = match serde_json::from_value(params) {
                Ok(params) => params,
                Err(e) => {
                    respond(
                        out,
                        JsonRpcResponse::error(
                            id,
                            mcp::INVALID_PARAMS,
                            format!("invalid tools/call params: {e}"),
                        ),
                    );
                    return Ok(());
                }
            };

            let progress_token = params.meta.progress_token.clone();
            let notify = out.clone();
            let on_progress = move |data: &exai_protocol::ProgressData| {
                // Always logged (by the bridge); notified only when the
                // client gave us a token.
                let Some(token) = &progress_token else { return };
                let progress = data.step.map(f64::from).unwrap_or(data.elapsed_secs);
                let total = data.total_steps.map(f64::from);
                let notif =
                    JsonRpcNotification::progress(token, progress, total, &data.message);
                if let Ok(line) = serde_json::to_string(&notif) {
                    let _ = notify.send(line);
                }
            };

            match bridge.call_tool(&params.name, params.arguments, on_progress).await {
                Ok((content, _metadata)) => {
                    respond(out, JsonRpcResponse::result(id, mcp::call_result(&content)));
                    Ok(())
                }
                Err(CallError::Daemon(wire)) => {
                    respond(
                        out,
                        JsonRpcResponse::error(
                            id,
                            mcp::TOOL_CALL_FAILED,
                            format!("{wire}"),
                        ),
                    );
                    Ok(())
                }
                Err(CallError::Transport(err)) => {
                    respond(
                        out,
                        JsonRpcResponse::error(id, mcp::INTERNAL_ERROR, err.to_string()),
                    );
                    if matches!(err, Error::DaemonUnreachable(_)) {
                        Err(err)
                    } else {
                        Ok(())
                    }
                }
            }
        }

        other => {
            respond(
                out,
                JsonRpcResponse::error(
                    id,
                    mcp::METHOD_NOT_FOUND,
                    format!("method not found: {other}"),
                ),
            );
            Ok(())
        }
    }
}

fn respond(out: &mpsc::UnboundedSender<String>, response: JsonRpcResponse) {
    match serde_json::to_string(&response) {
        Ok(line) => {
            let _ = out.send(line);
        }
        Err(e) => tracing::warn!(error = %e, "unserializable response dropped"),
    }
}

fn tool_def(summary: &ToolSummary) -> McpToolDef {
    McpToolDef {
        name: summary.name.clone(),
        description: summary.description.clone(),
        input_schema: summary.input_schema.clone(),
    }
}
