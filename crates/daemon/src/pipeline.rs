//! The tool-call pipeline.
//!
//! One spawned task per `call_tool`: log start → acquire permits → wire the
//! heartbeat → run the invocation through the degrader (routing expert calls
//! through the dedup cache) → reply with a terminal result or typed error.
//! Permits, heartbeat scope, cancellation, and tracker registration all
//! release through guards, on every exit path.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::Instant;

use exai_domain::error::{Error, Result, TimeoutLayer};
use exai_protocol::{ProgressData, WireError, WsMessage};
use exai_resilience::ExecOptions;
use exai_telemetry::heartbeat::ProgressCallback;
use exai_telemetry::{ProgressEvent, ProgressHeartbeat, ProgressTracker};
use exai_tools::{Tool, ToolArgs, ToolContext, ToolKind, ToolRegistry};
use tokio_util::sync::CancellationToken;

use crate::state::DaemonState;

/// Progress frames for one call emit at most every 6 seconds.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(6);

pub async fn handle_call_tool(
    state: DaemonState,
    session_id: String,
    name: String,
    args: ToolArgs,
    request_id: Option<String>,
) {
    let request_id = request_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let started = Instant::now();

    state.event_log.tool_start(&name, &request_id, &args);
    tracing::info!(tool = %name, request_id = %request_id, session_id = %session_id, "tool call started");

    // The daemon deadline is the outer bound: it cuts off tools that ignore
    // their own cancellation.
    let daemon_deadline = state.timeouts.daemon();
    let outcome = tokio::time::timeout(
        daemon_deadline,
        run_call(&state, &session_id, &name, &request_id, args),
    )
    .await
    .unwrap_or(Err(Error::Timeout {
        layer: TimeoutLayer::Daemon,
        seconds: daemon_deadline.as_secs(),
    }));

    let duration_s = started.elapsed().as_secs_f64();
    match outcome {
        Ok(content) => {
            let preview = content.to_string();
            state
                .event_log
                .tool_complete(&name, &request_id, duration_s, &preview, None);
            tracing::info!(tool = %name, request_id = %request_id, duration_s, "tool call complete");
            state
                .outbound
                .send_to(
                    &session_id,
                    WsMessage::CallToolResult {
                        request_id,
                        content,
                        metadata: Some(json!({ "tool": name, "duration_s": duration_s })),
                    },
                )
                .await;
        }
        Err(err) => {
            state
                .event_log
                .tool_error(&name, &request_id, &err.to_string(), None, None);
            tracing::warn!(tool = %name, request_id = %request_id, error = %err, "tool call failed");
            state
                .outbound
                .send_to(
                    &session_id,
                    WsMessage::CallToolError {
                        request_id,
                        error: WireError::from(&err),
                    },
                )
                .await;
        }
    }
}

async fn run_call(
    state: &DaemonState,
    session_id: &str,
    name: &str,
    request_id: &str,
    args: ToolArgs,
) -> Result<Value> {
    let tool = state
        .tools
        .get(name)
        .ok_or_else(|| Error::Tool(format!("unknown tool: {name}")))?;
    let descriptor = tool.describe();
    ToolRegistry::validate_args(&descriptor, &args)?;

    // Session → global → provider permits.  The wait is bounded by the
    // tool's own deadline (never more than the daemon bound).  Held for the
    // rest of the call; dropped on every exit path.
    let _permits = state
        .permits
        .acquire(session_id, descriptor.provider, descriptor.timeout(&state.timeouts))
        .await?;

    // Heartbeat wired to the session's outbound queue.
    let heartbeat = {
        let outbound = state.outbound.clone();
        let sid = session_id.to_owned();
        let rid = request_id.to_owned();
        let callback: ProgressCallback = Arc::new(move |event| {
            outbound.try_send_to(
                &sid,
                WsMessage::Progress {
                    request_id: rid.clone(),
                    data: progress_data(event),
                },
            );
        });
        ProgressHeartbeat::new(HEARTBEAT_INTERVAL, callback)
    };
    state.tracker.register(request_id, heartbeat.clone());
    let _tracking = TrackerGuard { tracker: &state.tracker, request_id };
    let _scope = heartbeat.activate();

    // Cancellation fans out to the tool's inner work when the call winds
    // down for any reason.
    let cancel = CancellationToken::new();
    let _cancel_on_exit = cancel.clone().drop_guard();

    let deadline = descriptor.timeout(&state.timeouts);
    let ctx = ToolContext {
        request_id: request_id.to_owned(),
        session_id: session_id.to_owned(),
        cancel,
        deadline,
    };
    let opts = ExecOptions::new(name, deadline, descriptor.max_retries());

    if descriptor.kind == ToolKind::Expert {
        run_expert(state, tool, ctx, args, heartbeat, &opts).await
    } else {
        state
            .degrader
            .execute(&opts, || {
                tool.invoke(ctx.clone(), args.clone(), heartbeat.clone())
            })
            .await
    }
}

/// Expert validations dedupe on `(tool, request_id, hash(findings))` and
/// degrade to a skip-validation stub when the primary path is exhausted.
async fn run_expert(
    state: &DaemonState,
    tool: Arc<dyn Tool>,
    ctx: ToolContext,
    args: ToolArgs,
    heartbeat: Arc<ProgressHeartbeat>,
    opts: &ExecOptions,
) -> Result<Value> {
    let findings = args.get("findings").cloned().unwrap_or(Value::Null);
    let started = Instant::now();
    state
        .event_log
        .expert_start(&opts.op_name, &ctx.request_id, &findings.to_string());

    let result = state
        .degrader
        .execute_with_fallback(
            opts,
            || {
                let tool = tool.clone();
                let ctx = ctx.clone();
                let args = args.clone();
                let heartbeat = heartbeat.clone();
                let findings = findings.clone();
                async move {
                    state
                        .dedup
                        .validate(&opts.op_name, &ctx.request_id, &findings, || {
                            tool.invoke(ctx.clone(), args, heartbeat)
                        })
                        .await
                }
            },
            Some(|| async {
                Ok(json!({
                    "validated": false,
                    "warning": "expert validation unavailable",
                }))
            }),
        )
        .await;

    if let Ok(value) = &result {
        state.event_log.expert_complete(
            &opts.op_name,
            &ctx.request_id,
            started.elapsed().as_secs_f64(),
            &value.to_string(),
        );
    }
    result
}

fn progress_data(event: &ProgressEvent) -> ProgressData {
    ProgressData {
        kind: "progress".to_owned(),
        ts: event.ts,
        message: event.message.clone(),
        elapsed_secs: event.elapsed_secs,
        estimated_remaining_secs: event.estimated_remaining_secs,
        step: event.step,
        total_steps: event.total_steps,
        metadata: event.metadata.clone(),
    }
}

struct TrackerGuard<'a> {
    tracker: &'a ProgressTracker,
    request_id: &'a str,
}

impl Drop for TrackerGuard<'_> {
    fn drop(&mut self) {
        self.tracker.remove(self.request_id);
    }
}
