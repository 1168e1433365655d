//! Unified structured event log.
//!
//! Every tool call and expert validation appends JSON-lines events to
//! `<logdir>/toolcalls.jsonl`, correlated by request id.  Events buffer in
//! memory and flush when the buffer fills or on explicit [`StructuredLog::flush`].
//! Logging never fails the hosting call: write errors are reported on stderr
//! and the events dropped.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use exai_domain::paths::TOOLCALLS_FILE;

use crate::sanitize;

/// Buffer flushes once it holds this many events.
const FLUSH_THRESHOLD: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEventKind {
    ToolStart,
    ToolProgress,
    ToolComplete,
    ToolError,
    ExpertValidationStart,
    ExpertValidationComplete,
}

/// One self-contained JSON line in the event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    /// Unix seconds (fractional).
    pub ts: f64,
    pub iso_time: String,
    pub event: LogEventKind,
    pub tool: String,
    pub request_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_s: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_preview: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl LogEvent {
    fn new(event: LogEventKind, tool: &str, request_id: &str) -> Self {
        Self {
            ts: unix_now(),
            iso_time: Utc::now().to_rfc3339(),
            event,
            tool: tool.to_owned(),
            request_id: request_id.to_owned(),
            params: None,
            step: None,
            total_steps: None,
            message: None,
            duration_s: None,
            result_preview: None,
            error: None,
            traceback: None,
            metadata: None,
        }
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

struct LogBuffer {
    events: Vec<LogEvent>,
    dir_ready: bool,
}

/// Buffered JSON-lines event log.  One instance per daemon, injected at
/// startup; tests construct fresh instances over a temp directory.
pub struct StructuredLog {
    path: PathBuf,
    buffer: Mutex<LogBuffer>,
}

impl StructuredLog {
    pub fn new(log_dir: &Path) -> Self {
        Self {
            path: log_dir.join(TOOLCALLS_FILE),
            buffer: Mutex::new(LogBuffer { events: Vec::new(), dir_ready: false }),
        }
    }

    pub fn tool_start(&self, tool: &str, request_id: &str, params: &Map<String, Value>) {
        let mut ev = LogEvent::new(LogEventKind::ToolStart, tool, request_id);
        ev.params = Some(Value::Object(sanitize::sanitize_map(params)));
        self.push(ev);
    }

    pub fn tool_progress(
        &self,
        tool: &str,
        request_id: &str,
        step: u32,
        total_steps: u32,
        message: &str,
        metadata: Option<Value>,
    ) {
        let mut ev = LogEvent::new(LogEventKind::ToolProgress, tool, request_id);
        ev.step = Some(step);
        ev.total_steps = Some(total_steps);
        ev.message = Some(sanitize::truncate(message, sanitize::MAX_STRING_LEN));
        ev.metadata = metadata;
        self.push(ev);
    }

    pub fn tool_complete(
        &self,
        tool: &str,
        request_id: &str,
        duration_s: f64,
        result_preview: &str,
        metadata: Option<Value>,
    ) {
        let mut ev = LogEvent::new(LogEventKind::ToolComplete, tool, request_id);
        ev.duration_s = Some(duration_s);
        ev.result_preview = Some(sanitize::preview(result_preview));
        ev.metadata = metadata;
        self.push(ev);
    }

    pub fn tool_error(
        &self,
        tool: &str,
        request_id: &str,
        error: &str,
        traceback: Option<String>,
        metadata: Option<Value>,
    ) {
        let mut ev = LogEvent::new(LogEventKind::ToolError, tool, request_id);
        ev.error = Some(sanitize::truncate(error, sanitize::MAX_STRING_LEN));
        ev.traceback = traceback;
        ev.metadata = metadata;
        self.push(ev);
    }

    pub fn expert_start(&self, tool: &str, request_id: &str, content_preview: &str) {
        let mut ev = LogEvent::new(LogEventKind::ExpertValidationStart, tool, request_id);
        ev.result_preview = Some(sanitize::preview(content_preview));
        self.push(ev);
    }

    pub fn expert_complete(
        &self,
        tool: &str,
        request_id: &str,
        duration_s: f64,
        result_preview: &str,
    ) {
        let mut ev = LogEvent::new(LogEventKind::ExpertValidationComplete, tool, request_id);
        ev.duration_s = Some(duration_s);
        ev.result_preview = Some(sanitize::preview(result_preview));
        self.push(ev);
    }

    fn push(&self, event: LogEvent) {
        let mut buf = self.buffer.lock();
        buf.events.push(event);
        if buf.events.len() >= FLUSH_THRESHOLD {
            Self::write_out(&self.path, &mut buf);
        }
    }

    /// Flush any buffered events to disk.  Called on shutdown and from tests;
    /// the buffer also self-flushes at the threshold.
    pub fn flush(&self) {
        let mut buf = self.buffer.lock();
        if !buf.events.is_empty() {
            Self::write_out(&self.path, &mut buf);
        }
    }

    fn write_out(path: &Path, buf: &mut LogBuffer) {
        if !buf.dir_ready {
            if let Some(parent) = path.parent() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    tracing::warn!(path = %parent.display(), error = %e, "cannot create log directory");
                    buf.events.clear();
                    return;
                }
            }
            buf.dir_ready = true;
        }

        let events = std::mem::take(&mut buf.events);
        let mut out = String::new();
        for event in &events {
            match serde_json::to_string(event) {
                Ok(json) => {
                    out.push_str(&json);
                    out.push('\n');
                }
                Err(e) => {
                    tracing::warn!(error = %e, "unserializable log event dropped");
                }
            }
        }

        use std::io::Write;
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| file.write_all(out.as_bytes()));
        if let Err(e) = result {
            tracing::warn!(path = %path.display(), error = %e, dropped = events.len(), "event log write failed");
        }
    }
}

impl Drop for StructuredLog {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn read_events(dir: &Path) -> Vec<LogEvent> {
        let raw = std::fs::read_to_string(dir.join(TOOLCALLS_FILE)).unwrap_or_default();
        raw.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn events_bracket_in_program_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = StructuredLog::new(dir.path());

        log.tool_start("debug", "r1", &obj(json!({"prompt": "hi"})));
        log.tool_progress("debug", "r1", 1, 3, "working", None);
        log.tool_progress("debug", "r1", 2, 3, "still working", None);
        log.tool_complete("debug", "r1", 1.5, "done", None);
        log.flush();

        let events = read_events(dir.path());
        let kinds: Vec<LogEventKind> = events.iter().map(|e| e.event).collect();
        assert_eq!(
            kinds,
            vec![
                LogEventKind::ToolStart,
                LogEventKind::ToolProgress,
                LogEventKind::ToolProgress,
                LogEventKind::ToolComplete,
            ]
        );
        assert!(events.iter().all(|e| e.request_id == "r1"));
    }

    #[test]
    fn buffer_self_flushes_at_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let log = StructuredLog::new(dir.path());

        for i in 0..FLUSH_THRESHOLD - 1 {
            log.tool_progress("t", "r", i as u32, 10, "tick", None);
        }
        // Below the threshold: nothing on disk yet.
        assert!(!dir.path().join(TOOLCALLS_FILE).exists());

        log.tool_progress("t", "r", 9, 10, "tick", None);
        assert_eq!(read_events(dir.path()).len(), FLUSH_THRESHOLD);
    }

    #[test]
    fn no_sensitive_values_reach_disk() {
        let dir = tempfile::tempdir().unwrap();
        let log = StructuredLog::new(dir.path());

        log.tool_start(
            "chat",
            "r2",
            &obj(json!({"prompt": "hi", "api_key": "sk-live-123", "Token": "tok-9"})),
        );
        log.flush();

        let raw = std::fs::read_to_string(dir.path().join(TOOLCALLS_FILE)).unwrap();
        assert!(!raw.contains("sk-live-123"));
        assert!(!raw.contains("tok-9"));
        assert!(raw.contains(sanitize::REDACTED));
    }

    #[test]
    fn result_preview_capped_at_200() {
        let dir = tempfile::tempdir().unwrap();
        let log = StructuredLog::new(dir.path());

        log.tool_complete("chat", "r3", 0.2, &"z".repeat(1000), None);
        log.flush();

        let events = read_events(dir.path());
        let preview = events[0].result_preview.as_ref().unwrap();
        assert!(preview.chars().count() <= sanitize::MAX_PREVIEW_LEN + sanitize::TRUNCATION_MARKER.chars().count());
    }

    #[test]
    fn write_failure_is_swallowed() {
        // Point the log at a path whose parent is a file, so creation fails.
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocked");
        std::fs::write(&blocker, b"not a dir").unwrap();

        let log = StructuredLog::new(&blocker.join("sub"));
        log.tool_start("t", "r", &Map::new());
        log.flush(); // must not panic or return an error
    }
}
