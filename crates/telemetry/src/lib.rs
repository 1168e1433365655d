//! Operational telemetry: the structured tool-call event log and the
//! rate-limited progress heartbeat.

pub mod heartbeat;
pub mod log;
pub mod sanitize;

pub use heartbeat::{HeartbeatGuard, ProgressEvent, ProgressHeartbeat, ProgressTracker};
pub use log::{LogEvent, LogEventKind, StructuredLog};
