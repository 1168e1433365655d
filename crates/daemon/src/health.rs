//! Health and pid files.
//!
//! The health file is rewritten every 10 seconds and is how the shim decides
//! whether a daemon is already running; the pid file is written once at
//! startup.  Both are removed on clean exit.

use std::path::Path;

use chrono::Utc;

use exai_domain::paths::{HEALTH_FILE, PID_FILE};
use exai_protocol::health::{HealthFile, WRITE_INTERVAL_SECS};

use crate::state::DaemonState;

pub fn write_pid_file(log_dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(log_dir)?;
    std::fs::write(log_dir.join(PID_FILE), format!("{}\n", std::process::id()))
}

pub fn remove_runtime_files(log_dir: &Path) {
    for name in [HEALTH_FILE, PID_FILE] {
        let path = log_dir.join(name);
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "could not remove runtime file");
            }
        }
    }
}

/// Rewrite the health file now.
pub fn write_health_file(state: &DaemonState) {
    let snapshot = HealthFile {
        pid: std::process::id(),
        sessions: state.sessions.len(),
        uptime_s: state.uptime_s(),
        ts: Utc::now().timestamp(),
    };
    let path = state.config.log_dir.join(HEALTH_FILE);
    let result = serde_json::to_string(&snapshot)
        .map_err(std::io::Error::other)
        .and_then(|json| std::fs::write(&path, json));
    if let Err(e) = result {
        tracing::warn!(path = %path.display(), error = %e, "health file write failed");
    }
}

/// Periodic health writer; runs until shutdown.
pub async fn run_health_writer(state: DaemonState) {
    let mut interval =
        tokio::time::interval(std::time::Duration::from_secs(WRITE_INTERVAL_SECS));
    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            _ = interval.tick() => write_health_file(&state),
        }
    }
}
