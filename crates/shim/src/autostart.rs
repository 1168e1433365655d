//! Daemon liveness detection and auto-start.
//!
//! The daemon rewrites its health file every 10 seconds; a file younger
//! than 20 seconds means the daemon is up.  When it is missing or stale and
//! auto-start is enabled, the shim spawns `exai-daemon` detached and polls
//! until the health file appears.

use std::path::Path;
use std::time::Duration;

use chrono::Utc;

use exai_domain::error::{Error, Result};
use exai_domain::paths::HEALTH_FILE;
use exai_protocol::health::HealthFile;

use crate::config::ShimConfig;

/// How long to poll for the health file after spawning the daemon.
const SPAWN_WAIT: Duration = Duration::from_secs(15);
const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub fn read_health_file(log_dir: &Path) -> Option<HealthFile> {
    let raw = std::fs::read_to_string(log_dir.join(HEALTH_FILE)).ok()?;
    serde_json::from_str(&raw).ok()
}

/// Whether a fresh health file says the daemon is up.
pub fn daemon_is_up(log_dir: &Path) -> bool {
    read_health_file(log_dir)
        .map(|hf| hf.is_fresh(Utc::now().timestamp()))
        .unwrap_or(false)
}

/// Make sure a daemon is running, spawning one if allowed.
pub async fn ensure_daemon(config: &ShimConfig) -> Result<()> {
    if daemon_is_up(&config.log_dir) {
        return Ok(());
    }
    if !config.autostart {
        return Err(Error::DaemonUnreachable(
            "daemon is down and EXAI_WS_AUTOSTART is disabled".into(),
        ));
    }

    spawn_daemon()?;

    let deadline = tokio::time::Instant::now() + SPAWN_WAIT;
    while tokio::time::Instant::now() < deadline {
        if daemon_is_up(&config.log_dir) {
            tracing::info!("daemon is up");
            return Ok(());
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    Err(Error::DaemonUnreachable(format!(
        "daemon did not become healthy within {}s of spawning",
        SPAWN_WAIT.as_secs()
    )))
}

/// Spawn `exai-daemon serve` detached, inheriting the environment.  The
/// binary resolves from `EXAI_DAEMON_BIN`, then a sibling of this
/// executable, then `PATH`.
fn spawn_daemon() -> Result<()> {
    let binary = std::env::var("EXAI_DAEMON_BIN")
        .ok()
        .filter(|v| !v.is_empty())
        .or_else(|| {
            let sibling = std::env::current_exe().ok()?.with_file_name("exai-daemon");
            sibling.exists().then(|| sibling.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| "exai-daemon".to_owned());

    tracing::info!(binary = %binary, "auto-starting daemon");
    let child = std::process::Command::new(&binary)
        .arg("serve")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .map_err(|e| {
            Error::DaemonUnreachable(format!("cannot spawn {binary}: {e}"))
        })?;
    tracing::info!(pid = child.id(), "daemon spawned");
    Ok(())
}
