//! Log-directory resolution shared by the daemon and the shim.
//!
//! Both processes must agree on where the health, pid, and event-log files
//! live, since the health file is the shim's mechanism for deciding whether
//! the daemon is up.

use std::path::PathBuf;

/// File names under the log directory.
pub const TOOLCALLS_FILE: &str = "toolcalls.jsonl";
pub const HEALTH_FILE: &str = "ws_daemon.health.json";
pub const PID_FILE: &str = "ws_daemon.pid";
pub const SHIM_LOG_FILE: &str = "ws_shim.log";

/// Resolve the log directory: `EXAI_LOG_DIR` or `./logs`.
pub fn log_dir() -> PathBuf {
    log_dir_from(|name| std::env::var(name).ok())
}

/// Resolve from an arbitrary variable source.
pub fn log_dir_from(lookup: impl Fn(&str) -> Option<String>) -> PathBuf {
    lookup("EXAI_LOG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("logs"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_relative_logs() {
        assert_eq!(log_dir_from(|_| None), PathBuf::from("logs"));
    }

    #[test]
    fn env_override_wins() {
        let dir = log_dir_from(|name| {
            (name == "EXAI_LOG_DIR").then(|| "/var/log/exai".to_string())
        });
        assert_eq!(dir, PathBuf::from("/var/log/exai"));
    }
}
