//! Shim configuration, read once at startup from the environment.

use std::path::PathBuf;

use exai_domain::error::Result;
use exai_domain::paths;
use exai_domain::timeouts::TimeoutSet;

#[derive(Debug, Clone)]
pub struct ShimConfig {
    pub daemon_host: String,
    pub daemon_port: u16,
    pub token: Option<String>,
    /// Spawn the daemon when the health file is missing or stale.
    pub autostart: bool,
    pub log_dir: PathBuf,
    pub timeouts: TimeoutSet,
}

impl ShimConfig {
    pub fn load_env() -> Result<Self> {
        Self::load_from(|name| std::env::var(name).ok())
    }

    pub fn load_from(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let timeouts = TimeoutSet::load_from(&lookup)?;
        Ok(Self {
            daemon_host: lookup("EXAI_WS_HOST")
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| "127.0.0.1".to_owned()),
            daemon_port: lookup("EXAI_WS_PORT")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(8765),
            token: lookup("EXAI_WS_TOKEN").filter(|v| !v.is_empty()),
            autostart: lookup("EXAI_WS_AUTOSTART")
                .map(|v| !matches!(v.trim().to_ascii_lowercase().as_str(), "false" | "0" | "no"))
                .unwrap_or(true),
            log_dir: paths::log_dir_from(&lookup),
            timeouts,
        })
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}/ws", self.daemon_host, self.daemon_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = ShimConfig::load_from(|_| None).unwrap();
        assert_eq!(cfg.ws_url(), "ws://127.0.0.1:8765/ws");
        assert!(cfg.autostart);
        assert!(cfg.token.is_none());
    }

    #[test]
    fn autostart_disabled_by_falsey_values() {
        for value in ["false", "0", "no", "FALSE"] {
            let cfg = ShimConfig::load_from(|name| {
                (name == "EXAI_WS_AUTOSTART").then(|| value.to_string())
            })
            .unwrap();
            assert!(!cfg.autostart, "{value} should disable autostart");
        }
    }
}
