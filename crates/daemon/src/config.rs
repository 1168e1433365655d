//! Daemon configuration, read once at startup from the environment.

use std::path::PathBuf;

use exai_domain::paths;
use exai_providers::ProviderLimits;

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub host: String,
    pub port: u16,
    /// In-flight tool calls per session.
    pub session_max_inflight: usize,
    /// In-flight tool calls across the daemon.
    pub global_max_inflight: usize,
    pub provider_limits: ProviderLimits,
    pub log_dir: PathBuf,
    /// Current bearer token.  `None` disables auth (dev mode).
    pub token: Option<String>,
    /// Previous token, accepted during rotation.
    pub previous_token: Option<String>,
    /// Token required for the `shutdown` op.
    pub admin_token: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 8765,
            session_max_inflight: 6,
            global_max_inflight: 16,
            provider_limits: ProviderLimits::default(),
            log_dir: PathBuf::from("logs"),
            token: None,
            previous_token: None,
            admin_token: None,
        }
    }
}

impl DaemonConfig {
    pub fn load_env() -> Self {
        Self::load_from(|name| std::env::var(name).ok())
    }

    pub fn load_from(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            host: lookup("EXAI_WS_HOST")
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.host),
            port: lookup("EXAI_WS_PORT")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.port),
            session_max_inflight: lookup("EXAI_WS_SESSION_MAX_INFLIGHT")
                .and_then(|v| v.trim().parse().ok())
                .filter(|&n: &usize| n > 0)
                .unwrap_or(defaults.session_max_inflight),
            global_max_inflight: lookup("EXAI_WS_GLOBAL_MAX_INFLIGHT")
                .and_then(|v| v.trim().parse().ok())
                .filter(|&n: &usize| n > 0)
                .unwrap_or(defaults.global_max_inflight),
            provider_limits: ProviderLimits::load_from(&lookup),
            log_dir: paths::log_dir_from(&lookup),
            token: lookup("EXAI_WS_TOKEN").filter(|v| !v.is_empty()),
            previous_token: lookup("EXAI_WS_TOKEN_PREVIOUS").filter(|v| !v.is_empty()),
            admin_token: lookup("EXAI_WS_ADMIN_TOKEN").filter(|v| !v.is_empty()),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = DaemonConfig::load_from(|_| None);
        assert_eq!(cfg.bind_addr(), "127.0.0.1:8765");
        assert_eq!(cfg.session_max_inflight, 6);
        assert_eq!(cfg.global_max_inflight, 16);
        assert!(cfg.token.is_none());
    }

    #[test]
    fn env_overrides_apply() {
        let cfg = DaemonConfig::load_from(|name| match name {
            "EXAI_WS_HOST" => Some("0.0.0.0".into()),
            "EXAI_WS_PORT" => Some("9100".into()),
            "EXAI_WS_SESSION_MAX_INFLIGHT" => Some("2".into()),
            "EXAI_WS_TOKEN" => Some("tok".into()),
            _ => None,
        });
        assert_eq!(cfg.bind_addr(), "0.0.0.0:9100");
        assert_eq!(cfg.session_max_inflight, 2);
        assert_eq!(cfg.token.as_deref(), Some("tok"));
    }
}
