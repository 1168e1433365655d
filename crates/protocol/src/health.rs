//! The daemon health file.
//!
//! Rewritten every 10 seconds by the daemon, read by the shim to decide
//! whether the daemon is up (fresh = written less than 20 seconds ago).

use serde::{Deserialize, Serialize};

/// How often the daemon rewrites the health file.
pub const WRITE_INTERVAL_SECS: u64 = 10;

/// Maximum age before the shim considers the daemon down.
pub const FRESHNESS_SECS: i64 = 20;

/// Contents of `ws_daemon.health.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthFile {
    pub pid: u32,
    pub sessions: usize,
    pub uptime_s: u64,
    /// Unix seconds at write time.
    pub ts: i64,
}

impl HealthFile {
    /// Whether this snapshot is recent enough to trust, given the current
    /// unix time.
    pub fn is_fresh(&self, now_unix: i64) -> bool {
        now_unix - self.ts < FRESHNESS_SECS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freshness_boundary() {
        let hf = HealthFile { pid: 1, sessions: 0, uptime_s: 5, ts: 1_000 };
        assert!(hf.is_fresh(1_000 + FRESHNESS_SECS - 1));
        assert!(!hf.is_fresh(1_000 + FRESHNESS_SECS));
    }

    #[test]
    fn roundtrip() {
        let hf = HealthFile { pid: 42, sessions: 3, uptime_s: 60, ts: 1_700_000_000 };
        let json = serde_json::to_string(&hf).unwrap();
        let parsed: HealthFile = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.pid, 42);
        assert_eq!(parsed.sessions, 3);
    }
}
