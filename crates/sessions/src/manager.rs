//! Daemon-owned session table.
//!
//! Each connected client maps to one [`Session`] tracking creation and
//! last-activity times.  The table is capped at `max_concurrent` entries;
//! idle sessions expire after `session_timeout` and are reaped by the
//! periodic sweep.  All mutations go through the manager's lock — callers
//! only ever see cloned snapshots, never live table references.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::time::Instant;

use exai_domain::error::{Error, Result};

/// Session-table limits, loaded once at startup.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Idle time after which a session is considered timed out.
    pub session_timeout: Duration,
    /// Hard cap on table size.
    pub max_concurrent: usize,
    /// Period of the cleanup sweep.
    pub cleanup_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(3_600),
            max_concurrent: 100,
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

impl SessionConfig {
    pub fn load_env() -> Self {
        Self::load_from(|name| std::env::var(name).ok())
    }

    pub fn load_from(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            session_timeout: lookup("SESSION_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse().ok())
                .filter(|&n: &u64| n > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.session_timeout),
            max_concurrent: lookup("SESSION_MAX_CONCURRENT")
                .and_then(|v| v.trim().parse().ok())
                .filter(|&n: &usize| n > 0)
                .unwrap_or(defaults.max_concurrent),
            cleanup_interval: lookup("SESSION_CLEANUP_INTERVAL")
                .and_then(|v| v.trim().parse().ok())
                .filter(|&n: &u64| n > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.cleanup_interval),
        }
    }
}

/// Snapshot of one session.  Cloned out of the table on every read.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    created: Instant,
    last_activity: Instant,
    pub closed: bool,
}

impl Session {
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    pub fn idle(&self) -> Duration {
        self.last_activity.elapsed()
    }
}

/// Aggregate table snapshot for health reporting.
#[derive(Debug, Clone, Default)]
pub struct SessionMetrics {
    pub total_sessions: usize,
    /// Sessions that are not timed out.
    pub active_sessions: usize,
    pub oldest_session_age: Duration,
    pub newest_session_age: Duration,
    pub avg_session_age: Duration,
}

/// The session table.  One instance per daemon.
pub struct SessionManager {
    config: SessionConfig,
    table: Mutex<HashMap<String, Session>>,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            table: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> SessionConfig {
        self.config
    }

    /// Create a session, minting a UUID when no id is given, or return the
    /// existing one.  Existing ids always succeed; a new id is rejected with
    /// [`Error::SessionLimitExceeded`] once the table is full.
    pub fn ensure(&self, id: Option<&str>) -> Result<Session> {
        let id = match id {
            Some(id) if !id.is_empty() => id.to_owned(),
            _ => uuid::Uuid::new_v4().to_string(),
        };

        let mut table = self.table.lock();
        if let Some(existing) = table.get(&id) {
            return Ok(existing.clone());
        }
        if table.len() >= self.config.max_concurrent {
            tracing::warn!(
                session_id = %id,
                limit = self.config.max_concurrent,
                "session table full, rejecting"
            );
            return Err(Error::SessionLimitExceeded(format!(
                "session table at capacity ({})",
                self.config.max_concurrent
            )));
        }

        let now = Instant::now();
        let session = Session {
            id: id.clone(),
            created_at: Utc::now(),
            created: now,
            last_activity: now,
            closed: false,
        };
        table.insert(id.clone(), session.clone());
        tracing::info!(session_id = %id, total = table.len(), "session created");
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.table.lock().get(id).cloned()
    }

    /// Stamp `last_activity = now`.  No-op when the session is missing.
    pub fn update_activity(&self, id: &str) {
        let mut table = self.table.lock();
        if let Some(session) = table.get_mut(id) {
            session.last_activity = Instant::now();
        }
    }

    /// Delete a session.  No-op when the session is missing.
    pub fn remove(&self, id: &str) {
        let mut table = self.table.lock();
        if table.remove(id).is_some() {
            tracing::info!(session_id = %id, remaining = table.len(), "session removed");
        }
    }

    pub fn list_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.table.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }

    /// Timed out iff closed or idle for at least `session_timeout`.
    pub fn is_timed_out(&self, session: &Session) -> bool {
        session.closed || session.idle() >= self.config.session_timeout
    }

    /// Remove every timed-out session.  Returns the removed count.
    pub fn cleanup_stale(&self) -> usize {
        let mut table = self.table.lock();
        let before = table.len();
        table.retain(|_, session| {
            !session.closed && session.last_activity.elapsed() < self.config.session_timeout
        });
        let removed = before - table.len();
        if removed > 0 {
            tracing::info!(removed, remaining = table.len(), "stale sessions cleaned up");
        }
        removed
    }

    pub fn metrics(&self) -> SessionMetrics {
        let table = self.table.lock();
        let total = table.len();
        if total == 0 {
            return SessionMetrics::default();
        }

        let mut active = 0;
        let mut oldest = Duration::ZERO;
        let mut newest = Duration::MAX;
        let mut sum = Duration::ZERO;
        for session in table.values() {
            let age = session.created.elapsed();
            oldest = oldest.max(age);
            newest = newest.min(age);
            sum += age;
            if !session.closed && session.last_activity.elapsed() < self.config.session_timeout {
                active += 1;
            }
        }

        SessionMetrics {
            total_sessions: total,
            active_sessions: active,
            oldest_session_age: oldest,
            newest_session_age: newest,
            avg_session_age: sum / total as u32,
        }
    }
}
