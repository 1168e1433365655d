//! The three-level permit gate: per-session, global, and per-provider
//! semaphores, acquired in that order with a bounded wait.
//!
//! Permits release in reverse order when the [`PermitSet`] drops, on every
//! exit path of the holding call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use exai_domain::error::{Error, Result};
use exai_providers::{ProviderKind, ProviderLimits};

/// Held permits for one in-flight tool call.
///
/// Field order is drop order: provider first, then global, then session —
/// the reverse of acquisition.
#[derive(Debug)]
pub struct PermitSet {
    _provider: Option<OwnedSemaphorePermit>,
    _global: OwnedSemaphorePermit,
    _session: OwnedSemaphorePermit,
}

pub struct PermitGate {
    session_limit: usize,
    sessions: Mutex<HashMap<String, Arc<Semaphore>>>,
    global: Arc<Semaphore>,
    global_limit: usize,
    providers: HashMap<ProviderKind, Arc<Semaphore>>,
}

impl PermitGate {
    pub fn new(
        session_limit: usize,
        global_limit: usize,
        provider_limits: ProviderLimits,
    ) -> Self {
        let providers = ProviderKind::ALL
            .iter()
            .map(|&kind| {
                (
                    kind,
                    Arc::new(Semaphore::new(provider_limits.for_kind(kind))),
                )
            })
            .collect();
        Self {
            session_limit,
            sessions: Mutex::new(HashMap::new()),
            global: Arc::new(Semaphore::new(global_limit)),
            global_limit,
            providers,
        }
    }

    /// Acquire session → global → provider permits, each waiting at most
    /// `wait`.  A miss at any level fails with [`Error::Overloaded`] and
    /// drops whatever was already held.
    pub async fn acquire(
        &self,
        session_id: &str,
        provider: Option<ProviderKind>,
        wait: Duration,
    ) -> Result<PermitSet> {
        let session_sem = {
            let mut sessions = self.sessions.lock();
            sessions
                .entry(session_id.to_owned())
                .or_insert_with(|| Arc::new(Semaphore::new(self.session_limit)))
                .clone()
        };

        let session = acquire_bounded(&session_sem, wait, "session").await?;
        let global = acquire_bounded(&self.global, wait, "global").await?;
        let provider_permit = match provider {
            Some(kind) => {
                // Registered at construction for every known kind.
                let sem = self.providers.get(&kind).ok_or_else(|| {
                    Error::Internal(format!("no permit pool for provider {kind}"))
                })?;
                Some(acquire_bounded(sem, wait, kind.as_str()).await?)
            }
            None => None,
        };

        Ok(PermitSet {
            _provider: provider_permit,
            _global: global,
            _session: session,
        })
    }

    /// Tool calls currently holding a global permit.
    pub fn global_in_use(&self) -> usize {
        self.global_limit - self.global.available_permits()
    }

    /// Drop session pools with no permits outstanding.
    pub fn prune_idle_sessions(&self) {
        let mut sessions = self.sessions.lock();
        sessions.retain(|_, sem| sem.available_permits() < self.session_limit);
    }

    pub fn tracked_sessions(&self) -> usize {
        self.sessions.lock().len()
    }
}

async fn acquire_bounded(
    sem: &Arc<Semaphore>,
    wait: Duration,
    gate: &str,
) -> Result<OwnedSemaphorePermit> {
    match tokio::time::timeout(wait, sem.clone().acquire_owned()).await {
        Ok(Ok(permit)) => Ok(permit),
        Ok(Err(_)) => Err(Error::Internal(format!("{gate} permit pool closed"))),
        Err(_) => {
            tracing::warn!(gate, wait_s = wait.as_secs_f64(), "permit wait exceeded");
            Err(Error::Overloaded(format!(
                "no {gate} capacity within {:.1}s",
                wait.as_secs_f64()
            )))
        }
    }
}
