//! Shared daemon state.
//!
//! One instance of each component, constructed at startup and injected into
//! every connection handler.  Each component owns its lock; locks are never
//! nested across component boundaries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use exai_domain::timeouts::TimeoutSet;
use exai_protocol::WsMessage;
use exai_providers::ProviderRegistry;
use exai_resilience::{Degrader, ExpertDedup};
use exai_sessions::SessionManager;
use exai_telemetry::{ProgressTracker, StructuredLog};
use exai_tools::ToolRegistry;

use crate::auth::TokenGate;
use crate::config::DaemonConfig;
use crate::permits::PermitGate;

/// Outbound message queues keyed by session id, for progress delivery and
/// the shutdown broadcast.
#[derive(Default)]
pub struct OutboundRegistry {
    senders: Mutex<HashMap<String, mpsc::Sender<WsMessage>>>,
}

impl OutboundRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session_id: &str, sender: mpsc::Sender<WsMessage>) {
        self.senders.lock().insert(session_id.to_owned(), sender);
    }

    pub fn remove(&self, session_id: &str) {
        self.senders.lock().remove(session_id);
    }

    /// Deliver a terminal message, waiting for queue capacity.  Dropped only
    /// when the session is gone.
    pub async fn send_to(&self, session_id: &str, message: WsMessage) {
        let sender = self.senders.lock().get(session_id).cloned();
        if let Some(sender) = sender {
            if sender.send(message).await.is_err() {
                tracing::debug!(session_id, "session outbound queue closed, dropping message");
            }
        }
    }

    /// Best-effort delivery for progress frames; a full or closed queue
    /// drops the message (delivery is not exactly-once).
    pub fn try_send_to(&self, session_id: &str, message: WsMessage) {
        let sender = self.senders.lock().get(session_id).cloned();
        if let Some(sender) = sender {
            if sender.try_send(message).is_err() {
                tracing::debug!(session_id, "outbound queue full or closed, dropping progress");
            }
        }
    }

    /// Best-effort fan-out to every connected session.
    pub fn broadcast(&self, message: &WsMessage) {
        let senders: Vec<mpsc::Sender<WsMessage>> =
            self.senders.lock().values().cloned().collect();
        for sender in senders {
            let _ = sender.try_send(message.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.senders.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.lock().is_empty()
    }
}

/// Everything a connection handler needs, cheap to clone.
#[derive(Clone)]
pub struct DaemonState {
    pub config: Arc<DaemonConfig>,
    pub timeouts: TimeoutSet,
    pub sessions: Arc<SessionManager>,
    pub tools: Arc<ToolRegistry>,
    pub providers: Arc<ProviderRegistry>,
    pub degrader: Arc<Degrader>,
    pub dedup: Arc<ExpertDedup>,
    pub event_log: Arc<StructuredLog>,
    pub tracker: Arc<ProgressTracker>,
    pub permits: Arc<PermitGate>,
    pub outbound: Arc<OutboundRegistry>,
    pub auth: Arc<TokenGate>,
    pub admin_auth: Arc<TokenGate>,
    /// Cancelled when the daemon begins graceful shutdown.
    pub shutdown: CancellationToken,
    pub started_at: Instant,
}

impl DaemonState {
    pub fn uptime_s(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
