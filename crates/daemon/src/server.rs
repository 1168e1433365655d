//! Daemon assembly and lifecycle: state construction, background tasks,
//! and graceful shutdown.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use exai_domain::error::Result;
use exai_domain::timeouts::TimeoutSet;
use exai_protocol::WsMessage;
use exai_providers::ProviderRegistry;
use exai_resilience::{CircuitBreaker, CircuitConfig, Degrader, ExpertDedup};
use exai_sessions::{SessionConfig, SessionManager};
use exai_telemetry::{ProgressTracker, StructuredLog};
use exai_tools::ToolRegistry;

use crate::auth::TokenGate;
use crate::config::DaemonConfig;
use crate::health;
use crate::state::{DaemonState, OutboundRegistry};
use crate::ws;

/// Wire one instance of every component into a [`DaemonState`].
pub fn build_state(
    config: DaemonConfig,
    timeouts: TimeoutSet,
    session_config: SessionConfig,
    circuit_config: CircuitConfig,
    tools: ToolRegistry,
    providers: ProviderRegistry,
) -> DaemonState {
    let auth = TokenGate::new(&[
        config.token.as_deref(),
        config.previous_token.as_deref(),
    ]);
    if !auth.enabled() {
        tracing::warn!("EXAI_WS_TOKEN is not set — client auth DISABLED (dev mode)");
    }
    let admin_auth = TokenGate::new(&[config.admin_token.as_deref()]);

    let permits = crate::permits::PermitGate::new(
        config.session_max_inflight,
        config.global_max_inflight,
        config.provider_limits,
    );
    let event_log = StructuredLog::new(&config.log_dir);

    DaemonState {
        timeouts,
        sessions: Arc::new(SessionManager::new(session_config)),
        tools: Arc::new(tools),
        providers: Arc::new(providers),
        degrader: Arc::new(Degrader::new(Arc::new(CircuitBreaker::new(circuit_config)))),
        dedup: Arc::new(ExpertDedup::new()),
        event_log: Arc::new(event_log),
        tracker: Arc::new(ProgressTracker::new()),
        permits: Arc::new(permits),
        outbound: Arc::new(OutboundRegistry::new()),
        auth: Arc::new(auth),
        admin_auth: Arc::new(admin_auth),
        shutdown: CancellationToken::new(),
        started_at: Instant::now(),
        config: Arc::new(config),
    }
}

/// Serve until shutdown, then drain in-flight calls, flush the event log,
/// and remove the pid/health files.
pub async fn serve(state: DaemonState, listener: TcpListener) -> Result<()> {
    if let Err(e) = health::write_pid_file(&state.config.log_dir) {
        tracing::warn!(error = %e, "could not write pid file");
    }
    health::write_health_file(&state);

    tokio::spawn(health::run_health_writer(state.clone()));
    tokio::spawn(run_cleanup_sweep(state.clone()));

    let app = ws::router(state.clone());
    tracing::info!(
        addr = %state.config.bind_addr(),
        tools = state.tools.len(),
        providers = state.providers.len(),
        "daemon listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.clone()))
        .await?;

    drain_in_flight(&state).await;
    state.event_log.flush();
    health::remove_runtime_files(&state.config.log_dir);
    tracing::info!("daemon stopped cleanly");
    Ok(())
}

/// Stale-session sweep + permit-pool pruning, every `cleanup_interval`.
async fn run_cleanup_sweep(state: DaemonState) {
    let mut interval = tokio::time::interval(state.sessions.config().cleanup_interval);
    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            _ = interval.tick() => {
                let removed = state.sessions.cleanup_stale();
                state.permits.prune_idle_sessions();
                if removed > 0 {
                    tracing::debug!(removed, "cleanup sweep removed stale sessions");
                }
            }
        }
    }
}

/// Resolves when SIGINT/SIGTERM arrives or an admin `shutdown` op fires;
/// broadcasts the shutdown notice before tearing connections down.
async fn shutdown_signal(state: DaemonState) {
    tokio::select! {
        _ = interrupt() => tracing::info!("SIGINT received"),
        _ = terminate() => tracing::info!("SIGTERM received"),
        _ = state.shutdown.cancelled() => {}
    }

    state.outbound.broadcast(&WsMessage::Shutdown {
        token: None,
        reason: Some("daemon shutting down".to_owned()),
    });
    state.shutdown.cancel();
}

async fn interrupt() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "cannot listen for SIGINT");
        std::future::pending::<()>().await;
    }
}

async fn terminate() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    }
    #[cfg(not(unix))]
    std::future::pending::<()>().await;
}

/// Wait up to the daemon timeout for in-flight tool calls to finish.
async fn drain_in_flight(state: &DaemonState) {
    let deadline = Instant::now() + state.timeouts.daemon();
    loop {
        let in_flight = state.permits.global_in_use();
        if in_flight == 0 {
            return;
        }
        if Instant::now() >= deadline {
            tracing::warn!(in_flight, "drain deadline reached with calls still in flight");
            return;
        }
        tracing::debug!(in_flight, "draining in-flight calls");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
