use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use exai_daemon::config::DaemonConfig;
use exai_daemon::server;
use exai_domain::timeouts::TimeoutSet;
use exai_providers::ProviderRegistry;
use exai_resilience::CircuitConfig;
use exai_sessions::SessionConfig;
use exai_tools::ToolRegistry;

/// The EXAI tool-orchestration daemon.
#[derive(Parser)]
#[command(name = "exai-daemon", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the WebSocket daemon (default).
    Serve,
    /// Print the daemon version.
    Version,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing();
            std::process::exit(run_serve().await);
        }
        Some(Command::Version) => {
            println!("exai-daemon {}", env!("CARGO_PKG_VERSION"));
        }
    }
}

/// Structured JSON diagnostics on stderr; the event log is separate.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,exai_daemon=debug")),
        )
        .json()
        .with_writer(std::io::stderr)
        .init();
}

/// Exit codes: 0 clean shutdown, 1 fatal config error, 2 bind failure.
async fn run_serve() -> i32 {
    let timeouts = match TimeoutSet::load_env() {
        Ok(timeouts) => timeouts,
        Err(e) => {
            tracing::error!(error = %e, "invalid timeout configuration");
            return 1;
        }
    };
    let config = DaemonConfig::load_env();
    let session_config = SessionConfig::load_env();
    let circuit_config = CircuitConfig::load_env();

    // Tool and provider registries are populated by builds that link the
    // concrete tool suite; the bare daemon serves an empty inventory.
    let tools = ToolRegistry::new();
    let providers = ProviderRegistry::new();
    if tools.is_empty() {
        tracing::warn!("no tools registered — call_tool will fail until a tool suite is linked");
    }

    let addr = config.bind_addr();
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "bind failed");
            return 2;
        }
    };

    let state = server::build_state(
        config,
        timeouts,
        session_config,
        circuit_config,
        tools,
        providers,
    );
    match server::serve(state, listener).await {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(error = %e, "daemon exited with error");
            1
        }
    }
}
