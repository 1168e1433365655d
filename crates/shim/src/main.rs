use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use exai_domain::paths::SHIM_LOG_FILE;
use exai_shim::config::ShimConfig;
use exai_shim::server;

/// stdio MCP shim for the EXAI daemon.
#[derive(Parser)]
#[command(name = "exai-shim", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve MCP on stdio (default).
    Run,
    /// Print the shim version.
    Version,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Run) => std::process::exit(run().await),
        Some(Command::Version) => {
            println!("exai-shim {}", env!("CARGO_PKG_VERSION"));
        }
    }
}

/// Exit codes: 0 on clean stdio EOF, 1 on fatal error (bad config, daemon
/// unreachable after retries).
async fn run() -> i32 {
    let config = match ShimConfig::load_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("exai-shim: {e}");
            return 1;
        }
    };

    init_tracing(&config);
    tracing::info!(url = %config.ws_url(), autostart = config.autostart, "shim starting");

    match server::run(config).await {
        Ok(()) => {
            tracing::info!("clean stdio EOF, exiting");
            0
        }
        Err(e) => {
            tracing::error!(error = %e, "shim terminating");
            1
        }
    }
}

/// Plain-text diagnostics go to `<logdir>/ws_shim.log` — stdout carries the
/// MCP channel and must stay clean.
fn init_tracing(config: &ShimConfig) {
    let writer = open_log_file(config);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,exai_shim=debug"));

    match writer {
        Some(writer) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(move || writer.clone())
                .init();
        }
        None => {
            // Fall back to stderr rather than losing diagnostics.
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

fn open_log_file(config: &ShimConfig) -> Option<FileWriter> {
    if let Err(e) = std::fs::create_dir_all(&config.log_dir) {
        eprintln!("exai-shim: cannot create log dir: {e}");
        return None;
    }
    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(config.log_dir.join(SHIM_LOG_FILE))
    {
        Ok(file) => Some(FileWriter(Arc::new(file))),
        Err(e) => {
            eprintln!("exai-shim: cannot open log file: {e}");
            None
        }
    }
}

#[derive(Clone)]
struct FileWriter(Arc<std::fs::File>);

impl std::io::Write for FileWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        (&*self.0).write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        (&*self.0).flush()
    }
}
