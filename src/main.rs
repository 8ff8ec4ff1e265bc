use anyhow::{Context as _, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use udprelayd::config::Config;
use udprelayd::daemon;
use udprelayd::server::Server;

/// Deduplicating multi-path UDP relay daemon.
///
/// Datagrams received on the outward endpoint are replicated over every
/// configured relay path; datagrams received from relay paths are
/// deduplicated and forwarded outward. Delivery succeeds as long as at least
/// one path gets the copy through.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Fork into the background once all sockets are set up.
    #[arg(short, long)]
    detach: bool,

    /// Write the daemon's PID to this file (only used together with --detach).
    #[arg(short, long, value_name = "PATH")]
    pidfile: Option<PathBuf>,

    /// Path to the configuration file.
    config: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load(&cli.config)
        .with_context(|| format!("failed to load `{}`", cli.config.display()))?;

    let mut server = Server::new(&config)?;

    if cli.detach {
        daemon::detach(cli.pidfile.as_deref()).context("failed to detach from the terminal")?;
    }

    let handle = server.shutdown_handle();
    ctrlc::set_handler(move || handle.shutdown())
        .context("failed to install termination handler")?;

    server.run()
}
