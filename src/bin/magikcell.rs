//! # magikcell - Attach Backchannel Daemon
//!
//! Listens for backchannels dialled by container VMs and keeps their
//! interactive sessions available until shutdown.
//!
//! ```text
//! magikcell [--config FILE] [--listen HOST:PORT] [--vsock-port PORT] [--debug]
//! ```
//!
//! Settings resolve as: defaults, then `--config`, then flags. Every setting
//! flag falls back to its `MAGIKCELL_*` variable (see [`Overrides`]).
//! `RUST_LOG` overrides the log level.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use magikcell::attach::{Listener, SshProtocol, TcpListener};
use magikcell::config::Overrides;
use magikcell::{Config, Connector};

#[derive(Debug, Parser)]
#[command(name = "magikcell")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file.
    #[arg(long, env = "MAGIKCELL_CONFIG")]
    config: Option<PathBuf>,

    /// Listen on vsock (any CID) at this port instead of TCP.
    #[cfg(target_os = "linux")]
    #[arg(long)]
    vsock_port: Option<u32>,

    #[command(flatten)]
    overrides: Overrides,
}

fn load_config(args: &Args) -> magikcell::Result<Config> {
    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    }
    .apply(&args.overrides);
    config.validate()?;
    Ok(config)
}

async fn bind(args: &Args, config: &Config) -> std::io::Result<Arc<dyn Listener>> {
    #[cfg(target_os = "linux")]
    if let Some(port) = args.vsock_port {
        let listener = magikcell::attach::VsockListener::bind(libc::VMADDR_CID_ANY, port)?;
        return Ok(Arc::new(listener));
    }
    let _ = args;
    Ok(Arc::new(TcpListener::bind(&config.attach_addr).await?))
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("magikcell={}", config.log_level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        "magikcell starting"
    );

    let listener = match bind(&args, &config).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind attach listener: {e}");
            return ExitCode::FAILURE;
        }
    };

    let connector = Connector::from_config(
        listener,
        Arc::new(SshProtocol::new(config.debug)),
        &config,
    );
    info!(url = %connector.url(), "attach connector ready");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to wait for shutdown signal: {e}");
    }

    info!(sessions = connector.ids().len(), "shutting down");
    connector.stop().await;
    ExitCode::SUCCESS
}
