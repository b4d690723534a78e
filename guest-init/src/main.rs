//! Guest init for Firecracker VMs.
//!
//! Runs as PID 1. Startup sequence:
//! 1. Load and validate the run config
//! 2. Mount pseudo filesystems and configured volumes, set the hostname,
//!    write `/etc/hosts` and `/etc/resolv.conf`
//! 3. Start the workload
//! 4. Start the exec service on vsock port 1000
//! 5. Run the signal loop: forward SIGTERM/SIGINT to the workload and drain
//!    zombies on SIGCHLD
//!
//! The exec service and the zombie drain share one reap lock; see
//! `vsock_guest::reap`.

mod config;
mod init;
mod pid1;

use std::fmt;
use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;
use thiserror::Error;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;
use vsock_guest::{ExecService, Listener, ReapLock, ServeError};

use crate::config::{ConfigError, RunConfig};
use crate::init::InitError;
use crate::pid1::{Supervisor, SupervisorError};

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

#[derive(Parser)]
#[command(name = "guest-init", version)]
struct Cli {
    /// Run configuration file
    #[arg(long, env = "GUEST_INIT_CONFIG", default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Vsock port for the exec service
    #[arg(long, env = "GUEST_INIT_PORT", default_value_t = vsock_proto::VSOCK_PORT)]
    port: u32,

    /// Serve the exec service on this Unix socket instead of vsock
    #[arg(long, env = "GUEST_INIT_UNIX_SOCKET")]
    unix_socket: Option<PathBuf>,
}

#[derive(Debug, Error)]
enum Error {
    #[error("init error: {0}")]
    Init(#[from] InitError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("exec service error: {0}")]
    Serve(#[from] ServeError),

    #[error("supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "fatal");
            1
        }
    };
    // Blocking waiters of open sessions may still be parked in waitid;
    // exit without draining the runtime.
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), Error> {
    init::ensure_pid1()?;
    info!("running as PID 1");

    let config = RunConfig::load(&cli.config)?;
    config.validate()?;
    info!(
        config = %cli.config.display(),
        hostname = config.hostname(),
        "loaded configuration"
    );

    init::setup(&config)?;

    let reap = ReapLock::new();
    let listener = match &cli.unix_socket {
        Some(path) => Listener::unix(path)?,
        None => Listener::vsock(cli.port)?,
    };

    let workload = config.workload();
    info!(
        cmd = ?workload.command,
        user = %workload.user,
        dir = %workload.working_dir.display(),
        hostname = %workload.hostname,
        "starting workload"
    );
    let supervisor = Supervisor::start(&workload, reap.clone()).await?;

    let exec = ExecService::new(config.exec_env(), reap);
    tokio::spawn(vsock_guest::run(listener, exec));
    info!(port = cli.port, unix_socket = ?cli.unix_socket, "exec service started");

    let reason = supervisor.run().await?;
    info!(?reason, "init exiting");
    Ok(())
}
