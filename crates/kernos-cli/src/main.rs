//! `kernos` – command line interface and process entry points.
//!
//! User-facing commands (`start`, `stop`, `restart`, `status`, `watch`,
//! `kernel restart`, `config`) talk to the running system through the
//! persisted state under `~/.kernos` and the host's loopback control
//! endpoint.  Two hidden commands are the long-running processes themselves:
//!
//! * `supervise` – the process supervisor that `start` spawns detached.  It
//!   relaunches the host after crashes unless the kill switch is set.
//! * `host` – the application host that boots and supervises the kernels.

mod commands;
mod config;
mod state;
mod supervisor;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use kernos_middleware::EventJournal;
use kernos_runtime::{Host, HostExit, init_tracing, shutdown_signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Paths;
use crate::state::{PidKind, StateStore};
use crate::supervisor::{HostLauncher, ProcessSupervisor, SupervisorExit};

#[derive(Parser, Debug)]
#[command(name = "kernos")]
#[command(version, about = "Boot and supervise a set of interdependent kernels", long_about = None)]
struct Cli {
    /// State directory (default: ~/.kernos)
    #[arg(long, global = true, env = "KERNOS_HOME")]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Clear the kill switch and start the supervisor in the background
    Start,

    /// Set the kill switch and shut everything down
    Stop,

    /// Stop, then start
    Restart,

    /// Show process state and every kernel's status
    Status {
        /// Machine-readable output
        #[arg(long)]
        json: bool,
    },

    /// Print supervision events from the journal
    Watch {
        /// Number of past events to show first
        #[arg(short = 'n', long, default_value = "20")]
        last: usize,

        /// Exit after printing past events
        #[arg(long)]
        no_follow: bool,

        /// One JSON object per line
        #[arg(long)]
        json: bool,
    },

    /// Operate on a single kernel
    #[command(subcommand)]
    Kernel(KernelCommands),

    /// Inspect or create the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),

    #[command(hide = true)]
    Supervise,

    #[command(hide = true)]
    Host,
}

#[derive(Subcommand, Debug)]
enum KernelCommands {
    /// Restart one kernel now and refill its restart budget
    Restart {
        /// Kernel id
        id: String,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print the effective configuration, environment overrides included
    Show,

    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let paths = Paths::resolve(cli.home.clone());

    // Interactive commands stay quiet unless RUST_LOG says otherwise.
    let (service, default_filter) = match cli.command {
        Commands::Host => ("kernos-host", "info"),
        Commands::Supervise => ("kernos-supervisor", "info"),
        _ => ("kernos-cli", "warn"),
    };
    let _guard = init_tracing(service, default_filter);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: cannot start async runtime: {e}", "error".red().bold());
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(run(cli.command, &paths)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}: {e:#}", "error".red().bold());
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands, paths: &Paths) -> Result<ExitCode> {
    let cfg = config::load_effective(paths)?;
    match command {
        Commands::Start => commands::start(paths, &cfg).await?,
        Commands::Stop => commands::stop(paths, &cfg).await?,
        Commands::Restart => commands::restart(paths, &cfg).await?,
        Commands::Status { json } => commands::status(paths, &cfg, json).await?,
        Commands::Watch { last, no_follow, json } => commands::watch(paths, last, !no_follow, json).await?,
        Commands::Kernel(KernelCommands::Restart { id }) => commands::restart_kernel(&cfg, &id).await?,
        Commands::Config(ConfigCommands::Show) => commands::config_show(paths, &cfg)?,
        Commands::Config(ConfigCommands::Init { force }) => commands::config_init(paths, force)?,
        Commands::Supervise => return supervise(paths, &cfg).await,
        Commands::Host => return Ok(host(paths, &cfg).await),
    }
    Ok(ExitCode::SUCCESS)
}

async fn supervise(paths: &Paths, cfg: &config::Config) -> Result<ExitCode> {
    let store = StateStore::new(paths);
    store.write_pid(PidKind::Supervisor, std::process::id())?;

    let exe = std::env::current_exe().context("Cannot locate the kernos executable")?;
    let journal = Arc::new(EventJournal::open(paths.events())?);
    let supervisor = ProcessSupervisor::new(
        HostLauncher::new(exe, paths.home().to_path_buf()),
        store.clone(),
        journal,
        cfg.supervisor_policy(),
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            cancel.cancel();
        });
    }

    let exit = supervisor.run(cancel).await;
    store.clear_pid(PidKind::Supervisor);
    let exit = exit?;
    info!(?exit, "supervisor exiting");
    Ok(match exit {
        SupervisorExit::ManualShutdown | SupervisorExit::Cancelled => ExitCode::SUCCESS,
        SupervisorExit::ConfigError | SupervisorExit::BudgetExhausted => ExitCode::FAILURE,
    })
}

async fn host(paths: &Paths, cfg: &config::Config) -> ExitCode {
    let settings = cfg.host_settings(paths.events());
    let exit = match Host::build(&settings) {
        Ok(host) => host.run(shutdown_signal()).await,
        Err(e) => {
            error!(error = %e, "invalid host configuration");
            HostExit::Config
        }
    };
    ExitCode::from(exit.code() as u8)
}
