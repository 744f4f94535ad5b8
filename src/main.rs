mod child;
mod config;
mod event_source;
mod signals;
mod supervisor;

use clap::Parser;
use config::{RelaunchConfig, DEFAULT_CONFIG_FILE};
use event_source::{EventSource, WatchHandle};
use signals::SignalRelay;
use std::path::PathBuf;
use std::process::ExitCode;
use supervisor::{Supervisor, SupervisorExit};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// Watch a path and restart a command every time something under it is
/// modified. SIGINT kills the command's whole process group before exiting.
#[derive(Parser, Debug)]
#[command(name = "relaunch", version, about)]
pub struct Cli {
    /// Path to watch (default: from config, else the current directory)
    #[arg(short, long)]
    path: Option<PathBuf>,

    /// Config file path [default: relaunch.toml]
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Extra logging (kills, group sweeps, raw events)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Print the resolved settings and exit
    #[arg(long)]
    dry_run: bool,

    /// Command to supervise, followed by its arguments
    #[arg(value_name = "COMMAND", trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn init_logging(cli: &Cli) {
    let default_filter = if cli.verbose {
        "relaunch=debug"
    } else if cli.quiet {
        "relaunch=warn"
    } else {
        "relaunch=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);
    tracing::debug!(?cli, "parsed CLI arguments");

    let (config_path, required) = match &cli.config {
        Some(path) => (path.clone(), true),
        None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
    };
    let mut config = match RelaunchConfig::load(&config_path, required) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    config.apply_overrides(cli.path.clone(), cli.command.clone());

    if config.process.command.is_empty() {
        tracing::error!("no command to supervise; pass one after `--`");
        return ExitCode::FAILURE;
    }

    if cli.dry_run {
        println!("relaunch v{}", env!("CARGO_PKG_VERSION"));
        println!("Config file: {}", config_path.display());
        println!("Watch path: {}", config.watch.path.display());
        println!("Command: {:?}", config.process.command);
        println!("On clean exit: {}", config.process.on_clean_exit);
        println!("Capture stdout: {}", config.process.capture_stdout);
        return ExitCode::SUCCESS;
    }

    run(config).await
}

async fn run(config: RelaunchConfig) -> ExitCode {
    match std::env::current_dir() {
        Ok(cwd) => tracing::debug!(cwd = %cwd.display(), "working directory"),
        Err(e) => tracing::warn!(error = %e, "cannot read working directory"),
    }
    tracing::info!(path = %config.watch.path.display(), "watching");

    let handle = match WatchHandle::new(&config.watch.path) {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    // Capacity 1: at most one change waits while the current child is reaped.
    let (commands, inbox) = mpsc::channel(1);

    let relay = match SignalRelay::install(commands.clone()) {
        Ok(relay) => relay,
        Err(e) => {
            tracing::error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let relay_task = tokio::spawn(async move {
        let code = relay.run().await;
        std::process::exit(code.into());
    });

    let mut source_task = tokio::spawn(EventSource::new(handle).run(commands));
    let supervisor = Supervisor::new(config.process, inbox);

    // Dropping the supervisor future mid-run kills the current child's group.
    let result = tokio::select! {
        result = supervisor.run() => result,
        joined = &mut source_task => {
            match joined {
                Ok(Ok(())) => tracing::error!("event source stopped unexpectedly"),
                Ok(Err(e)) => tracing::error!("{e}"),
                Err(e) => tracing::error!(error = %e, "event source task failed"),
            }
            return ExitCode::FAILURE;
        }
    };

    match result {
        Ok(SupervisorExit::Shutdown { restarts }) => {
            tracing::debug!(restarts, "supervisor stopped, handing exit to signal relay");
            // The relay exits the process once it sees the acknowledgement.
            if let Err(e) = relay_task.await {
                tracing::error!(error = %e, "signal relay task failed");
            }
            ExitCode::from(signals::SHUTDOWN_EXIT_CODE)
        }
        Ok(SupervisorExit::ChildFinished { restarts }) => {
            tracing::error!(restarts, "command finished");
            ExitCode::FAILURE
        }
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
