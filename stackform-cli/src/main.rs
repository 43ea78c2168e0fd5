use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::process::ExitCode;

mod commands;

#[derive(Parser)]
#[command(name = "stackform")]
#[command(about = "Run compose stacks on an instance server", long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Flags shared by every command.
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Working directory holding the compose file
    #[arg(long, global = true, default_value = ".")]
    pub cwd: PathBuf,

    /// Compose file, relative to the working directory
    #[arg(short = 'f', long)]
    pub file: Option<PathBuf>,

    /// Stack name (defaults to COMPOSE_PROJECT_NAME, the file's `name`, or the directory name)
    #[arg(short = 'p', long, global = true)]
    pub project_name: Option<String>,

    /// Control-plane project
    #[arg(long, global = true)]
    pub project: Option<String>,

    /// Enable debug logging
    #[arg(short = 'd', long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create and start every service
    Up {
        /// Do not wait for cloud-init to finish
        #[arg(long)]
        no_wait: bool,

        /// Skip the pre-flight checks
        #[arg(long)]
        skip_checks: bool,
    },

    /// Stop and remove every service
    Down {
        /// Force the shutdown
        #[arg(short, long)]
        force: bool,

        /// Also delete the services' volumes
        #[arg(short, long)]
        volumes: bool,

        /// Shutdown timeout in seconds
        #[arg(short, long, default_value = "-1", allow_hyphen_values = true)]
        timeout: i64,
    },

    /// Start existing services
    Start {
        /// Wait for cloud-init to finish
        #[arg(long)]
        wait: bool,
    },

    /// Stop running services
    Stop {
        /// Save the runtime state
        #[arg(long)]
        stateful: bool,

        /// Force the shutdown
        #[arg(short, long)]
        force: bool,

        /// Shutdown timeout in seconds
        #[arg(short, long, default_value = "-1", allow_hyphen_values = true)]
        timeout: i64,
    },

    /// Restart every service
    Restart,

    /// Remove stopped services
    Rm {
        /// Stop and remove running services
        #[arg(short, long)]
        force: bool,

        /// Stop running services first
        #[arg(short, long)]
        stop: bool,

        /// Also delete the services' volumes
        #[arg(short, long)]
        volumes: bool,

        /// Shutdown timeout in seconds
        #[arg(short, long, default_value = "-1", allow_hyphen_values = true)]
        timeout: i64,
    },

    /// Snapshot every service
    Snapshot {
        /// Keep snapshots until deleted by hand
        #[arg(short, long)]
        noexpiry: bool,

        /// Include the runtime state
        #[arg(short, long)]
        stateful: bool,

        /// Snapshot volumes as well
        #[arg(short, long)]
        volumes: bool,
    },

    /// Export every service to backup archives
    Export {
        /// Export volumes as well
        #[arg(long)]
        volumes: bool,

        /// Export volumes only
        #[arg(long)]
        custom_volumes_only: bool,
    },

    /// Show the state of every service
    Info,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = stackform_core::init_observability(cli.global.verbose) {
        eprintln!("{} failed to initialize logging: {}", "warning:".yellow().bold(), e);
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let orch = commands::load(&cli.global)?;

    match cli.command {
        Commands::Up { no_wait, skip_checks } => {
            commands::lifecycle::up(&orch, !no_wait, skip_checks).await?;
        }

        Commands::Down { force, volumes, timeout } => {
            commands::lifecycle::down(&orch, force, volumes, timeout).await?;
        }

        Commands::Start { wait } => {
            commands::lifecycle::start(&orch, wait).await?;
        }

        Commands::Stop { stateful, force, timeout } => {
            commands::lifecycle::stop(&orch, stateful, force, timeout).await?;
        }

        Commands::Restart => {
            commands::lifecycle::restart(&orch).await?;
        }

        Commands::Rm { force, stop, volumes, timeout } => {
            commands::lifecycle::rm(&orch, force, stop, volumes, timeout).await?;
        }

        Commands::Snapshot { noexpiry, stateful, volumes } => {
            commands::backup::snapshot(&orch, noexpiry, stateful, volumes).await?;
        }

        Commands::Export { volumes, custom_volumes_only } => {
            commands::backup::export(&orch, volumes, custom_volumes_only).await?;
        }

        Commands::Info => {
            commands::info::info(&orch).await?;
        }
    }

    Ok(())
}
