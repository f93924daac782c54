mod backends;
mod backoff;
mod cli;
mod config;
mod db;
mod engine;
mod error;
mod github;
mod home;
mod llm;
mod template;
#[cfg(test)]
mod testing;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};

#[derive(Parser)]
#[command(
    name = "sdlc-orch",
    version,
    about = "sdlc-orch: issue-driven plan, code, CI and review pipeline"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the orchestrator service
    Serve,
    /// Run one poll cycle and wait for the agents it starts
    Tick,
    /// Show version information
    Version,
    /// Read config values
    Config {
        /// Config key (dot-separated path)
        key: String,
    },
    /// Inspect tracked tasks
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },
    /// Generate shell completions
    Completions {
        /// Shell type
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum TaskAction {
    /// List tracked tasks
    List {
        /// Filter by phase (e.g. plan-ready, awaiting_ci)
        #[arg(long)]
        phase: Option<String>,
    },
    /// Show task details
    Show {
        /// Repository in OWNER/REPO format
        repo: String,
        /// Issue number
        number: u64,
    },
    /// Show the phase transitions of a task
    History {
        /// Repository in OWNER/REPO format
        repo: String,
        /// Issue number
        number: u64,
    },
    /// Count tasks per phase
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("sdlc_orch=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve => {
            tracing::info!("starting sdlc-orch serve");
            engine::serve().await?;
        }
        Commands::Tick => {
            cli::tick().await?;
        }
        Commands::Version => {
            cli::version();
        }
        Commands::Config { key } => {
            cli::config_get(&key)?;
        }
        Commands::Task { action } => match action {
            TaskAction::List { phase } => {
                cli::task::list(phase).await?;
            }
            TaskAction::Show { repo, number } => {
                cli::task::show(&repo, number).await?;
            }
            TaskAction::History { repo, number } => {
                cli::task::history(&repo, number).await?;
            }
            TaskAction::Status { json } => {
                cli::task::status(json).await?;
            }
        },
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "sdlc-orch", &mut std::io::stdout());
        }
    }

    Ok(())
}
