mod config;
mod run_cmd;

use std::path::PathBuf;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use config::{ConfigFile, RunOverrides, TripleshotConfig};

#[derive(Parser)]
#[command(name = "tripleshot", about = "Parallel triple-shot orchestration for LLM coding agents")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a tripleshot config file
    Init {
        /// Agent command to record (e.g. "claude -p")
        #[arg(long, default_value = "claude -p")]
        agent: String,
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Run a task with three parallel attempts and a judge
    Run {
        /// The task text handed to every attempt
        task: String,
        /// Repository to work in
        #[arg(long, default_value = ".")]
        repo: PathBuf,
        /// Gate each attempt behind an adversarial reviewer
        #[arg(long)]
        adversarial: bool,
        /// Approval threshold for adversarial review (1-10)
        #[arg(long)]
        min_score: Option<i32>,
        /// Adversarial round budget
        #[arg(long)]
        max_rounds: Option<u32>,
        /// Merge the winning branch without asking
        #[arg(long)]
        auto_approve: bool,
        /// Agent command override (e.g. "claude -p")
        #[arg(long)]
        agent_cmd: Option<String>,
        /// Base branch for worktrees and commit counting
        #[arg(long)]
        base_branch: Option<String>,
        /// Sentinel artifact poll interval in milliseconds
        #[arg(long, default_value_t = 500)]
        poll_interval_ms: u64,
    },
    /// Generate shell completions
    Completions {
        /// Target shell
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tripleshot=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Init { agent, force } => {
            let path = config::config_path();
            if path.exists() && !force {
                anyhow::bail!(
                    "config file already exists at {} (use --force to overwrite)",
                    path.display()
                );
            }
            let mut file = ConfigFile::default();
            file.agent.command = agent;
            config::save_config(&file)?;
            println!("Wrote {}", path.display());
            Ok(())
        }
        Commands::Run {
            task,
            repo,
            adversarial,
            min_score,
            max_rounds,
            auto_approve,
            agent_cmd,
            base_branch,
            poll_interval_ms,
        } => {
            let resolved = TripleshotConfig::resolve(&RunOverrides {
                agent_cmd,
                base_branch,
                adversarial,
                min_score,
                max_rounds,
                auto_approve,
            })?;
            run_cmd::run(
                run_cmd::RunArgs {
                    task,
                    repo,
                    poll_interval_ms,
                },
                resolved,
            )
            .await
        }
        Commands::Completions { shell } => {
            let mut command = Cli::command();
            let name = command.get_name().to_string();
            clap_complete::generate(shell, &mut command, name, &mut std::io::stdout());
            Ok(())
        }
    }
}
