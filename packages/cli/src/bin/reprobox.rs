use clap::{Parser, Subcommand};
use colored::*;
use std::process;

mod cli;

use cli::jobs::JobArgs;

#[derive(Parser)]
#[command(name = "reprobox")]
#[command(about = "Reprobox - reproduce research code in locked-down containers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker pool until interrupted
    Worker {
        /// Number of concurrent workers (overrides REPROBOX_WORKER_COUNT)
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Queue a repository for reproduction
    Submit {
        /// Git URL or file:// path of the repository
        repo_url: String,
        /// Command to run inside the container
        #[arg(short, long)]
        command: Option<String>,
        /// Paper identifier to record with the job
        #[arg(short, long)]
        paper_id: Option<String>,
        /// Wait until the job reaches a terminal state
        #[arg(long)]
        wait: bool,
    },
    /// Show the status of a job
    Status(JobArgs),
    /// List the artifacts generated for a job
    Artifacts(JobArgs),
    /// Request cancellation of a job
    Cancel {
        /// Job ID
        job_id: String,
    },
    /// List recent jobs
    List {
        /// Only show jobs in this state (pending, running, completed, failed)
        #[arg(short, long)]
        status: Option<String>,
        /// Maximum number of jobs to show
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },
    /// Report running jobs that have exceeded the stuck grace period
    Stuck,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    reprobox_cli::init_tracing(reprobox_cli::LogFormat::from_env());

    let cli = Cli::parse();

    if let Err(e) = handle_command(cli.command).await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        process::exit(1);
    }
}

async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Worker { workers } => cli::worker::run(workers).await,
        Commands::Submit {
            repo_url,
            command,
            paper_id,
            wait,
        } => cli::jobs::submit(&repo_url, command, paper_id, wait).await,
        Commands::Status(args) => cli::jobs::status(&args).await,
        Commands::Artifacts(args) => cli::jobs::artifacts(&args).await,
        Commands::Cancel { job_id } => cli::jobs::cancel(&job_id).await,
        Commands::List { status, limit } => cli::jobs::list(status.as_deref(), limit).await,
        Commands::Stuck => cli::jobs::stuck().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_submit_arguments() {
        let cli = Cli::try_parse_from([
            "reprobox",
            "submit",
            "https://github.com/example/paper",
            "--command",
            "python train.py",
            "--wait",
        ])
        .unwrap();
        match cli.command {
            Commands::Submit {
                repo_url,
                command,
                paper_id,
                wait,
            } => {
                assert_eq!(repo_url, "https://github.com/example/paper");
                assert_eq!(command.as_deref(), Some("python train.py"));
                assert_eq!(paper_id, None);
                assert!(wait);
            }
            _ => panic!("expected submit"),
        }
    }
}
