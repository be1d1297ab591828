use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "crucible")]
#[command(version, about = "Multi-approach AI implementation pipeline")]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = "crucible.yaml")]
    pub config: PathBuf,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a default configuration file
    Init {
        #[arg(short, long, default_value = "crucible.yaml")]
        output: PathBuf,
    },
    /// Run the pipeline for a planning spec
    Run {
        /// Path to the planning spec (markdown)
        #[arg(short, long)]
        spec: PathBuf,
    },
    /// Approve a pending checkpoint, optionally rejecting some approaches
    Approve {
        task_id: String,
        /// Approach ids to reject (comma-separated)
        #[arg(long, value_delimiter = ',')]
        reject: Vec<usize>,
    },
    /// Request a revision at a pending checkpoint
    Revise {
        task_id: String,
        #[arg(short, long, default_value = "")]
        feedback: String,
    },
    /// Abort a task waiting at a checkpoint
    Abort { task_id: String },
    /// Answer any pending question by id
    Answer {
        task_id: String,
        question_id: String,
        response: String,
    },
    /// Show the status of one task, or list all tasks
    Status { task_id: Option<String> },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    match cli.command {
        Commands::Init { output } => cmd::init(&output),
        Commands::Run { spec } => cmd::run(&cli.config, &spec).await,
        Commands::Approve { task_id, reject } => cmd::approve(&cli.config, &task_id, &reject),
        Commands::Revise { task_id, feedback } => cmd::revise(&cli.config, &task_id, &feedback),
        Commands::Abort { task_id } => cmd::abort(&cli.config, &task_id),
        Commands::Answer {
            task_id,
            question_id,
            response,
        } => cmd::answer(&cli.config, &task_id, &question_id, &response),
        Commands::Status { task_id } => cmd::status(&cli.config, task_id.as_deref()),
    }
}
