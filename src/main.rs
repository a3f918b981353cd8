use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod build;
mod cli;
mod db;
mod logs;
mod server;
mod task;

use cli::backend::{self, BackendCommands};
use cli::tail::handle_tail;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(flatten)]
    Backend(BackendCommands),
    /// Follow a task's log until it completes
    #[command(visible_alias = "logs")]
    Tail {
        /// Task ID
        task_id: String,
        /// Read logs from this directory instead of the configured one
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Backend(cmd) => backend::handle_backend_command(cmd).await,
        Commands::Tail { task_id, log_dir } => handle_tail(&task_id, log_dir).await,
    }
}
