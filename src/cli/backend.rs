use anyhow::Result;
use std::path::PathBuf;
use tracing::error;

use crate::server::settings::Settings;

#[derive(Debug, Clone, clap::Subcommand)]
pub enum BackendCommands {
    /// Start the HTTP control plane
    Serve,
    /// Check configuration for errors and unused options
    CheckConfig,
    /// Run a single task from its snapshot file
    #[command(hide = true)]
    Worker {
        /// Snapshot written by the dispatcher; removed once read
        #[arg(long)]
        task_file: PathBuf,
    },
}

pub async fn handle_backend_command(cmd: BackendCommands) -> Result<()> {
    match cmd {
        BackendCommands::Serve => {
            let settings = Settings::new()?;
            crate::server::run_server(settings).await
        }
        BackendCommands::CheckConfig => {
            println!("Checking configuration...");
            match Settings::new() {
                Ok(_) => {
                    println!("✓ Configuration is valid");
                    Ok(())
                }
                Err(e) => {
                    eprintln!("✗ Configuration error: {}", e);
                    std::process::exit(1);
                }
            }
        }
        BackendCommands::Worker { task_file } => {
            // The outcome lives in the task status and log, not the exit code
            if let Err(e) = crate::task::worker::run_task_file(&task_file).await {
                error!(
                    "Worker could not run task file {}: {:#}",
                    task_file.display(),
                    e
                );
            }
            Ok(())
        }
    }
}
