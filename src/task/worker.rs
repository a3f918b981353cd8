// Execution unit
//
// Runs one task from its snapshot. Whatever happens, the task ends with a
// terminal status (when the database is reachable) and a closed log channel.

use anyhow::Result;
use sqlx::SqlitePool;
use std::path::Path;
use tracing::{debug, error, info, warn};

use super::snapshot::TaskInput;
use crate::build::{BuildBackend, BuilderManager, DockerCli, Pipeline, PipelineRequest};
use crate::db::{self, TaskStatus};
use crate::logs::TaskLog;

/// Run the task described by a snapshot file, consuming the file
pub async fn run_task_file(path: &Path) -> Result<TaskStatus> {
    let input = TaskInput::take_from(path).await?;
    let backend = DockerCli::new(input.config.container_cli.clone());
    Ok(execute(&input, &backend).await)
}

async fn open_pool(database_url: &str) -> Option<SqlitePool> {
    match db::connect(database_url, 1).await {
        Ok(pool) => Some(pool),
        Err(e) => {
            warn!("Worker could not open the database: {:#}", e);
            None
        }
    }
}

/// Execute a task and record its outcome.
///
/// The worker opens its own database handle; it never shares one with the
/// dispatcher. The terminal status is written before the log sentinel, so an
/// observer that reached the end of the log reads the final status.
pub(crate) async fn execute(input: &TaskInput, backend: &dyn BuildBackend) -> TaskStatus {
    let task_id = input.task_id.as_str();
    info!("Starting task {}", task_id);

    let log = match TaskLog::create(&input.config.log_dir, task_id) {
        Ok(log) => {
            debug!("Task {} logging to {}", task_id, log.path().display());
            Some(log)
        }
        Err(e) => {
            error!("Task {}: failed to open log channel: {:#}", task_id, e);
            None
        }
    };

    let mut pool = open_pool(&input.config.database_url).await;

    let status = match &log {
        Some(log) => {
            let builders = BuilderManager::new(
                backend,
                pool.as_ref(),
                input.config.shared_builder.clone(),
                input.config.builder_policy,
            )
            .with_default_registries(input.config.default_registries.clone());

            let result = Pipeline::new(backend, &builders, log)
                .run(PipelineRequest {
                    task_id,
                    project: &input.project,
                    tag_input: &input.tag_input,
                    credential: input.credential.as_ref(),
                    proxy: input.proxy.as_ref(),
                })
                .await;

            match result {
                Ok(()) => {
                    log.line("Task completed successfully");
                    TaskStatus::Success
                }
                Err(e) => {
                    log.line(format!("ERROR [{}] {}", e.code(), e));
                    error!("Task {} failed [{}]: {}", task_id, e.code(), e);
                    TaskStatus::Failed
                }
            }
        }
        None => TaskStatus::Failed,
    };

    // Retry once with a fresh handle if the first attempt failed
    if pool.is_none() {
        pool = open_pool(&input.config.database_url).await;
    }

    match &pool {
        Some(pool) => match db::tasks::set_status(pool, task_id, status).await {
            Ok(true) => info!("Task {} finished with status {}", task_id, status),
            Ok(false) => warn!("Task {} was not pending, status {} not recorded", task_id, status),
            Err(e) => error!("Task {}: failed to record status {}: {:#}", task_id, status, e),
        },
        None => error!(
            "Task {}: database unavailable, status {} not recorded",
            task_id, status
        ),
    }

    if let Some(pool) = pool {
        pool.close().await;
    }

    if let Some(log) = log {
        log.finish();
    }

    status
}
