// Task dispatch
//
// Records a PENDING task, writes its snapshot and starts a worker process.
// The dispatcher returns as soon as the process is running.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::snapshot::{CredentialSnapshot, ProjectSnapshot, ProxySnapshot, TaskInput, WorkerConfig};
use crate::db::{self, TaskStatus};
use crate::logs::TaskLog;

/// What a caller submits to start a task
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub project_id: String,
    pub project: ProjectSnapshot,
    pub tag_input: String,
    pub credential: Option<CredentialSnapshot>,
    pub proxy: Option<ProxySnapshot>,
}

/// Starts worker processes for tasks
#[derive(Debug, Clone)]
pub struct Dispatcher {
    pool: SqlitePool,
    task_dir: PathBuf,
    worker_config: WorkerConfig,
    program: PathBuf,
}

impl Dispatcher {
    /// Dispatcher that re-executes the current binary as the worker
    pub fn new(pool: SqlitePool, task_dir: PathBuf, worker_config: WorkerConfig) -> Result<Self> {
        let program = std::env::current_exe().context("Failed to locate the dockyard binary")?;
        Ok(Self::with_program(pool, task_dir, worker_config, program))
    }

    pub fn with_program(
        pool: SqlitePool,
        task_dir: PathBuf,
        worker_config: WorkerConfig,
        program: PathBuf,
    ) -> Self {
        Self {
            pool,
            task_dir,
            worker_config,
            program,
        }
    }

    fn snapshot_path(&self, task_id: &str) -> PathBuf {
        self.task_dir.join(format!("{}.json", task_id))
    }

    /// Create the task and start its worker. Returns the new task id.
    pub async fn dispatch(&self, request: DispatchRequest) -> Result<String> {
        let task_id = Uuid::new_v4().to_string();

        db::tasks::create(&self.pool, &task_id, &request.project_id, &request.tag_input).await?;

        let input = TaskInput {
            task_id: task_id.clone(),
            project: request.project,
            tag_input: request.tag_input,
            credential: request.credential,
            proxy: request.proxy,
            config: self.worker_config.clone(),
        };

        let path = self.snapshot_path(&task_id);
        if let Err(e) = input.write_to(&path).await {
            self.fail_undispatched(&task_id, &path, &e).await;
            return Err(e);
        }

        let spawned = Command::new(&self.program)
            .arg("worker")
            .arg("--task-file")
            .arg(&path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to start worker {}", self.program.display()));

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                self.fail_undispatched(&task_id, &path, &e).await;
                return Err(e);
            }
        };

        info!(
            "Dispatched task {} for project {} (pid {:?})",
            task_id,
            request.project_id,
            child.id()
        );

        // Reap the worker; its outcome is reported through status and log
        let reaped_id = task_id.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!("Worker for task {} exited: {}", reaped_id, status),
                Err(e) => warn!("Failed to wait for worker of task {}: {}", reaped_id, e),
            }
        });

        Ok(task_id)
    }

    /// Close out a task whose worker never started
    async fn fail_undispatched(&self, task_id: &str, snapshot: &Path, cause: &anyhow::Error) {
        error!("Task {} could not be dispatched: {:#}", task_id, cause);

        match TaskLog::create(&self.worker_config.log_dir, task_id) {
            Ok(log) => {
                log.line(format!("ERROR [DISPATCH_FAILED] {:#}", cause));
                if let Err(e) = db::tasks::set_status(&self.pool, task_id, TaskStatus::Failed).await {
                    warn!("Failed to mark task {} as failed: {:#}", task_id, e);
                }
                log.finish();
            }
            Err(e) => {
                warn!("Failed to open log for task {}: {:#}", task_id, e);
                if let Err(e) = db::tasks::set_status(&self.pool, task_id, TaskStatus::Failed).await {
                    warn!("Failed to mark task {} as failed: {:#}", task_id, e);
                }
            }
        }

        if let Err(e) = tokio::fs::remove_file(snapshot).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove task snapshot {}: {}", snapshot.display(), e);
            }
        }
    }
}
