use anyhow::{Context, Result};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;

use crate::db;
use crate::logs::LogTailer;
use crate::server::settings::Settings;
use crate::task::Dispatcher;

/// Shared state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub db_pool: SqlitePool,
    pub dispatcher: Arc<Dispatcher>,
    pub tailer: Arc<LogTailer>,
    pub log_dir: PathBuf,
}

impl AppState {
    pub async fn new_for_server(settings: &Settings) -> Result<Self> {
        let db_pool = db::connect(&settings.database.url, settings.database.max_connections)
            .await
            .context("Failed to open server database")?;

        let log_dir = settings.storage.log_dir();
        tokio::fs::create_dir_all(&log_dir)
            .await
            .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

        let dispatcher = Dispatcher::new(
            db_pool.clone(),
            settings.storage.task_dir(),
            settings.worker_config(),
        )?;

        Ok(Self::new(
            db_pool,
            dispatcher,
            settings.logs.tailer(log_dir.clone()),
            log_dir,
        ))
    }

    pub fn new(
        db_pool: SqlitePool,
        dispatcher: Dispatcher,
        tailer: LogTailer,
        log_dir: PathBuf,
    ) -> Self {
        Self {
            db_pool,
            dispatcher: Arc::new(dispatcher),
            tailer: Arc::new(tailer),
            log_dir,
        }
    }
}
