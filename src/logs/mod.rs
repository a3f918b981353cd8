// Task log channel
//
// One append-only text file per task. The execution unit is the single writer;
// any number of observers tail the file until the sentinel line shows up.

mod tailer;
mod writer;

pub(crate) use tailer::{LogTailer, TailEvent};
pub(crate) use writer::TaskLog;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Marker line closing every task log. Never forwarded to observers.
pub(crate) const TASK_LOG_SENTINEL: &str = "---TASK-COMPLETE---";

/// Path of the log file for a task
pub(crate) fn log_path(log_dir: &Path, task_id: &str) -> PathBuf {
    log_dir.join(format!("{}.log", task_id))
}

/// Read a task's complete log, or `None` if it was never created
pub(crate) async fn read_all(log_dir: &Path, task_id: &str) -> Result<Option<String>> {
    let path = log_path(log_dir, task_id);

    match tokio::fs::read_to_string(&path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read log file {}", path.display())),
    }
}

/// Remove a task's log file; a missing file is not an error
pub(crate) async fn remove(log_dir: &Path, task_id: &str) -> Result<()> {
    let path = log_path(log_dir, task_id);

    match tokio::fs::remove_file(&path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove log file {}", path.display())),
    }
}
