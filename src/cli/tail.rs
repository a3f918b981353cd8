use anyhow::{bail, Context, Result};
use futures::StreamExt;
use std::path::PathBuf;

use crate::logs::TailEvent;
use crate::server::settings::Settings;

/// Follow a task's log on this host until the task completes
pub async fn handle_tail(task_id: &str, log_dir: Option<PathBuf>) -> Result<()> {
    let settings = Settings::new().context("Failed to load configuration")?;
    let log_dir = log_dir.unwrap_or_else(|| settings.storage.log_dir());
    let tailer = settings.logs.tailer(log_dir);

    let mut events = Box::pin(tailer.tail(task_id));
    while let Some(event) = events.next().await {
        match event {
            TailEvent::Line(line) => println!("{}", line),
            TailEvent::CreationTimeout(message) | TailEvent::ReadError(message) => {
                bail!(message)
            }
        }
    }

    Ok(())
}
