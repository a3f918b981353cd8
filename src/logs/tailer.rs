use futures::Stream;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

use super::{log_path, TASK_LOG_SENTINEL};

/// What an observer receives while tailing a task log
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TailEvent {
    /// One log line, without its trailing newline
    Line(String),
    /// The log file did not appear within the creation window
    CreationTimeout(String),
    /// Reading the log failed; the stream ends after this event
    ReadError(String),
}

/// Polling reader for task logs
#[derive(Debug, Clone)]
pub(crate) struct LogTailer {
    log_dir: PathBuf,
    poll_interval: Duration,
    creation_attempts: u32,
    creation_delay: Duration,
}

impl LogTailer {
    pub(crate) fn new(
        log_dir: PathBuf,
        poll_interval: Duration,
        creation_attempts: u32,
        creation_delay: Duration,
    ) -> Self {
        Self {
            log_dir,
            poll_interval,
            creation_attempts,
            creation_delay,
        }
    }

    /// Follow a task's log until the sentinel line.
    ///
    /// Lines already written are emitted first, then new lines as they are
    /// appended. The sentinel itself is never emitted. Dropping the stream
    /// stops the tail loop without touching the task.
    pub(crate) fn tail(&self, task_id: &str) -> impl Stream<Item = TailEvent> + Send + 'static {
        let path = log_path(&self.log_dir, task_id);
        let task_id = task_id.to_string();
        let poll_interval = self.poll_interval;
        let creation_attempts = self.creation_attempts;
        let creation_delay = self.creation_delay;

        async_stream::stream! {
            let mut attempts = creation_attempts;
            while !tokio::fs::try_exists(&path).await.unwrap_or(false) && attempts > 0 {
                tokio::time::sleep(creation_delay).await;
                attempts -= 1;
            }

            let file = match tokio::fs::File::open(&path).await {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(task_id = %task_id, "Log file never appeared");
                    yield TailEvent::CreationTimeout(format!(
                        "Log file for task {} was not created",
                        task_id
                    ));
                    return;
                }
                Err(e) => {
                    yield TailEvent::ReadError(format!("Failed to open log for task {}: {}", task_id, e));
                    return;
                }
            };

            let mut reader = BufReader::new(file);
            let mut buf = String::new();

            loop {
                match reader.read_line(&mut buf).await {
                    Ok(0) => {
                        tokio::time::sleep(poll_interval).await;
                    }
                    Ok(_) if !buf.ends_with('\n') => {
                        // Partial line: the writer is mid-append, keep what we have
                        tokio::time::sleep(poll_interval).await;
                    }
                    Ok(_) => {
                        let line = buf.trim_end_matches(['\r', '\n']).to_string();
                        buf.clear();

                        if line == TASK_LOG_SENTINEL {
                            debug!(task_id = %task_id, "Reached end of task log");
                            return;
                        }
                        yield TailEvent::Line(line);
                    }
                    Err(e) => {
                        yield TailEvent::ReadError(format!("Failed to read log for task {}: {}", task_id, e));
                        return;
                    }
                }
            }
        }
    }
}
