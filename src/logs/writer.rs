use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

use super::{log_path, TASK_LOG_SENTINEL};

/// Replacement for tool output that happens to equal the sentinel
const ESCAPED_SENTINEL: &str = "[sentinel line suppressed]";

/// Writer side of a task's log channel.
///
/// Every call appends whole lines and flushes before returning. The sentinel
/// is appended exactly once: by [`TaskLog::finish`], or on drop if `finish`
/// was never reached. Since `finish` consumes the writer, nothing can be
/// written after the sentinel.
pub(crate) struct TaskLog {
    task_id: String,
    path: PathBuf,
    file: Mutex<File>,
    finished: bool,
}

impl TaskLog {
    /// Create (or reopen for append) the log file for a task
    pub(crate) fn create(log_dir: &Path, task_id: &str) -> Result<Self> {
        std::fs::create_dir_all(log_dir)
            .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

        let path = log_path(log_dir, task_id);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open log file {}", path.display()))?;

        Ok(Self {
            task_id: task_id.to_string(),
            path,
            file: Mutex::new(file),
            finished: false,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Append a message. Multi-line messages are written one line at a time.
    pub(crate) fn line(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        let mut buf = String::with_capacity(message.len() + 1);

        for line in message.trim_end_matches(['\r', '\n']).split('\n') {
            let line = line.trim_end_matches('\r');
            debug!(task_id = %self.task_id, "{}", line);

            if line == TASK_LOG_SENTINEL {
                buf.push_str(ESCAPED_SENTINEL);
            } else {
                buf.push_str(line);
            }
            buf.push('\n');
        }

        self.append(&buf);
    }

    /// Append the sentinel and close the channel
    pub(crate) fn finish(mut self) {
        self.write_sentinel();
    }

    fn write_sentinel(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.append(&format!("{}\n", TASK_LOG_SENTINEL));
    }

    fn append(&self, text: &str) {
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = file.write_all(text.as_bytes()).and_then(|_| file.flush()) {
            warn!(
                task_id = %self.task_id,
                "Failed to append to task log {}: {}",
                self.path.display(),
                e
            );
        }
    }
}

impl Drop for TaskLog {
    fn drop(&mut self) {
        self.write_sentinel();
    }
}
