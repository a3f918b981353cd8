use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::db::models::{Task, TaskStatus};

fn default_dockerfile() -> String {
    "Dockerfile".to_string()
}

fn default_platforms() -> String {
    "linux/amd64".to_string()
}

fn default_is_https() -> bool {
    true
}

/// Project attributes as resolved by the caller at dispatch time
#[derive(Debug, Deserialize)]
pub struct ProjectRequest {
    pub build_context: PathBuf,
    #[serde(default = "default_dockerfile")]
    pub dockerfile: String,
    #[serde(default)]
    pub local_image_name: Option<String>,
    pub repo_image_name: String,
    #[serde(default)]
    pub no_cache: bool,
    #[serde(default)]
    pub auto_cleanup: bool,
    /// Comma-separated platform list
    #[serde(default = "default_platforms")]
    pub platforms: String,
}

#[derive(Debug, Deserialize)]
pub struct RegistryRequest {
    pub url: String,
    #[serde(default = "default_is_https")]
    pub is_https: bool,
}

#[derive(Deserialize)]
pub struct CredentialRequest {
    pub username: String,
    pub secret: String,
}

impl std::fmt::Debug for CredentialRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialRequest")
            .field("username", &self.username)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Deserialize)]
pub struct ProxyRequest {
    pub url: String,
}

/// Request to start a build/tag/push task
#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub project_id: String,
    pub project: ProjectRequest,
    #[serde(default)]
    pub registry: Option<RegistryRequest>,
    /// Tag input, e.g. `v1, v2|latest`
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub credential: Option<CredentialRequest>,
    #[serde(default)]
    pub proxy: Option<ProxyRequest>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateTaskResponse {
    pub task_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskResponse {
    pub id: String,
    pub project_id: String,
    pub tag: String,
    pub status: TaskStatus,
    /// True once the task reached SUCCESS or FAILED
    pub finished: bool,
    pub created_at: DateTime<Utc>,
}

impl From<Task> for TaskResponse {
    fn from(task: Task) -> Self {
        Self {
            id: task.id,
            project_id: task.project_id,
            tag: task.tag,
            status: task.status,
            finished: task.status.is_terminal(),
            created_at: task.created_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteTasksResponse {
    pub deleted: u64,
}
