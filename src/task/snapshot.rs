// Dispatch-time snapshot handed to the execution unit
//
// Everything a worker needs travels in one JSON file. The worker never reads
// configuration or project storage on its own.

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::build::builder::BuilderPolicy;

/// Registry used when a project has none configured
pub const DEFAULT_REGISTRY_URL: &str = "https://docker.io";

/// Allowed form of an image name component
const IMAGE_NAME_PATTERN: &str = r"^[a-z0-9]+(?:[._-][a-z0-9]+)*$";

/// Immutable copy of a project's build attributes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectSnapshot {
    /// Build context directory
    pub build_context: PathBuf,
    /// Dockerfile path relative to the build context
    pub dockerfile: String,
    #[serde(default)]
    pub local_image_name: Option<String>,
    pub repo_image_name: String,
    #[serde(default)]
    pub no_cache: bool,
    #[serde(default)]
    pub auto_cleanup: bool,
    /// Comma-separated platform list
    pub platforms: String,
    /// Fully-qualified registry base URL, e.g. `https://registry.example.com`
    pub registry_url: String,
}

impl ProjectSnapshot {
    /// Name used for local image references
    pub fn local_name(&self) -> &str {
        match self.local_image_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name,
            _ => self
                .repo_image_name
                .rsplit('/')
                .next()
                .unwrap_or(&self.repo_image_name),
        }
    }
}

/// Registry login material
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialSnapshot {
    pub username: String,
    pub secret: String,
    pub registry_url: String,
}

impl std::fmt::Debug for CredentialSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialSnapshot")
            .field("username", &self.username)
            .field("secret", &"[REDACTED]")
            .field("registry_url", &self.registry_url)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxySnapshot {
    pub url: String,
}

/// Settings the worker runs with, copied from the server's configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub database_url: String,
    pub log_dir: PathBuf,
    pub container_cli: String,
    #[serde(default)]
    pub shared_builder: Option<String>,
    #[serde(default)]
    pub default_registries: Vec<String>,
    #[serde(default)]
    pub builder_policy: BuilderPolicy,
}

/// Complete input of one task execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInput {
    pub task_id: String,
    pub project: ProjectSnapshot,
    pub tag_input: String,
    #[serde(default)]
    pub credential: Option<CredentialSnapshot>,
    #[serde(default)]
    pub proxy: Option<ProxySnapshot>,
    pub config: WorkerConfig,
}

impl TaskInput {
    /// Write the snapshot file, readable by the owner only
    pub async fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let json = serde_json::to_vec(self).context("Failed to serialize task snapshot")?;
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("Failed to write task snapshot {}", path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .await
                .with_context(|| format!("Failed to restrict task snapshot {}", path.display()))?;
        }

        Ok(())
    }

    /// Read a snapshot file and remove it, since it holds the plaintext secret
    pub async fn take_from(path: &Path) -> Result<Self> {
        let json = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read task snapshot {}", path.display()))?;

        if let Err(e) = tokio::fs::remove_file(path).await {
            tracing::warn!("Failed to remove task snapshot {}: {}", path.display(), e);
        }

        serde_json::from_slice(&json).context("Failed to parse task snapshot")
    }
}

/// Build the fully-qualified registry base URL for a configured registry.
///
/// Any scheme the operator typed is dropped and replaced according to
/// `is_https`. Without a registry the public default is used.
pub fn registry_base_url(address: Option<&str>, is_https: bool) -> String {
    let Some(address) = address.map(str::trim).filter(|a| !a.is_empty()) else {
        return DEFAULT_REGISTRY_URL.to_string();
    };

    // Any stored scheme, in any case, is replaced by the project's flag
    let clean = address
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(address)
        .trim_end_matches('/');

    let scheme = if is_https { "https" } else { "http" };
    format!("{}://{}", scheme, clean)
}

/// Registry prefix for image references: the base URL without its scheme
pub fn registry_prefix(registry_url: &str) -> &str {
    let trimmed = registry_url.trim();
    trimmed
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(trimmed)
        .trim_end_matches('/')
}

fn is_valid_name_component(name: &str) -> bool {
    Regex::new(IMAGE_NAME_PATTERN).is_ok_and(|re| re.is_match(name))
}

/// Validate a local image name
pub fn validate_local_image_name(name: &str) -> Result<(), String> {
    if is_valid_name_component(name) {
        Ok(())
    } else {
        Err(format!(
            "Invalid local image name '{}': use lowercase letters, digits and single '.', '_' or '-' separators",
            name
        ))
    }
}

/// Validate a repository image name; each `/`-separated segment is checked
pub fn validate_repo_image_name(name: &str) -> Result<(), String> {
    if name.split('/').all(is_valid_name_component) {
        Ok(())
    } else {
        Err(format!(
            "Invalid repository image name '{}': each '/'-separated part must use lowercase letters, digits and single '.', '_' or '-' separators",
            name
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn project() -> ProjectSnapshot {
        ProjectSnapshot {
            build_context: PathBuf::from("/src/app"),
            dockerfile: "Dockerfile".into(),
            local_image_name: None,
            repo_image_name: "team/web-app".into(),
            no_cache: false,
            auto_cleanup: true,
            platforms: "linux/amd64".into(),
            registry_url: "https://reg.example.com".into(),
        }
    }

    #[test]
    fn test_registry_base_url() {
        assert_eq!(registry_base_url(None, true), "https://docker.io");
        assert_eq!(registry_base_url(Some("  "), false), "https://docker.io");
        assert_eq!(
            registry_base_url(Some("reg.example.com"), true),
            "https://reg.example.com"
        );
        assert_eq!(
            registry_base_url(Some("https://10.0.0.5:5000/"), false),
            "http://10.0.0.5:5000"
        );
        assert_eq!(
            registry_base_url(Some("HTTPS://reg.example.com"), true),
            "https://reg.example.com"
        );
        assert_eq!(
            registry_base_url(Some("Http://10.0.0.5:5000/"), false),
            "http://10.0.0.5:5000"
        );
    }

    #[test]
    fn test_registry_prefix() {
        assert_eq!(registry_prefix("https://reg.example.com/"), "reg.example.com");
        assert_eq!(registry_prefix("http://10.0.0.5:5000/base"), "10.0.0.5:5000/base");
        assert_eq!(registry_prefix("docker.io"), "docker.io");
    }

    #[test]
    fn test_image_name_validation() {
        assert!(validate_local_image_name("web-app").is_ok());
        assert!(validate_local_image_name("web_app.v2").is_ok());
        assert!(validate_local_image_name("Web").is_err());
        assert!(validate_local_image_name("web--app").is_err());
        assert!(validate_local_image_name("-web").is_err());

        assert!(validate_repo_image_name("team/web-app").is_ok());
        assert!(validate_repo_image_name("team//web").is_err());
        assert!(validate_repo_image_name("team/Web").is_err());
    }

    #[test]
    fn test_local_name_fallback() {
        let mut p = project();
        assert_eq!(p.local_name(), "web-app");

        p.local_image_name = Some("  ".into());
        assert_eq!(p.local_name(), "web-app");

        p.local_image_name = Some("local".into());
        assert_eq!(p.local_name(), "local");
    }

    #[test]
    fn test_credential_debug_redacts_secret() {
        let cred = CredentialSnapshot {
            username: "ci".into(),
            secret: "hunter2".into(),
            registry_url: "https://reg.example.com".into(),
        };
        let printed = format!("{:?}", cred);
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("ci"));
    }

    #[tokio::test]
    async fn test_snapshot_file_is_consumed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tasks").join("t1.json");
        let input = TaskInput {
            task_id: "t1".into(),
            project: project(),
            tag_input: "v1|v2".into(),
            credential: None,
            proxy: Some(ProxySnapshot {
                url: "http://proxy:3128".into(),
            }),
            config: WorkerConfig {
                database_url: "sqlite::memory:".into(),
                log_dir: dir.path().join("logs"),
                container_cli: "docker".into(),
                shared_builder: None,
                default_registries: vec![],
                builder_policy: BuilderPolicy::default(),
            },
        };

        input.write_to(&path).await.unwrap();
        assert!(path.exists());

        let read = TaskInput::take_from(&path).await.unwrap();
        assert_eq!(read, input);
        assert!(!path.exists());
    }
}
