// Per-registry builder management
//
// Every registry host other than the public default gets its own builder,
// configured to trust that host. Builders are named after the host so that
// later tasks find them again by probing the backend.

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::io::Write;
use tracing::{debug, info, warn};

use super::backend::{BuildBackend, BuilderSpec};
use super::error::PipelineError;
use crate::db;
use crate::logs::TaskLog;

/// Prefix of every dedicated builder name
pub(crate) const BUILDER_PREFIX: &str = "dockyard";

/// Hosts that belong to the public default registry
pub(crate) const DEFAULT_REGISTRY_ALIASES: &[&str] = &[
    "docker.io",
    "index.docker.io",
    "registry-1.docker.io",
    "registry.hub.docker.com",
];

/// Address prefixes treated as private networks
const PRIVATE_PREFIXES: &[&str] = &["10.", "192.168.", "127.", "localhost"];

/// Capacity policy for dedicated builders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderPolicy {
    /// Builders kept before idle ones are evicted (0 disables eviction)
    pub max_builders: usize,
    /// Minimum idle time before a builder may be evicted
    pub min_idle_secs: u64,
}

impl Default for BuilderPolicy {
    fn default() -> Self {
        Self {
            max_builders: 32,
            min_idle_secs: 3600,
        }
    }
}

/// Builder selected for a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BuilderChoice {
    /// Default registry: the pre-provisioned builder, if one is configured
    Shared(Option<String>),
    /// Host-scoped builder
    Dedicated(String),
}

/// Reduce a registry URL to its authority: no scheme, no path, lowercase
pub(crate) fn normalize_host(registry_url: &str) -> String {
    let trimmed = registry_url.trim();
    let without_scheme = trimmed
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(trimmed);

    without_scheme
        .trim_end_matches('/')
        .split('/')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase()
}

/// Deterministic builder name for a normalized host
pub(crate) fn builder_name(host: &str) -> String {
    let digest = Sha256::digest(host.as_bytes());
    let hash = format!("{:x}", digest);

    let sanitized: String = host
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();

    format!("{}-{}-{}", BUILDER_PREFIX, sanitized, &hash[..8])
}

fn has_port(host: &str) -> bool {
    match host.strip_prefix('[') {
        // [v6]:port
        Some(rest) => rest
            .split_once(']')
            .is_some_and(|(_, after)| after.starts_with(':')),
        None => host.contains(':'),
    }
}

fn is_private(host: &str) -> bool {
    if PRIVATE_PREFIXES.iter().any(|p| host.starts_with(p)) {
        return true;
    }

    // 172.16.0.0/12
    let mut octets = host.split('.');
    matches!(
        (octets.next(), octets.next().and_then(|o| o.parse::<u8>().ok())),
        (Some("172"), Some(16..=31))
    )
}

/// Whether a registry must be reached over plain HTTP without TLS verification
pub(crate) fn is_insecure(registry_url: &str, host: &str) -> bool {
    registry_url
        .trim()
        .to_ascii_lowercase()
        .starts_with("http://")
        || has_port(host)
        || is_private(host)
}

/// Render a BuildKit daemon configuration trusting `host` as computed
pub(crate) fn render_buildkitd_config(host: &str, insecure: bool) -> Result<String, toml::ser::Error> {
    let mut entry = toml::Table::new();
    entry.insert("http".into(), toml::Value::Boolean(insecure));
    entry.insert("insecure".into(), toml::Value::Boolean(insecure));

    let mut registries = toml::Table::new();
    registries.insert(host.to_string(), toml::Value::Table(entry));

    let mut root = toml::Table::new();
    root.insert("registry".into(), toml::Value::Table(registries));

    toml::to_string(&root)
}

/// Resolves, creates and evicts builders for tasks
pub(crate) struct BuilderManager<'a> {
    backend: &'a dyn BuildBackend,
    /// Builder bookkeeping; eviction is skipped without it
    pool: Option<&'a SqlitePool>,
    shared_builder: Option<String>,
    default_registries: Vec<String>,
    policy: BuilderPolicy,
}

impl<'a> BuilderManager<'a> {
    pub(crate) fn new(
        backend: &'a dyn BuildBackend,
        pool: Option<&'a SqlitePool>,
        shared_builder: Option<String>,
        policy: BuilderPolicy,
    ) -> Self {
        Self {
            backend,
            pool,
            shared_builder,
            default_registries: DEFAULT_REGISTRY_ALIASES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            policy,
        }
    }

    pub(crate) fn with_default_registries(mut self, aliases: Vec<String>) -> Self {
        if !aliases.is_empty() {
            self.default_registries = aliases
                .into_iter()
                .map(|a| normalize_host(&a))
                .collect();
        }
        self
    }

    pub(crate) fn is_default_registry(&self, host: &str) -> bool {
        self.default_registries.iter().any(|alias| alias == host)
    }

    /// Make sure the builder for `registry_url` exists and return it
    pub(crate) async fn ensure(
        &self,
        registry_url: &str,
        log: &TaskLog,
    ) -> Result<BuilderChoice, PipelineError> {
        let host = normalize_host(registry_url);

        if self.is_default_registry(&host) {
            debug!("Registry '{}' is the default registry, using shared builder", host);
            return Ok(BuilderChoice::Shared(self.shared_builder.clone()));
        }

        let name = builder_name(&host);
        let setup_err = |reason: String| PipelineError::BuilderSetup {
            name: name.clone(),
            reason,
        };

        let exists = self
            .backend
            .builder_exists(&name)
            .await
            .map_err(|e| setup_err(e.to_string()))?;

        if exists {
            log.line(format!("Reusing builder {} for {}", name, host));
        } else {
            let insecure = is_insecure(registry_url, &host);
            log.line(format!(
                "Creating builder {} for {} ({})",
                name,
                host,
                if insecure { "plain HTTP" } else { "HTTPS" }
            ));

            let config = render_buildkitd_config(&host, insecure)
                .map_err(|e| setup_err(format!("failed to render builder config: {}", e)))?;

            // One file per creation attempt; removed when dropped
            let mut config_file = tempfile::Builder::new()
                .prefix("buildkitd-")
                .suffix(".toml")
                .tempfile()
                .map_err(|e| setup_err(format!("failed to create builder config: {}", e)))?;
            config_file
                .write_all(config.as_bytes())
                .and_then(|_| config_file.flush())
                .map_err(|e| setup_err(format!("failed to write builder config: {}", e)))?;

            let spec = BuilderSpec {
                name: name.clone(),
                config_path: config_file.path().to_path_buf(),
                host_network: true,
            };

            if let Err(e) = self.backend.create_builder(&spec, log).await {
                // Another task may have created it concurrently
                let appeared = self.backend.builder_exists(&name).await.unwrap_or(false);
                if !appeared {
                    return Err(setup_err(e.to_string()));
                }
                log.line(format!("Builder {} was created concurrently, reusing it", name));
            }

            if let Err(e) = config_file.close() {
                warn!("Failed to remove builder config file: {}", e);
            }
            info!("Builder '{}' ready for '{}'", name, host);
        }

        self.record_use(&name, &host).await;
        self.evict_idle(&name, log).await;

        Ok(BuilderChoice::Dedicated(name))
    }

    async fn record_use(&self, name: &str, host: &str) {
        let Some(pool) = self.pool else {
            return;
        };
        if let Err(e) = db::builders::acquire(pool, name, host, Utc::now()).await {
            warn!("Failed to record use of builder '{}': {:#}", name, e);
        }
    }

    /// Hand a dedicated builder back once the task no longer builds on it
    pub(crate) async fn release(&self, choice: &BuilderChoice) {
        let (Some(pool), BuilderChoice::Dedicated(name)) = (self.pool, choice) else {
            return;
        };
        if let Err(e) = db::builders::release(pool, name, Utc::now()).await {
            warn!("Failed to release builder '{}': {:#}", name, e);
        }
    }

    /// Remove least recently used builders beyond capacity. Builders with
    /// running tasks are never candidates. Never fatal.
    async fn evict_idle(&self, current: &str, log: &TaskLog) {
        let Some(pool) = self.pool else {
            return;
        };
        if self.policy.max_builders == 0 {
            return;
        }

        let records = match db::builders::list_lru(pool).await {
            Ok(records) => records,
            Err(e) => {
                warn!("Failed to list builders for eviction: {:#}", e);
                return;
            }
        };

        let excess = records.len().saturating_sub(self.policy.max_builders);
        if excess == 0 {
            return;
        }

        let idle_secs = i64::try_from(self.policy.min_idle_secs).unwrap_or(i64::MAX);
        let cutoff = Duration::try_seconds(idle_secs)
            .and_then(|idle| Utc::now().checked_sub_signed(idle))
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

        let candidates = records
            .iter()
            .filter(|r| r.name != current && r.active_tasks == 0 && r.last_used_at <= cutoff)
            .take(excess);

        for record in candidates {
            log.line(format!("Evicting idle builder {} ({})", record.name, record.host));
            match self.backend.remove_builder(&record.name, log).await {
                Ok(()) => {
                    if let Err(e) = db::builders::delete(pool, &record.name).await {
                        warn!("Failed to forget builder '{}': {:#}", record.name, e);
                    }
                }
                Err(e) => {
                    warn!("Failed to evict builder '{}': {}", record.name, e);
                    log.line(format!("Warning: could not evict builder {}: {}", record.name, e));
                }
            }
        }
    }
}
