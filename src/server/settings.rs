use config::{Config, ConfigError};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::build::BuilderPolicy;
use crate::logs::LogTailer;
use crate::task::snapshot::WorkerConfig;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub build: BuildSettings,
    #[serde(default)]
    pub builders: BuilderPolicy,
    #[serde(default)]
    pub logs: LogSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseSettings {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageSettings {
    /// Root for task logs and dispatch snapshots
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl StorageSettings {
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn task_dir(&self) -> PathBuf {
        self.data_dir.join("tasks")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BuildSettings {
    /// Container CLI binary (docker or a compatible CLI)
    #[serde(default = "default_container_cli")]
    pub container_cli: String,

    /// Pre-provisioned builder for multi-platform builds against the default registry
    #[serde(default)]
    pub shared_builder: Option<String>,

    /// Hosts treated as the public default registry (built-in list when empty)
    #[serde(default)]
    pub default_registry_aliases: Vec<String>,
}

fn default_container_cli() -> String {
    "docker".to_string()
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            container_cli: default_container_cli(),
            shared_builder: None,
            default_registry_aliases: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Polls for the log file before a tail gives up
    #[serde(default = "default_creation_attempts")]
    pub creation_attempts: u32,

    #[serde(default = "default_creation_delay_ms")]
    pub creation_delay_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_creation_attempts() -> u32 {
    10
}

fn default_creation_delay_ms() -> u64 {
    500
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            creation_attempts: default_creation_attempts(),
            creation_delay_ms: default_creation_delay_ms(),
        }
    }
}

impl LogSettings {
    pub fn tailer(&self, log_dir: PathBuf) -> LogTailer {
        LogTailer::new(
            log_dir,
            Duration::from_millis(self.poll_interval_ms),
            self.creation_attempts,
            Duration::from_millis(self.creation_delay_ms),
        )
    }
}

impl Settings {
    /// Substitute environment variables in a string value
    /// Replaces ${VAR_NAME} or ${VAR_NAME:-default} with environment variable values
    fn substitute_env_vars_in_string(s: &str) -> String {
        let Ok(re) = regex::Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}") else {
            return s.to_string();
        };

        re.replace_all(s, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default_value = caps.get(2).map(|m| m.as_str());

            match env::var(var_name) {
                Ok(val) => val,
                Err(_) => default_value.unwrap_or("").to_string(),
            }
        })
        .to_string()
    }

    /// Convert a config::Value to a serde_json::Value, performing environment variable substitution
    fn config_value_to_json(value: &config::Value) -> serde_json::Value {
        use config::ValueKind;

        match &value.kind {
            ValueKind::Nil => serde_json::Value::Null,
            ValueKind::Boolean(b) => serde_json::Value::Bool(*b),
            ValueKind::I64(i) => serde_json::Value::Number((*i).into()),
            ValueKind::I128(i) => serde_json::Value::Number((*i as i64).into()),
            ValueKind::U64(u) => serde_json::Value::Number((*u).into()),
            ValueKind::U128(u) => serde_json::Value::Number((*u as u64).into()),
            ValueKind::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            ValueKind::String(s) => {
                serde_json::Value::String(Self::substitute_env_vars_in_string(s))
            }
            ValueKind::Table(table) => {
                let mut map = serde_json::Map::new();
                for (k, v) in table.iter() {
                    map.insert(k.clone(), Self::config_value_to_json(v));
                }
                serde_json::Value::Object(map)
            }
            ValueKind::Array(arr) => {
                let vec: Vec<serde_json::Value> =
                    arr.iter().map(Self::config_value_to_json).collect();
                serde_json::Value::Array(vec)
            }
        }
    }

    /// Try to add a config file with multiple extension attempts (.toml, .yaml, .yml)
    /// Returns Ok(true) if a file was loaded, Ok(false) if no file found (when not required)
    fn try_add_config_file(
        builder: &mut config::ConfigBuilder<config::builder::DefaultState>,
        config_dir: &Path,
        name: &str,
        required: bool,
    ) -> Result<bool, ConfigError> {
        for ext in ["toml", "yaml", "yml"] {
            let path = config_dir.join(format!("{}.{}", name, ext));
            if path.exists() {
                tracing::info!("Loading config file: {}", path.display());
                *builder = builder
                    .clone()
                    .add_source(config::File::from(path.as_path()));
                return Ok(true);
            }
        }

        if required {
            Err(ConfigError::Message(format!(
                "Required config file not found: {}/{}.{{toml,yaml,yml}}",
                config_dir.display(),
                name
            )))
        } else {
            tracing::debug!(
                "Optional config file not found: {}/{}.{{toml,yaml,yml}}",
                config_dir.display(),
                name
            );
            Ok(false)
        }
    }

    /// Load settings from `DOCKYARD_CONFIG_DIR` for `DOCKYARD_CONFIG_RUN_MODE`
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode =
            env::var("DOCKYARD_CONFIG_RUN_MODE").unwrap_or_else(|_| "development".into());
        let config_dir = env::var("DOCKYARD_CONFIG_DIR").unwrap_or_else(|_| "config".into());

        let mut settings = Self::load(Path::new(&config_dir), &run_mode)?;

        // DATABASE_URL takes precedence over the config files
        if let Ok(database_url) = env::var("DATABASE_URL") {
            if !database_url.is_empty() {
                settings.database.url = database_url;
            }
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Load `default`, then `<run_mode>`, then `local` from a config directory
    pub fn load(config_dir: &Path, run_mode: &str) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        Self::try_add_config_file(&mut builder, config_dir, "default", true)?;
        Self::try_add_config_file(&mut builder, config_dir, run_mode, false)?;
        Self::try_add_config_file(&mut builder, config_dir, "local", false)?;

        let config = builder.build()?;

        let root_value = config
            .cache
            .into_table()
            .map_err(|e| ConfigError::Message(format!("Failed to get config table: {}", e)))?;

        let mut json_map = serde_json::Map::new();
        for (k, v) in root_value.iter() {
            json_map.insert(k.clone(), Self::config_value_to_json(v));
        }
        let json_value = serde_json::Value::Object(json_map);

        let mut unused_fields = Vec::new();
        let settings: Settings = serde_ignored::deserialize(json_value, |path| {
            unused_fields.push(path.to_string());
        })
        .map_err(|e| ConfigError::Message(format!("Failed to deserialize settings: {}", e)))?;

        for field in &unused_fields {
            tracing::warn!("Unknown configuration field: {}", field);
        }

        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.database.url.is_empty() {
            return Err(ConfigError::Message(
                "Database URL not configured. Set DATABASE_URL environment variable or [database] url in config".to_string()
            ));
        }

        if self.build.container_cli.trim().is_empty() {
            return Err(ConfigError::Message(
                "[build] container_cli must not be empty".to_string(),
            ));
        }

        if self.logs.poll_interval_ms == 0 {
            return Err(ConfigError::Message(
                "[logs] poll_interval_ms must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Values copied into every dispatch snapshot
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            database_url: self.database.url.clone(),
            log_dir: self.storage.log_dir(),
            container_cli: self.build.container_cli.clone(),
            shared_builder: self.build.shared_builder.clone(),
            default_registries: self.build.default_registry_aliases.clone(),
            builder_policy: self.builders,
        }
    }
}
