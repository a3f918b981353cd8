// Build backend abstraction
//
// Everything the engine asks of the external build tool goes through this
// trait: registry login, builder probe/create/remove, build, tag, push and
// local image removal.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

use crate::logs::TaskLog;

/// Failure reported by the external build tool
#[derive(Debug, Error)]
pub(crate) enum BackendError {
    #[error("failed to run `{command}`: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}{}", format_detail(.detail))]
    Failed {
        command: String,
        status: String,
        detail: String,
    },
}

fn format_detail(detail: &str) -> String {
    if detail.is_empty() {
        String::new()
    } else {
        format!(": {}", detail)
    }
}

/// One image build invocation
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct BuildRequest {
    pub context: PathBuf,
    pub dockerfile: PathBuf,
    /// Image references attached to the build (`-t`)
    pub tags: Vec<String>,
    pub platforms: Vec<String>,
    pub build_args: BTreeMap<String, String>,
    /// Registry reference used as a cache source hint
    pub cache_from: Option<String>,
    /// Embed cache metadata in the produced image
    pub inline_cache: bool,
    pub no_cache: bool,
    /// Push from the build itself instead of loading into the local image store
    pub push: bool,
    /// Named builder to run on; `None` uses the backend's current builder
    pub builder: Option<String>,
}

/// Parameters for creating a dedicated builder
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct BuilderSpec {
    pub name: String,
    /// BuildKit daemon configuration file
    pub config_path: PathBuf,
    pub host_network: bool,
}

/// External build tool surface consumed by the engine
#[async_trait]
pub(crate) trait BuildBackend: Send + Sync {
    /// Authenticate against a registry host
    async fn login(
        &self,
        registry: &str,
        username: &str,
        secret: &str,
        log: &TaskLog,
    ) -> Result<(), BackendError>;

    /// Check whether a builder with this name exists
    async fn builder_exists(&self, name: &str) -> Result<bool, BackendError>;

    /// Create a builder bound to the given daemon configuration
    async fn create_builder(&self, spec: &BuilderSpec, log: &TaskLog) -> Result<(), BackendError>;

    /// Remove a builder and its daemon
    async fn remove_builder(&self, name: &str, log: &TaskLog) -> Result<(), BackendError>;

    async fn build(&self, request: &BuildRequest, log: &TaskLog) -> Result<(), BackendError>;

    async fn tag(&self, source: &str, target: &str, log: &TaskLog) -> Result<(), BackendError>;

    async fn push(&self, reference: &str, log: &TaskLog) -> Result<(), BackendError>;

    /// Remove an image reference from the local image store
    async fn remove_image(&self, reference: &str, log: &TaskLog) -> Result<(), BackendError>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording backend double for engine tests

    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum Call {
        Login { registry: String, username: String },
        BuilderExists(String),
        CreateBuilder { name: String, config: String },
        RemoveBuilder(String),
        Build(BuildRequest),
        Tag { source: String, target: String },
        Push(String),
        RemoveImage(String),
    }

    /// Backend that records calls and fails on demand
    #[derive(Default)]
    pub(crate) struct RecordingBackend {
        pub calls: Mutex<Vec<Call>>,
        pub existing_builders: Mutex<HashSet<String>>,
        pub valid_secret: Option<String>,
        pub fail_create_builder: bool,
        /// Creation fails because another task created the builder first
        pub create_races: bool,
        pub fail_build: bool,
        pub fail_tag: bool,
        pub fail_push_for: HashSet<String>,
        pub fail_remove_image: bool,
        pub fail_remove_builder: bool,
    }

    impl RecordingBackend {
        pub(crate) fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }

        fn fail(command: &str) -> BackendError {
            BackendError::Failed {
                command: command.to_string(),
                status: "exit status: 1".to_string(),
                detail: String::new(),
            }
        }
    }

    #[async_trait]
    impl BuildBackend for RecordingBackend {
        async fn login(
            &self,
            registry: &str,
            username: &str,
            secret: &str,
            _log: &TaskLog,
        ) -> Result<(), BackendError> {
            self.record(Call::Login {
                registry: registry.to_string(),
                username: username.to_string(),
            });
            match &self.valid_secret {
                Some(valid) if valid != secret => Err(Self::fail("docker login")),
                _ => Ok(()),
            }
        }

        async fn builder_exists(&self, name: &str) -> Result<bool, BackendError> {
            self.record(Call::BuilderExists(name.to_string()));
            Ok(self.existing_builders.lock().unwrap().contains(name))
        }

        async fn create_builder(
            &self,
            spec: &BuilderSpec,
            _log: &TaskLog,
        ) -> Result<(), BackendError> {
            let config = std::fs::read_to_string(&spec.config_path).unwrap_or_default();
            self.record(Call::CreateBuilder {
                name: spec.name.clone(),
                config,
            });
            if self.fail_create_builder {
                return Err(Self::fail("docker buildx create"));
            }
            self.existing_builders
                .lock()
                .unwrap()
                .insert(spec.name.clone());
            if self.create_races {
                return Err(Self::fail("docker buildx create"));
            }
            Ok(())
        }

        async fn remove_builder(&self, name: &str, _log: &TaskLog) -> Result<(), BackendError> {
            self.record(Call::RemoveBuilder(name.to_string()));
            if self.fail_remove_builder {
                return Err(Self::fail("docker buildx rm"));
            }
            self.existing_builders.lock().unwrap().remove(name);
            Ok(())
        }

        async fn build(&self, request: &BuildRequest, _log: &TaskLog) -> Result<(), BackendError> {
            self.record(Call::Build(request.clone()));
            if self.fail_build {
                return Err(Self::fail("docker buildx build"));
            }
            Ok(())
        }

        async fn tag(&self, source: &str, target: &str, _log: &TaskLog) -> Result<(), BackendError> {
            self.record(Call::Tag {
                source: source.to_string(),
                target: target.to_string(),
            });
            if self.fail_tag {
                return Err(Self::fail("docker tag"));
            }
            Ok(())
        }

        async fn push(&self, reference: &str, _log: &TaskLog) -> Result<(), BackendError> {
            self.record(Call::Push(reference.to_string()));
            if self.fail_push_for.contains(reference) {
                return Err(Self::fail("docker push"));
            }
            Ok(())
        }

        async fn remove_image(&self, reference: &str, _log: &TaskLog) -> Result<(), BackendError> {
            self.record(Call::RemoveImage(reference.to_string()));
            if self.fail_remove_image {
                return Err(Self::fail("docker rmi"));
            }
            Ok(())
        }
    }
}
