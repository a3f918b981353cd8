// Build/tag/push pipeline
//
// Strictly sequential, no retries:
// login? -> build -> (tag, push x N)? -> cleanup?
// The first fatal error ends the run; pushes that already completed stay pushed.

use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{info, warn};

use super::backend::{BuildBackend, BuildRequest};
use super::builder::{normalize_host, BuilderChoice, BuilderManager};
use super::dockerfile_proxy::DerivedDockerfile;
use super::error::PipelineError;
use super::proxy::proxy_build_args;
use super::tags::{parse_platforms, parse_tags};
use crate::logs::TaskLog;
use crate::task::snapshot::{registry_prefix, CredentialSnapshot, ProjectSnapshot, ProxySnapshot};

/// Everything one pipeline run operates on
#[derive(Debug, Clone, Copy)]
pub(crate) struct PipelineRequest<'a> {
    pub task_id: &'a str,
    pub project: &'a ProjectSnapshot,
    pub tag_input: &'a str,
    pub credential: Option<&'a CredentialSnapshot>,
    pub proxy: Option<&'a ProxySnapshot>,
}

/// Number of numbered steps a run will report
pub(crate) fn total_steps(has_login: bool, separate_push: bool, tag_count: usize) -> usize {
    let login = usize::from(has_login);
    let push = if separate_push { 1 + tag_count } else { 0 };
    login + 1 + push
}

/// Whether the build invocation itself pushes the image
pub(crate) fn pushes_in_build(dedicated_builder: bool, platform_count: usize) -> bool {
    dedicated_builder || platform_count > 1
}

/// Numbered progress lines, e.g. `--- [2/5] Building ---`
struct Progress<'a> {
    log: &'a TaskLog,
    step: usize,
    total: usize,
}

impl<'a> Progress<'a> {
    fn new(log: &'a TaskLog, total: usize) -> Self {
        Self { log, step: 0, total }
    }

    fn step(&mut self, message: impl AsRef<str>) {
        self.step += 1;
        self.log
            .line(format!("--- [{}/{}] {} ---", self.step, self.total, message.as_ref()));
    }
}

/// Resolved references for one run
struct Plan {
    tags: Vec<String>,
    platforms: Vec<String>,
    dockerfile: PathBuf,
    /// `<registry>/<repo>:<tag>` per tag, in tag order
    remote_refs: Vec<String>,
    /// `<local name>:<tag>` per tag, in tag order
    local_refs: Vec<String>,
}

fn plan(request: &PipelineRequest<'_>) -> Result<Plan, PipelineError> {
    let project = request.project;

    let tags = parse_tags(request.tag_input);
    let platforms = parse_platforms(&project.platforms);
    if platforms.is_empty() {
        return Err(PipelineError::InvalidInput(
            "no target platform given".to_string(),
        ));
    }

    let repo = project.repo_image_name.trim().trim_matches('/');
    if repo.is_empty() {
        return Err(PipelineError::InvalidInput(
            "repository image name is empty".to_string(),
        ));
    }

    let dockerfile = project.build_context.join(&project.dockerfile);
    if !dockerfile.is_file() {
        return Err(PipelineError::InvalidInput(format!(
            "Dockerfile not found: {}",
            dockerfile.display()
        )));
    }

    let registry = registry_prefix(&project.registry_url);
    let remote_refs = tags
        .iter()
        .map(|tag| format!("{}/{}:{}", registry, repo, tag))
        .collect();
    let local_name = project.local_name();
    let local_refs = tags
        .iter()
        .map(|tag| format!("{}:{}", local_name, tag))
        .collect();

    Ok(Plan {
        tags,
        platforms,
        dockerfile,
        remote_refs,
        local_refs,
    })
}

/// Runs tasks against a build backend
pub(crate) struct Pipeline<'a> {
    backend: &'a dyn BuildBackend,
    builders: &'a BuilderManager<'a>,
    log: &'a TaskLog,
}

impl<'a> Pipeline<'a> {
    pub(crate) fn new(
        backend: &'a dyn BuildBackend,
        builders: &'a BuilderManager<'a>,
        log: &'a TaskLog,
    ) -> Self {
        Self {
            backend,
            builders,
            log,
        }
    }

    pub(crate) async fn run(&self, request: PipelineRequest<'_>) -> Result<(), PipelineError> {
        let project = request.project;
        let plan = plan(&request)?;

        let host = normalize_host(&project.registry_url);
        let dedicated = !self.builders.is_default_registry(&host);
        let push_in_build = pushes_in_build(dedicated, plan.platforms.len());

        let mut progress = Progress::new(
            self.log,
            total_steps(request.credential.is_some(), !push_in_build, plan.tags.len()),
        );

        self.log.line(format!(
            "Task {}: tags [{}], platforms [{}]",
            request.task_id,
            plan.tags.join(", "),
            plan.platforms.join(", ")
        ));

        if let Some(credential) = request.credential {
            let registry = normalize_host(&credential.registry_url);
            progress.step(format!("Logging in to {} as {}", registry, credential.username));

            if let Err(source) = self
                .backend
                .login(&registry, &credential.username, &credential.secret, self.log)
                .await
            {
                return Err(PipelineError::Login { registry, source });
            }
            self.log.line("Login succeeded");
        }

        progress.step(format!(
            "Building {} for {}",
            plan.remote_refs.join(", "),
            plan.platforms.join(",")
        ));

        let choice = self.builders.ensure(&project.registry_url, self.log).await?;
        let builder = match &choice {
            BuilderChoice::Dedicated(name) => Some(name.clone()),
            BuilderChoice::Shared(shared) if plan.platforms.len() > 1 => shared.clone(),
            BuilderChoice::Shared(_) => None,
        };

        let mut build_args = BTreeMap::new();
        let derived = match request.proxy {
            Some(proxy) => {
                self.log.line(format!("Using proxy {}", proxy.url));
                build_args.extend(proxy_build_args(&proxy.url));

                match DerivedDockerfile::create(&plan.dockerfile, request.task_id) {
                    Ok(derived) => Some(derived),
                    Err(e) => {
                        warn!("Proxy injection failed for task {}: {:#}", request.task_id, e);
                        self.log.line(format!(
                            "Warning: proxy injection failed, building with the original Dockerfile: {:#}",
                            e
                        ));
                        None
                    }
                }
            }
            None => None,
        };

        let build = BuildRequest {
            context: project.build_context.clone(),
            dockerfile: derived
                .as_ref()
                .map(|d| d.path.clone())
                .unwrap_or_else(|| plan.dockerfile.clone()),
            tags: if push_in_build {
                plan.remote_refs.clone()
            } else {
                plan.local_refs.clone()
            },
            platforms: plan.platforms.clone(),
            build_args,
            cache_from: if project.no_cache {
                None
            } else {
                plan.remote_refs.first().cloned()
            },
            inline_cache: true,
            no_cache: project.no_cache,
            push: push_in_build,
            builder,
        };

        let built = self.backend.build(&build, self.log).await;
        // Derived Dockerfile is removed here on success and failure alike
        drop(derived);
        self.builders.release(&choice).await;
        built.map_err(PipelineError::Build)?;

        if push_in_build {
            self.log.line(format!(
                "Pushed {} tag(s) as part of the build",
                plan.remote_refs.len()
            ));
        } else {
            progress.step(format!(
                "Tagging {} image(s) for {}",
                plan.local_refs.len(),
                registry_prefix(&project.registry_url)
            ));
            for (local, remote) in plan.local_refs.iter().zip(&plan.remote_refs) {
                if let Err(source) = self.backend.tag(local, remote, self.log).await {
                    return Err(PipelineError::Tag {
                        reference: remote.clone(),
                        source,
                    });
                }
                self.log.line(format!("Tagged {} as {}", local, remote));
            }

            for remote in &plan.remote_refs {
                progress.step(format!("Pushing {}", remote));
                if let Err(source) = self.backend.push(remote, self.log).await {
                    return Err(PipelineError::Push {
                        reference: remote.clone(),
                        source,
                    });
                }
                self.log.line(format!("Pushed {}", remote));
            }
        }

        if project.auto_cleanup && !push_in_build {
            self.cleanup(&plan).await;
        }

        info!("Task {} pushed {} tag(s)", request.task_id, plan.tags.len());
        Ok(())
    }

    /// Best-effort removal of every produced local reference
    async fn cleanup(&self, plan: &Plan) {
        self.log.line("--- Cleaning up local images ---");
        for reference in plan.local_refs.iter().chain(&plan.remote_refs) {
            match self.backend.remove_image(reference, self.log).await {
                Ok(()) => self.log.line(format!("Removed {}", reference)),
                Err(e) => self
                    .log
                    .line(format!("Warning: could not remove {}: {}", reference, e)),
            }
        }
    }
}
