// Docker CLI build backend

use async_trait::async_trait;
use std::collections::VecDeque;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::backend::{BackendError, BuildBackend, BuildRequest, BuilderSpec};
use crate::logs::TaskLog;

/// Number of trailing output lines carried in a failure message
const ERROR_TAIL_LINES: usize = 5;

/// Drives `docker` (or a compatible CLI such as `podman`) as a child process.
///
/// Output of every long-running command is streamed line by line into the
/// task log as it is produced.
#[derive(Debug, Clone)]
pub(crate) struct DockerCli {
    container_cli: String,
}

impl DockerCli {
    pub(crate) fn new(container_cli: impl Into<String>) -> Self {
        Self {
            container_cli: container_cli.into(),
        }
    }

    fn describe(&self, args: &[String]) -> String {
        // Only the subcommand: arguments may contain build arg values
        let sub: Vec<&str> = args
            .iter()
            .take_while(|a| !a.starts_with('-'))
            .map(String::as_str)
            .collect();
        format!("{} {}", self.container_cli, sub.join(" "))
    }

    /// Run a command, mirroring stdout and stderr into the task log
    async fn run(
        &self,
        args: Vec<String>,
        stdin: Option<&str>,
        log: &TaskLog,
    ) -> Result<(), BackendError> {
        let command = self.describe(&args);
        debug!("Executing command: {}", command);

        let io_err = |source: std::io::Error| BackendError::Io {
            command: command.clone(),
            source,
        };

        let mut child = Command::new(&self.container_cli)
            .args(&args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(io_err)?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await.map_err(io_err)?;
            // Closing stdin signals end of input to `--password-stdin`
            drop(pipe);
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io_err(std::io::Error::other("stdout not captured")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io_err(std::io::Error::other("stderr not captured")))?;

        // Raw bytes: tool output is not guaranteed to be UTF-8
        let mut out = BufReader::new(stdout);
        let mut err = BufReader::new(stderr);
        let mut out_buf = Vec::new();
        let mut err_buf = Vec::new();
        let mut out_done = false;
        let mut err_done = false;
        let mut tail: VecDeque<String> = VecDeque::with_capacity(ERROR_TAIL_LINES);
        let mut read_error = None;

        while !(out_done && err_done) {
            let (read, from_stdout) = tokio::select! {
                read = out.read_until(b'\n', &mut out_buf), if !out_done => (read, true),
                read = err.read_until(b'\n', &mut err_buf), if !err_done => (read, false),
            };

            let (buf, done) = if from_stdout {
                (&mut out_buf, &mut out_done)
            } else {
                (&mut err_buf, &mut err_done)
            };

            match read {
                Ok(0) => *done = true,
                Ok(_) => {}
                Err(e) => {
                    // Stop reading and make sure the child cannot block on a full pipe
                    warn!("Failed to read output of `{}`: {}", command, e);
                    *done = true;
                    if let Err(kill_err) = child.start_kill() {
                        debug!("Failed to kill `{}`: {}", command, kill_err);
                    }
                    read_error.get_or_insert(e);
                }
            }

            // Complete line, or the unterminated remainder at end of stream
            if buf.ends_with(b"\n") || (*done && !buf.is_empty()) {
                let line = String::from_utf8_lossy(buf)
                    .trim_end_matches(['\r', '\n'])
                    .to_string();
                buf.clear();

                log.line(&line);
                if tail.len() == ERROR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        }

        let status = child.wait().await.map_err(io_err)?;
        if let Some(e) = read_error {
            return Err(io_err(e));
        }
        if !status.success() {
            return Err(BackendError::Failed {
                command,
                status: status.to_string(),
                detail: tail.into_iter().collect::<Vec<_>>().join(" | "),
            });
        }

        Ok(())
    }
}

/// Assemble `buildx build` arguments for a request
pub(crate) fn buildx_build_args(request: &BuildRequest) -> Vec<String> {
    let mut args: Vec<String> = vec!["buildx".into(), "build".into()];

    if let Some(builder) = &request.builder {
        args.extend(["--builder".into(), builder.clone()]);
    }

    if !request.platforms.is_empty() {
        args.extend(["--platform".into(), request.platforms.join(",")]);
    }

    args.extend(["-f".into(), request.dockerfile.display().to_string()]);

    for tag in &request.tags {
        args.extend(["-t".into(), tag.clone()]);
    }

    for (key, value) in &request.build_args {
        args.extend(["--build-arg".into(), format!("{}={}", key, value)]);
    }

    if request.no_cache {
        args.push("--no-cache".into());
    }

    if let Some(cache_ref) = &request.cache_from {
        args.extend([
            "--cache-from".into(),
            format!("type=registry,ref={}", cache_ref),
        ]);
    }

    if request.inline_cache {
        args.extend(["--cache-to".into(), "type=inline".into()]);
    }

    // Without push the result must land in the local image store for tagging
    if request.push {
        args.push("--push".into());
    } else {
        args.push("--load".into());
    }

    args.push(request.context.display().to_string());
    args
}

/// Assemble `buildx create` arguments for a dedicated builder
pub(crate) fn buildx_create_args(spec: &BuilderSpec) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "buildx".into(),
        "create".into(),
        "--name".into(),
        spec.name.clone(),
        "--driver".into(),
        "docker-container".into(),
    ];

    if spec.host_network {
        args.extend(["--driver-opt".into(), "network=host".into()]);
    }

    args.extend([
        "--config".into(),
        spec.config_path.display().to_string(),
        "--bootstrap".into(),
    ]);
    args
}

#[async_trait]
impl BuildBackend for DockerCli {
    async fn login(
        &self,
        registry: &str,
        username: &str,
        secret: &str,
        log: &TaskLog,
    ) -> Result<(), BackendError> {
        debug!(
            "Executing: {} login {} --username {} --password-stdin",
            self.container_cli, registry, username
        );

        let args = vec![
            "login".to_string(),
            registry.to_string(),
            "--username".to_string(),
            username.to_string(),
            "--password-stdin".to_string(),
        ];
        self.run(args, Some(secret), log).await
    }

    async fn builder_exists(&self, name: &str) -> Result<bool, BackendError> {
        let output = Command::new(&self.container_cli)
            .args(["buildx", "inspect", name])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| BackendError::Io {
                command: format!("{} buildx inspect", self.container_cli),
                source,
            })?;

        Ok(output.status.success())
    }

    async fn create_builder(&self, spec: &BuilderSpec, log: &TaskLog) -> Result<(), BackendError> {
        info!("Creating builder '{}'", spec.name);
        self.run(buildx_create_args(spec), None, log).await
    }

    async fn remove_builder(&self, name: &str, log: &TaskLog) -> Result<(), BackendError> {
        info!("Removing builder '{}'", name);
        let args = vec!["buildx".to_string(), "rm".to_string(), name.to_string()];
        self.run(args, None, log).await
    }

    async fn build(&self, request: &BuildRequest, log: &TaskLog) -> Result<(), BackendError> {
        info!(
            "Building image with {} buildx: {}",
            self.container_cli,
            request.tags.join(", ")
        );
        self.run(buildx_build_args(request), None, log).await
    }

    async fn tag(&self, source: &str, target: &str, log: &TaskLog) -> Result<(), BackendError> {
        let args = vec!["tag".to_string(), source.to_string(), target.to_string()];
        self.run(args, None, log).await
    }

    async fn push(&self, reference: &str, log: &TaskLog) -> Result<(), BackendError> {
        info!("Pushing image to registry: {}", reference);
        let args = vec!["push".to_string(), reference.to_string()];
        self.run(args, None, log).await
    }

    async fn remove_image(&self, reference: &str, log: &TaskLog) -> Result<(), BackendError> {
        let args = vec!["rmi".to_string(), reference.to_string()];
        self.run(args, None, log).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn request() -> BuildRequest {
        BuildRequest {
            context: PathBuf::from("/src/app"),
            dockerfile: PathBuf::from("/src/app/Dockerfile"),
            tags: vec!["reg.local/team/app:v1".into()],
            platforms: vec!["linux/amd64".into()],
            ..Default::default()
        }
    }

    #[test]
    fn test_build_args_local_load() {
        let args = buildx_build_args(&request());
        assert_eq!(
            args,
            vec![
                "buildx",
                "build",
                "--platform",
                "linux/amd64",
                "-f",
                "/src/app/Dockerfile",
                "-t",
                "reg.local/team/app:v1",
                "--load",
                "/src/app",
            ]
        );
    }

    #[test]
    fn test_build_args_push_with_cache_and_builder() {
        let mut req = request();
        req.builder = Some("dockyard-reg-local-1234abcd".into());
        req.platforms = vec!["linux/amd64".into(), "linux/arm64".into()];
        req.tags.push("reg.local/team/app:v2".into());
        req.build_args
            .insert("HTTP_PROXY".into(), "http://proxy:3128".into());
        req.cache_from = Some("reg.local/team/app:v1".into());
        req.inline_cache = true;
        req.push = true;

        let args = buildx_build_args(&req);
        let joined = args.join(" ");

        assert!(joined.starts_with("buildx build --builder dockyard-reg-local-1234abcd"));
        assert!(joined.contains("--platform linux/amd64,linux/arm64"));
        assert!(joined.contains("-t reg.local/team/app:v1 -t reg.local/team/app:v2"));
        assert!(joined.contains("--build-arg HTTP_PROXY=http://proxy:3128"));
        assert!(joined.contains("--cache-from type=registry,ref=reg.local/team/app:v1"));
        assert!(joined.contains("--cache-to type=inline"));
        assert!(args.contains(&"--push".to_string()));
        assert!(!args.contains(&"--load".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("/src/app"));
    }

    #[test]
    fn test_build_args_no_cache() {
        let mut req = request();
        req.no_cache = true;
        let args = buildx_build_args(&req);
        assert!(args.contains(&"--no-cache".to_string()));
        assert!(!args.iter().any(|a| a == "--cache-from"));
    }

    #[test]
    fn test_create_args() {
        let spec = BuilderSpec {
            name: "dockyard-reg-1234abcd".into(),
            config_path: PathBuf::from("/tmp/buildkitd.toml"),
            host_network: true,
        };
        assert_eq!(
            buildx_create_args(&spec).join(" "),
            "buildx create --name dockyard-reg-1234abcd --driver docker-container \
             --driver-opt network=host --config /tmp/buildkitd.toml --bootstrap"
        );
    }

    #[test]
    fn test_describe_hides_arguments() {
        let cli = DockerCli::new("docker");
        let args = buildx_build_args(&request());
        assert_eq!(cli.describe(&args), "docker buildx build");
    }

    #[tokio::test]
    async fn test_missing_cli_is_io_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let log = TaskLog::create(dir.path(), "t").unwrap();
        let cli = DockerCli::new("dockyard-definitely-not-a-cli");

        let err = cli.push("x:1", &log).await.unwrap_err();
        assert!(matches!(err, BackendError::Io { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_utf8_output_does_not_stall() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("fake-cli");
        std::fs::write(
            &script,
            "#!/bin/sh\n\
             printf 'bad \\377\\376 bytes\\n' >&2\n\
             i=0\n\
             while [ $i -lt 5000 ]; do\n\
               echo \"stderr line $i padded padded padded padded padded padded\" >&2\n\
               i=$((i+1))\n\
             done\n\
             printf 'no trailing newline'\n\
             exit 0\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let log_dir = dir.path().join("logs");
        let log = TaskLog::create(&log_dir, "t").unwrap();
        let cli = DockerCli::new(script.to_string_lossy());

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(30),
            cli.push("x:1", &log),
        )
        .await
        .expect("command stalled on undecodable output");
        assert!(result.is_ok(), "{:?}", result);
        log.finish();

        let content = std::fs::read_to_string(crate::logs::log_path(&log_dir, "t")).unwrap();
        assert!(content.contains("bad \u{FFFD}\u{FFFD} bytes"));
        assert!(content.contains("stderr line 4999"));
        assert!(content.contains("no trailing newline"));
    }
}
