// Dockerfile proxy preprocessing
//
// Declares the proxy build arguments after every FROM so that each stage of a
// multi-stage build sees them, and points apt at the proxy when the base image
// has an apt configuration directory.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Base-image directive the proxy block is attached to
pub(crate) const BASE_IMAGE_DIRECTIVE: &str = "FROM";

/// Suffix of the derived Dockerfile written next to the original
pub(crate) const DERIVED_SUFFIX: &str = "proxy_tmp";

/// Lines inserted after every base-image directive
pub(crate) const PROXY_BLOCK: &[&str] = &[
    "# --- dockyard proxy injection ---",
    "ARG HTTP_PROXY",
    "ARG HTTPS_PROXY",
    "ARG http_proxy",
    "ARG https_proxy",
    "ENV HTTP_PROXY=$HTTP_PROXY",
    "ENV HTTPS_PROXY=$HTTPS_PROXY",
    "ENV http_proxy=$http_proxy",
    "ENV https_proxy=$https_proxy",
    r#"RUN if [ -f /etc/apt/apt.conf.d/99proxy ]; then :; elif [ -d /etc/apt/apt.conf.d ]; then echo "Acquire::http::Proxy \"$HTTP_PROXY\";" > /etc/apt/apt.conf.d/99proxy; fi"#,
    "# --- end dockyard proxy injection ---",
];

/// Check if a line starts the given directive (case-insensitive, followed by whitespace)
fn is_directive(line: &str, keyword: &str) -> bool {
    let trimmed = line.trim();
    let Some(head) = trimmed.get(..keyword.len()) else {
        return false;
    };

    head.eq_ignore_ascii_case(keyword)
        && trimmed[keyword.len()..]
            .chars()
            .next()
            .is_some_and(char::is_whitespace)
}

/// Insert `block` after every instruction that starts with `keyword`.
///
/// When the directive spans several lines via `\` continuations, the block goes
/// after the last continuation line. Every other line is copied verbatim.
pub(crate) fn inject_after_directive(content: &str, keyword: &str, block: &[&str]) -> String {
    let mut result = String::with_capacity(content.len() + block.len() * 48);
    let mut in_directive = false;
    let mut in_continuation = false;

    for line in content.lines() {
        result.push_str(line);
        result.push('\n');

        let continues = line.trim_end().ends_with('\\');

        if !in_continuation {
            in_directive = is_directive(line, keyword);
        }
        in_continuation = continues;

        if in_directive && !continues {
            for block_line in block {
                result.push_str(block_line);
                result.push('\n');
            }
            in_directive = false;
        }
    }

    result
}

/// Proxy-inject a Dockerfile's content with the fixed proxy block
pub(crate) fn inject_proxy_block(content: &str) -> String {
    inject_after_directive(content, BASE_IMAGE_DIRECTIVE, PROXY_BLOCK)
}

/// Path of the derived Dockerfile for a task, next to the original
pub(crate) fn derived_path(original: &Path, task_id: &str) -> PathBuf {
    let mut name = original
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "Dockerfile".into());
    name.push(format!(".{}.{}", task_id, DERIVED_SUFFIX));
    original.with_file_name(name)
}

/// A proxy-injected Dockerfile written next to the original.
///
/// The file is removed when this value is dropped, so every exit path of the
/// build cleans it up.
#[derive(Debug)]
pub(crate) struct DerivedDockerfile {
    pub path: PathBuf,
}

impl DerivedDockerfile {
    /// Read `original`, inject the proxy block and write the derived file
    pub(crate) fn create(original: &Path, task_id: &str) -> Result<Self> {
        let content = std::fs::read_to_string(original)
            .with_context(|| format!("Failed to read Dockerfile: {}", original.display()))?;

        let processed = inject_proxy_block(&content);
        let path = derived_path(original, task_id);

        std::fs::write(&path, processed)
            .with_context(|| format!("Failed to write derived Dockerfile: {}", path.display()))?;

        debug!("Wrote proxy-injected Dockerfile to {}", path.display());
        Ok(Self { path })
    }
}

impl Drop for DerivedDockerfile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    "Failed to remove derived Dockerfile {}: {}",
                    self.path.display(),
                    e
                );
            }
        }
    }
}
