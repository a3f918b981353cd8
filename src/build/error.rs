use thiserror::Error;

use super::backend::BackendError;

/// Fatal pipeline failure, each variant with a stable code
#[derive(Debug, Error)]
pub(crate) enum PipelineError {
    #[error("login to {registry} failed: {source}")]
    Login {
        registry: String,
        #[source]
        source: BackendError,
    },

    #[error("builder '{name}' could not be set up: {reason}")]
    BuilderSetup { name: String, reason: String },

    #[error("image build failed: {0}")]
    Build(#[source] BackendError),

    #[error("tagging {reference} failed: {source}")]
    Tag {
        reference: String,
        #[source]
        source: BackendError,
    },

    #[error("push of {reference} failed: {source}")]
    Push {
        reference: String,
        #[source]
        source: BackendError,
    },

    #[error("{0}")]
    InvalidInput(String),
}

impl PipelineError {
    /// Machine-readable error code
    pub(crate) fn code(&self) -> &'static str {
        match self {
            PipelineError::Login { .. } => "LOGIN_FAILED",
            PipelineError::BuilderSetup { .. } => "BUILDER_SETUP_FAILED",
            PipelineError::Build(_) => "BUILD_FAILED",
            PipelineError::Tag { .. } => "TAG_FAILED",
            PipelineError::Push { .. } => "PUSH_FAILED",
            PipelineError::InvalidInput(_) => "INVALID_INPUT",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        let backend = || BackendError::Failed {
            command: "docker push".into(),
            status: "exit status: 1".into(),
            detail: "denied".into(),
        };

        let err = PipelineError::Push {
            reference: "reg/app:v1".into(),
            source: backend(),
        };
        assert_eq!(err.code(), "PUSH_FAILED");
        assert_eq!(
            err.to_string(),
            "push of reg/app:v1 failed: `docker push` exited with exit status: 1: denied"
        );

        assert_eq!(PipelineError::Build(backend()).code(), "BUILD_FAILED");
        assert_eq!(
            PipelineError::InvalidInput("no platforms".into()).code(),
            "INVALID_INPUT"
        );
    }
}
