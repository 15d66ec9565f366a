// Engine Errors
// Configuration, artifact, step executor and declaration error types

use thiserror::Error;

/// Fatal problems found while building a job graph.
///
/// Every variant aborts the run before any job instance is created.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("duplicate job id '{0}'")]
    DuplicateId(String),

    #[error("job '{0}' depends on itself")]
    SelfDependency(String),

    #[error("job '{job}' needs unknown job '{dependency}'")]
    UnknownDependency { job: String, dependency: String },

    #[error("circular dependency detected: {}", .cycle.join(" -> "))]
    Cycle { cycle: Vec<String> },

    #[error("malformed condition in {location}: {message}")]
    MalformedCondition { location: String, message: String },

    #[error("invalid matrix for job '{job}': {message}")]
    InvalidMatrix { job: String, message: String },

    #[error("matrix axis '{axis}' of job '{job}' has no values")]
    EmptyMatrixAxis { job: String, axis: String },

    #[error("invalid artifact binding in job '{job}': {message}")]
    InvalidArtifact { job: String, message: String },
}

impl ConfigError {
    /// Build a condition error for a job-level `if`
    pub fn job_condition(job: &str, message: impl Into<String>) -> Self {
        Self::MalformedCondition {
            location: format!("job '{}'", job),
            message: message.into(),
        }
    }

    /// Build a condition error for a step-level `if`
    pub fn step_condition(job: &str, step: &str, message: impl Into<String>) -> Self {
        Self::MalformedCondition {
            location: format!("step '{}' of job '{}'", step, job),
            message: message.into(),
        }
    }
}

/// Errors raised by an [`ArtifactStore`](crate::artifacts::ArtifactStore)
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact not found: {0}")]
    NotFound(String),

    #[error("artifact I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("artifact metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("artifact store rejected '{key}': {message}")]
    Rejected { key: String, message: String },
}

/// Errors raised by a [`StepExecutor`](crate::runners::StepExecutor)
#[derive(Debug, Error)]
pub enum StepError {
    #[error("failed to spawn '{program}': {message}")]
    Spawn { program: String, message: String },

    #[error("shell '{0}' is not available on this host")]
    ShellNotFound(String),

    #[error("step timed out after {0:?}")]
    TimedOut(std::time::Duration),

    #[error("step was cancelled")]
    Cancelled,

    #[error("artifact transfer failed for '{path}': {source}")]
    ArtifactIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("executor does not support {0}")]
    Unsupported(&'static str),
}

/// Errors raised while loading a pipeline declaration
#[derive(Debug, Error)]
pub enum DeclarationError {
    #[error("failed to read declaration: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse declaration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("unknown event kind '{0}'")]
    UnknownEvent(String),

    #[error("invalid declaration: {0}")]
    Invalid(String),
}

/// Crate-level error for callers that drive the whole engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Declaration(#[from] DeclarationError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_names_every_node() {
        let err = ConfigError::Cycle {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "circular dependency detected: a -> b -> a");
    }

    #[test]
    fn test_condition_locations() {
        let err = ConfigError::step_condition("build", "compile", "unknown field 'foo'");
        assert_eq!(
            err.to_string(),
            "malformed condition in step 'compile' of job 'build': unknown field 'foo'"
        );
    }
}
