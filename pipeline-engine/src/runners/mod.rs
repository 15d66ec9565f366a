// Step Executors
// The boundary between the engine and whatever actually runs step commands

pub mod shell;

pub use shell::{Shell, ShellExecutor};

use crate::error::StepError;
use crate::models::CommandSpec;

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What a step executor reports for one command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepOutput {
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
    /// Combined stdout and stderr
    pub output: Vec<u8>,
}

impl StepOutput {
    pub fn new(exit_code: i32, output: impl Into<Vec<u8>>) -> Self {
        Self {
            exit_code: Some(exit_code),
            output: output.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

/// Runs step commands for job instances.
///
/// Implementations must stop promptly once `cancel` fires and must not run
/// past `timeout`. Artifact staging is optional: executors that have no
/// workspace keep the default `Unsupported` behavior.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(
        &self,
        command: &CommandSpec,
        env: &HashMap<String, String>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<StepOutput, StepError>;

    /// Materialize a downloaded artifact at `path` for `instance`
    async fn stage_artifact(
        &self,
        _instance: &str,
        _path: &str,
        _data: &[u8],
    ) -> Result<(), StepError> {
        Err(StepError::Unsupported("artifact staging"))
    }

    /// Read the artifact `instance` produced at `path`
    async fn collect_artifact(&self, _instance: &str, _path: &str) -> Result<Vec<u8>, StepError> {
        Err(StepError::Unsupported("artifact collection"))
    }
}
