// Shell Executor
// Runs step commands through sh, bash, pwsh or cmd in a working directory

use crate::error::StepError;
use crate::models::CommandSpec;
use crate::runners::{StepExecutor, StepOutput};

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Shell types supported by the executor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shell {
    /// Default shell (sh on Unix, cmd on Windows)
    Default,
    Sh,
    Bash,
    /// PowerShell Core (cross-platform)
    Pwsh,
    /// Windows PowerShell (Windows only, falls back to pwsh)
    PowerShell,
}

impl Shell {
    /// Get the shell executable and arguments
    fn get_command(&self) -> (&'static str, &'static [&'static str]) {
        match self {
            Shell::Default => {
                if cfg!(target_os = "windows") {
                    ("cmd", &["/C"])
                } else {
                    ("sh", &["-c"])
                }
            }
            Shell::Sh => ("sh", &["-c"]),
            Shell::Bash => ("bash", &["-eo", "pipefail", "-c"]),
            Shell::Pwsh => ("pwsh", &["-NoLogo", "-NoProfile", "-Command"]),
            Shell::PowerShell => {
                if cfg!(target_os = "windows") {
                    ("powershell.exe", &["-NoLogo", "-NoProfile", "-Command"])
                } else {
                    // Fall back to pwsh on non-Windows
                    ("pwsh", &["-NoLogo", "-NoProfile", "-Command"])
                }
            }
        }
    }

    pub fn program(&self) -> &'static str {
        self.get_command().0
    }
}

impl FromStr for Shell {
    type Err = StepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "default" => Ok(Shell::Default),
            "sh" => Ok(Shell::Sh),
            "bash" => Ok(Shell::Bash),
            "pwsh" => Ok(Shell::Pwsh),
            "powershell" => Ok(Shell::PowerShell),
            other => Err(StepError::ShellNotFound(other.to_string())),
        }
    }
}

/// Step executor that runs commands in local shells
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    default_shell: Shell,
    working_dir: PathBuf,
}

impl ShellExecutor {
    /// Create an executor running in `working_dir` with the platform default shell
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            default_shell: Shell::Default,
            working_dir: working_dir.into(),
        }
    }

    pub fn with_default_shell(mut self, shell: Shell) -> Self {
        self.default_shell = shell;
        self
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    fn shell_for(&self, command: &CommandSpec) -> Result<Shell, StepError> {
        match &command.shell {
            Some(name) => name.parse(),
            None => Ok(self.default_shell),
        }
    }

    /// Resolve an artifact path inside the working directory
    fn workspace_path(&self, path: &str) -> Result<PathBuf, StepError> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)));

        if escapes {
            return Err(StepError::ArtifactIo {
                path: path.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "artifact paths must stay inside the working directory",
                ),
            });
        }

        Ok(self.working_dir.join(relative))
    }
}

#[async_trait]
impl StepExecutor for ShellExecutor {
    async fn execute(
        &self,
        command: &CommandSpec,
        env: &HashMap<String, String>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<StepOutput, StepError> {
        let shell = self.shell_for(command)?;
        let (shell_cmd, shell_args) = shell.get_command();

        if which::which(shell_cmd).is_err() {
            return Err(StepError::ShellNotFound(shell_cmd.to_string()));
        }

        let mut cmd = Command::new(shell_cmd);
        cmd.args(shell_args);
        cmd.arg(&command.run);
        cmd.current_dir(&self.working_dir);
        cmd.envs(env);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| StepError::Spawn {
            program: shell_cmd.to_string(),
            message: e.to_string(),
        })?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(StepError::Spawn {
                program: shell_cmd.to_string(),
                message: "output pipes were not captured".to_string(),
            });
        };

        // Read output streams concurrently
        let stdout_handle = tokio::spawn(read_lines(stdout));
        let stderr_handle = tokio::spawn(read_lines(stderr));

        let status = tokio::select! {
            status = child.wait() => status.map_err(|e| StepError::Spawn {
                program: shell_cmd.to_string(),
                message: e.to_string(),
            })?,
            _ = tokio::time::sleep(timeout) => {
                let _ = child.kill().await;
                return Err(StepError::TimedOut(timeout));
            }
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(StepError::Cancelled);
            }
        };

        let mut output = stdout_handle.await.unwrap_or_default();
        let stderr = stderr_handle.await.unwrap_or_default();
        if !stderr.is_empty() {
            if !output.is_empty() {
                output.push('\n');
            }
            output.push_str(&stderr);
        }

        tracing::debug!(
            shell = shell_cmd,
            exit_code = ?status.code(),
            "step command finished"
        );

        Ok(StepOutput {
            exit_code: status.code(),
            output: output.into_bytes(),
        })
    }

    async fn stage_artifact(&self, _instance: &str, path: &str, data: &[u8]) -> Result<(), StepError> {
        let target = self.workspace_path(path)?;
        let io_err = |source| StepError::ArtifactIo {
            path: path.to_string(),
            source,
        };

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        tokio::fs::write(&target, data).await.map_err(io_err)
    }

    async fn collect_artifact(&self, _instance: &str, path: &str) -> Result<Vec<u8>, StepError> {
        let source = self.workspace_path(path)?;
        tokio::fs::read(&source)
            .await
            .map_err(|source| StepError::ArtifactIo {
                path: path.to_string(),
                source,
            })
    }
}

async fn read_lines<R>(reader: R) -> String
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut output = String::new();
    while let Ok(Some(line)) = lines.next_line().await {
        if !output.is_empty() {
            output.push('\n');
        }
        output.push_str(&line);
    }
    output
}
