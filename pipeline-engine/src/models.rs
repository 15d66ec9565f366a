// Engine Models
// Job definitions, instance states and run results

use crate::execution::matrix::MatrixSpec;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use std::fmt;
use std::time::Duration;

/// Process exit code reported when the declaration or graph is invalid
pub const CONFIG_ERROR_EXIT_CODE: i32 = 65;

/// Opaque command handed to a step executor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Script text, may contain `${{ matrix.<axis> }}` placeholders
    pub run: String,
    /// Shell name (`bash`, `sh`, `pwsh`, ...); executor default when absent
    #[serde(default)]
    pub shell: Option<String>,
}

impl CommandSpec {
    pub fn new(run: impl Into<String>) -> Self {
        Self {
            run: run.into(),
            shell: None,
        }
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = Some(shell.into());
        self
    }
}

/// A single step of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub name: String,
    pub command: CommandSpec,
    /// Step-level `if`, evaluated just before the step runs
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub env: IndexMap<String, String>,
    /// A failure of this step is recorded as a warning only
    #[serde(default)]
    pub continue_on_error: bool,
}

impl StepSpec {
    pub fn new(name: impl Into<String>, run: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: CommandSpec::new(run),
            condition: None,
            env: IndexMap::new(),
            continue_on_error: false,
        }
    }

    pub fn with_command(mut self, command: CommandSpec) -> Self {
        self.command = command;
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn continue_on_error(mut self, enabled: bool) -> Self {
        self.continue_on_error = enabled;
        self
    }
}

/// An artifact a job needs materialized before its steps run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactInput {
    /// Producing job id
    pub job: String,
    pub name: String,
    /// Destination path, defaults to the artifact name
    #[serde(default)]
    pub path: Option<String>,
}

impl ArtifactInput {
    pub fn destination(&self) -> &str {
        self.path.as_deref().unwrap_or(&self.name)
    }
}

/// An artifact a job produces after its steps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactOutput {
    pub name: String,
    /// Source path collected by the step executor
    pub path: String,
    /// Retention override, run default when absent
    #[serde(default)]
    pub retention_days: Option<u32>,
}

/// Static definition of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub needs: Vec<String>,
    /// Job-level `if`; absent means always run
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub matrix: Option<MatrixSpec>,
    /// Cap on concurrently running instances of this job
    #[serde(default)]
    pub max_parallel: Option<usize>,
    /// Cancel not-yet-started siblings once one instance fails
    #[serde(default)]
    pub fail_fast: bool,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
    #[serde(default)]
    pub artifact_inputs: Vec<ArtifactInput>,
    #[serde(default)]
    pub artifact_outputs: Vec<ArtifactOutput>,
    #[serde(default)]
    pub continue_on_error: bool,
    /// Wall-clock budget per instance; run default when absent
    #[serde(default)]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub env: IndexMap<String, String>,
}

impl JobDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            needs: Vec::new(),
            condition: None,
            matrix: None,
            max_parallel: None,
            fail_fast: false,
            steps: Vec::new(),
            artifact_inputs: Vec::new(),
            artifact_outputs: Vec::new(),
            continue_on_error: false,
            timeout: None,
            env: IndexMap::new(),
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn needs<I, S>(mut self, jobs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.needs.extend(jobs.into_iter().map(Into::into));
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_matrix(mut self, matrix: MatrixSpec) -> Self {
        self.matrix = Some(matrix);
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = Some(max_parallel);
        self
    }

    pub fn fail_fast(mut self, enabled: bool) -> Self {
        self.fail_fast = enabled;
        self
    }

    pub fn step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }

    /// Shorthand for a plain `run` step
    pub fn run(self, name: impl Into<String>, command: impl Into<String>) -> Self {
        self.step(StepSpec::new(name, command))
    }

    pub fn download(
        mut self,
        job: impl Into<String>,
        name: impl Into<String>,
        path: Option<String>,
    ) -> Self {
        self.artifact_inputs.push(ArtifactInput {
            job: job.into(),
            name: name.into(),
            path,
        });
        self
    }

    pub fn upload(mut self, name: impl Into<String>, path: impl Into<String>) -> Self {
        self.artifact_outputs.push(ArtifactOutput {
            name: name.into(),
            path: path.into(),
            retention_days: None,
        });
        self
    }

    pub fn continue_on_error(mut self, enabled: bool) -> Self {
        self.continue_on_error = enabled;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Index of a job instance in the run's instance table
pub type InstanceId = usize;

/// Lifecycle state of a job instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Pending,
    Blocked,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl InstanceState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceState::Succeeded
                | InstanceState::Failed
                | InstanceState::Skipped
                | InstanceState::Cancelled
        )
    }

    /// Allowed edges of the instance state machine
    pub fn can_transition_to(&self, next: InstanceState) -> bool {
        use InstanceState::*;

        match self {
            Pending => matches!(next, Blocked | Ready | Skipped | Cancelled),
            Blocked => matches!(next, Ready | Skipped | Cancelled),
            Ready => matches!(next, Running | Cancelled),
            Running => matches!(next, Succeeded | Failed | Cancelled),
            Succeeded | Failed | Skipped | Cancelled => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Blocked => "blocked",
            InstanceState::Ready => "ready",
            InstanceState::Running => "running",
            InstanceState::Succeeded => "succeeded",
            InstanceState::Failed => "failed",
            InstanceState::Skipped => "skipped",
            InstanceState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an instance ended Failed, Cancelled or Skipped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// A step exited nonzero (`None` when killed by a signal)
    StepFailed {
        step_index: usize,
        step: String,
        exit_code: Option<i32>,
    },
    /// The step executor itself failed
    ExecutorError {
        step_index: usize,
        step: String,
        message: String,
    },
    /// An artifact download or upload failed
    Artifact { message: String },
    /// The instance exceeded its wall-clock budget
    Timeout { after: Duration },
    /// A required dependency failed or was cancelled
    DependencyFailed { job: String },
    /// A sibling matrix instance failed with fail-fast enabled
    FailFast { sibling: String },
    /// The whole run was aborted
    RunCancelled,
    /// The job or step condition evaluated false
    ConditionFalse,
    /// The runner task itself crashed
    Internal { message: String },
}

impl FailureReason {
    /// Does this reason make the run fail (as opposed to skip or abort)?
    pub fn is_failure_propagation(&self) -> bool {
        matches!(
            self,
            FailureReason::DependencyFailed { .. } | FailureReason::FailFast { .. }
        )
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::StepFailed {
                step_index,
                step,
                exit_code,
            } => match exit_code {
                Some(code) => write!(
                    f,
                    "step {} '{}' exited with code {}",
                    step_index + 1,
                    step,
                    code
                ),
                None => write!(
                    f,
                    "step {} '{}' terminated by signal",
                    step_index + 1,
                    step
                ),
            },
            FailureReason::ExecutorError {
                step_index,
                step,
                message,
            } => write!(f, "step {} '{}' could not run: {}", step_index + 1, step, message),
            FailureReason::Artifact { message } => write!(f, "artifact error: {}", message),
            FailureReason::Timeout { after } => {
                write!(f, "timed out after {}s", after.as_secs())
            }
            FailureReason::DependencyFailed { job } => {
                write!(f, "dependency '{}' failed", job)
            }
            FailureReason::FailFast { sibling } => {
                write!(f, "cancelled by fail-fast after '{}' failed", sibling)
            }
            FailureReason::RunCancelled => write!(f, "run was cancelled"),
            FailureReason::ConditionFalse => write!(f, "condition evaluated to false"),
            FailureReason::Internal { message } => write!(f, "internal error: {}", message),
        }
    }
}

/// Result of a step execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    /// Failed, but the failure was tolerated by continue-on-error
    SucceededWithWarnings,
    Failed,
    Skipped,
    Cancelled,
}

/// Record of one step of an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub index: usize,
    pub name: String,
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    pub duration: Duration,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: Option<String>,
}

impl StepRecord {
    pub fn skipped(index: usize, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            status: StepStatus::Skipped,
            exit_code: None,
            duration: Duration::ZERO,
            output: String::new(),
            error: None,
        }
    }
}

/// What a job runner reports for one instance
#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeStatus {
    Succeeded,
    /// A failure occurred but continue-on-error absorbed it
    SucceededWithWarnings(FailureReason),
    Failed(FailureReason),
    Cancelled,
}

/// Outcome of running one job instance
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub status: OutcomeStatus,
    pub steps: Vec<StepRecord>,
    pub duration: Duration,
}

impl JobOutcome {
    pub fn new(status: OutcomeStatus, steps: Vec<StepRecord>, duration: Duration) -> Self {
        Self {
            status,
            steps,
            duration,
        }
    }

    pub fn cancelled(steps: Vec<StepRecord>, duration: Duration) -> Self {
        Self::new(OutcomeStatus::Cancelled, steps, duration)
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self.status,
            OutcomeStatus::Succeeded | OutcomeStatus::SucceededWithWarnings(_)
        )
    }
}

/// Job result as seen by `needs.<job>.result`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobConclusion {
    Success,
    Failure,
    Cancelled,
    Skipped,
}

impl JobConclusion {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobConclusion::Success => "success",
            JobConclusion::Failure => "failure",
            JobConclusion::Cancelled => "cancelled",
            JobConclusion::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(JobConclusion::Success),
            "failure" => Some(JobConclusion::Failure),
            "cancelled" => Some(JobConclusion::Cancelled),
            "skipped" => Some(JobConclusion::Skipped),
            _ => None,
        }
    }

    /// Fold the terminal states of every instance of a job.
    ///
    /// Any failure wins, then cancellation; a job whose instances were all
    /// skipped (or that has none) is skipped.
    pub fn from_states<I>(states: I) -> Self
    where
        I: IntoIterator<Item = InstanceState>,
    {
        let mut any_success = false;
        let mut any_cancelled = false;

        for state in states {
            match state {
                InstanceState::Failed => return JobConclusion::Failure,
                InstanceState::Cancelled => any_cancelled = true,
                InstanceState::Succeeded => any_success = true,
                _ => {}
            }
        }

        if any_cancelled {
            JobConclusion::Cancelled
        } else if any_success {
            JobConclusion::Success
        } else {
            JobConclusion::Skipped
        }
    }
}

impl fmt::Display for JobConclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final record of one job instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceResult {
    pub id: InstanceId,
    pub job_id: String,
    /// `job` or `job[index]` for matrix instances
    pub name: String,
    #[serde(default)]
    pub matrix: Option<IndexMap<String, String>>,
    pub state: InstanceState,
    /// Succeeded only because continue-on-error absorbed a failure
    #[serde(default)]
    pub warnings: bool,
    #[serde(default)]
    pub reason: Option<FailureReason>,
    #[serde(default)]
    pub steps: Vec<StepRecord>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl InstanceResult {
    pub fn duration(&self) -> Option<Duration> {
        let (start, end) = (self.started_at?, self.finished_at?);
        (end - start).to_std().ok()
    }

    pub fn reason_string(&self) -> Option<String> {
        self.reason.as_ref().map(ToString::to_string)
    }
}

/// Overall status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Cancelled,
    /// The declaration's triggers did not match the context
    NotTriggered,
}

impl RunStatus {
    /// Process exit code for the status
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Succeeded | RunStatus::NotTriggered => 0,
            RunStatus::Failed => 1,
            RunStatus::Cancelled => 130,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::NotTriggered => "not triggered",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate result of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub pipeline: String,
    pub status: RunStatus,
    pub instances: Vec<InstanceResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunResult {
    /// Derive the overall status from terminal instance records
    pub fn aggregate_status(instances: &[InstanceResult], aborted: bool) -> RunStatus {
        let failed = instances.iter().any(|i| match i.state {
            InstanceState::Failed => true,
            InstanceState::Cancelled => i
                .reason
                .as_ref()
                .map(FailureReason::is_failure_propagation)
                .unwrap_or(false),
            _ => false,
        });

        if failed {
            RunStatus::Failed
        } else if aborted {
            RunStatus::Cancelled
        } else {
            RunStatus::Succeeded
        }
    }

    pub fn instance(&self, name: &str) -> Option<&InstanceResult> {
        self.instances.iter().find(|i| i.name == name)
    }

    pub fn instances_of<'a>(&'a self, job: &'a str) -> impl Iterator<Item = &'a InstanceResult> {
        self.instances.iter().filter(move |i| i.job_id == job)
    }

    pub fn count(&self, state: InstanceState) -> usize {
        self.instances.iter().filter(|i| i.state == state).count()
    }

    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }

    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }
}
