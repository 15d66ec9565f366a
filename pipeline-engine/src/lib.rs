// Pipeline Engine Library
// Job graph construction, scheduling and execution for flowrun pipelines

pub mod artifacts;
pub mod config;
pub mod error;
pub mod execution;
pub mod expression;
pub mod models;
pub mod runners;
pub mod workflow;

// Re-export commonly used types
pub use error::{
    ArtifactError, ConfigError, DeclarationError, EngineError, EngineResult, StepError,
};

pub use config::{ConfigOverrides, EmptyMatrixPolicy, ExecutorConfig};

pub use models::{
    ArtifactInput, ArtifactOutput, CommandSpec, FailureReason, InstanceResult, InstanceState,
    JobConclusion, JobDefinition, JobOutcome, OutcomeStatus, RunResult, RunStatus, StepRecord,
    StepSpec, StepStatus, CONFIG_ERROR_EXIT_CODE,
};

// Re-export execution types
pub use execution::{
    EventKind, ExecutionEvent, ExecutionGraph, MatrixExpander, MatrixSpec, ProgressSender,
    PullRequest, RunContext, RunController, RunHandle, TriggerSpec,
};

// Re-export expression types
pub use expression::{CompiledCondition, EvalScope};

// Re-export artifact and runner types
pub use artifacts::{ArtifactKey, ArtifactStore, FsArtifactStore, MemoryArtifactStore};
pub use runners::{Shell, ShellExecutor, StepExecutor, StepOutput};

pub use workflow::{PipelineDeclaration, WorkflowParser};
