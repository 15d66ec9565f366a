// Execution Engine Module
// Handles DAG construction, matrix expansion, scheduling and run control

pub mod context;
pub mod controller;
pub mod events;
pub mod graph;
pub mod matrix;
pub mod runner;
pub mod scheduler;
pub mod trigger;

// Re-export key types
pub use context::{EventKind, PullRequest, RunContext};
pub use controller::{RunController, RunHandle};
pub use events::{
    progress_channel, EventSender, ExecutionEvent, LogLevel, ProgressReceiver, ProgressSender,
    StateChange,
};
pub use graph::{ExecutionGraph, JobInstance, JobNode};
pub use matrix::{MatrixBinding, MatrixBuilder, MatrixExpander, MatrixSpec};
pub use runner::{interpolate, JobRunner, ResolvedInput, RunRequest};
pub use scheduler::{ScheduleOutcome, Scheduler};
pub use trigger::{branch_matches, TriggerSpec};
