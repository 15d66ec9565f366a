// Execution Events
// Progress reporting for runs: instance state changes and step activity

use crate::models::{FailureReason, InstanceId, InstanceState, RunStatus, StepStatus};

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Sender for execution progress events
pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;

/// Receiver for execution progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// A job instance moved from one state to another
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub instance: InstanceId,
    pub name: String,
    pub job_id: String,
    pub from: InstanceState,
    pub to: InstanceState,
    pub at: DateTime<Utc>,
    pub reason: Option<FailureReason>,
}

/// Events emitted during a run
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// Graph built and instances materialized
    RunStarted {
        run_id: Uuid,
        pipeline: String,
        total_instances: usize,
    },

    /// Run finished, every instance is terminal
    RunCompleted {
        run_id: Uuid,
        status: RunStatus,
        duration: Duration,
    },

    /// Every state transition of every instance, in the order applied
    InstanceStateChanged(StateChange),

    StepStarted {
        instance: InstanceId,
        name: String,
        step_index: usize,
        step: String,
    },

    /// Captured step output (stdout and stderr, interleaved per line)
    StepOutput {
        instance: InstanceId,
        step_index: usize,
        output: String,
    },

    StepCompleted {
        instance: InstanceId,
        name: String,
        step_index: usize,
        step: String,
        status: StepStatus,
        exit_code: Option<i32>,
        duration: Duration,
    },

    /// Log message (info, warning, error)
    Log {
        level: LogLevel,
        message: String,
        instance: Option<String>,
    },
}

/// Log level for log events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl ExecutionEvent {
    pub fn run_started(run_id: Uuid, pipeline: impl Into<String>, total_instances: usize) -> Self {
        Self::RunStarted {
            run_id,
            pipeline: pipeline.into(),
            total_instances,
        }
    }

    pub fn run_completed(run_id: Uuid, status: RunStatus, duration: Duration) -> Self {
        Self::RunCompleted {
            run_id,
            status,
            duration,
        }
    }

    pub fn step_started(
        instance: InstanceId,
        name: impl Into<String>,
        step_index: usize,
        step: impl Into<String>,
    ) -> Self {
        Self::StepStarted {
            instance,
            name: name.into(),
            step_index,
            step: step.into(),
        }
    }

    pub fn step_output(instance: InstanceId, step_index: usize, output: impl Into<String>) -> Self {
        Self::StepOutput {
            instance,
            step_index,
            output: output.into(),
        }
    }

    pub fn info(message: impl Into<String>, instance: Option<String>) -> Self {
        Self::Log {
            level: LogLevel::Info,
            message: message.into(),
            instance,
        }
    }

    pub fn warning(message: impl Into<String>, instance: Option<String>) -> Self {
        Self::Log {
            level: LogLevel::Warning,
            message: message.into(),
            instance,
        }
    }

    pub fn error(message: impl Into<String>, instance: Option<String>) -> Self {
        Self::Log {
            level: LogLevel::Error,
            message: message.into(),
            instance,
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: ExecutionEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}
