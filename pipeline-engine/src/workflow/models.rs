use crate::config::ConfigOverrides;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A pipeline declaration as written in YAML.
///
/// This mirrors the document structure; [`WorkflowParser`](super::WorkflowParser)
/// lowers it into engine job definitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Pipeline name shown in run output
    #[serde(default)]
    pub name: Option<String>,

    /// Events that start the pipeline; absent means every event
    #[serde(default, rename = "on")]
    pub on: Option<Trigger>,

    /// Executor settings, below CLI flags and environment variables
    #[serde(default)]
    pub settings: ConfigOverrides,

    /// Pipeline-level environment variables, inherited by every job
    #[serde(default)]
    pub env: IndexMap<String, String>,

    /// Jobs in declaration order
    pub jobs: IndexMap<String, Job>,
}

/// Trigger configuration for when the pipeline should run.
///
/// Supports multiple trigger formats:
/// - Simple: `on: push`
/// - List: `on: [push, pull_request]`
/// - Detailed: `on: { push: { branches: [main] } }`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Trigger {
    Single(String),
    Multiple(Vec<String>),
    Detailed(IndexMap<String, Option<EventConfig>>),
}

/// Filters for one trigger event.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EventConfig {
    #[serde(default)]
    pub branches: Vec<String>,

    #[serde(default, rename = "branches-ignore")]
    pub branches_ignore: Vec<String>,
}

/// A job within a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Display name for the job
    #[serde(default)]
    pub name: Option<String>,

    /// Jobs that must complete before this job runs
    #[serde(default)]
    pub needs: JobNeeds,

    /// Conditional expression for job execution
    #[serde(default, rename = "if")]
    pub if_condition: Option<String>,

    /// Job-level environment variables
    #[serde(default)]
    pub env: IndexMap<String, String>,

    /// Matrix strategy for running multiple job instances
    #[serde(default)]
    pub strategy: Option<Strategy>,

    /// The steps that make up this job
    #[serde(default)]
    pub steps: Vec<Step>,

    /// Artifact handoff between jobs
    #[serde(default)]
    pub artifacts: Artifacts,

    /// Job timeout in minutes
    #[serde(default, rename = "timeout-minutes")]
    pub timeout_minutes: Option<u64>,

    /// Step failures become warnings instead of failing the job
    #[serde(default, rename = "continue-on-error")]
    pub continue_on_error: bool,
}

/// Job dependencies - can be a single string or a list.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum JobNeeds {
    #[default]
    None,
    Single(String),
    Multiple(Vec<String>),
}

impl JobNeeds {
    /// Convert to a vector of job IDs.
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            JobNeeds::None => vec![],
            JobNeeds::Single(s) => vec![s.clone()],
            JobNeeds::Multiple(v) => v.clone(),
        }
    }
}

/// Strategy configuration for matrix builds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    #[serde(default)]
    pub matrix: Option<Matrix>,

    /// Cancel sibling instances that have not started once one fails
    #[serde(default, rename = "fail-fast")]
    pub fail_fast: bool,

    /// Maximum number of instances of this job running at once
    #[serde(default, rename = "max-parallel")]
    pub max_parallel: Option<usize>,
}

/// Matrix configuration for parallel job execution.
///
/// Axis values are scalars; quote versions such as `"3.10"` so YAML does
/// not read them as numbers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Matrix {
    /// Additional matrix combinations to include
    #[serde(default)]
    pub include: Vec<IndexMap<String, Value>>,

    /// Matrix combinations to exclude
    #[serde(default)]
    pub exclude: Vec<IndexMap<String, Value>>,

    /// Matrix axes (dynamic keys), in declaration order
    #[serde(flatten)]
    pub dimensions: IndexMap<String, Vec<Value>>,
}

/// A step within a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Display name for the step
    #[serde(default)]
    pub name: Option<String>,

    /// Conditional expression for step execution
    #[serde(default, rename = "if")]
    pub if_condition: Option<String>,

    /// Shell command to run
    pub run: String,

    /// Shell to use for the run command
    #[serde(default)]
    pub shell: Option<String>,

    /// Step-level environment variables
    #[serde(default)]
    pub env: IndexMap<String, String>,

    /// Whether to continue the job if this step fails
    #[serde(default, rename = "continue-on-error")]
    pub continue_on_error: bool,
}

impl Step {
    /// Get a display name for the step.
    pub fn display_name(&self, index: usize) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }

        let first_line = self.run.lines().next().unwrap_or("").trim();
        if first_line.is_empty() {
            format!("step {}", index + 1)
        } else if first_line.chars().count() > 50 {
            let truncated: String = first_line.chars().take(47).collect();
            format!("{}...", truncated)
        } else {
            first_line.to_string()
        }
    }
}

/// Upload and download bindings of a job
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Artifacts {
    #[serde(default)]
    pub upload: Vec<Upload>,

    #[serde(default)]
    pub download: Vec<Download>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Upload {
    pub name: String,
    pub path: String,

    #[serde(default, rename = "retention-days")]
    pub retention_days: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Download {
    /// Producing job id
    pub job: String,
    pub name: String,

    /// Destination path, defaults to the artifact name
    #[serde(default)]
    pub path: Option<String>,
}
