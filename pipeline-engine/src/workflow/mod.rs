// Pipeline Declarations
// YAML front-end producing the job definitions a run is built from

pub mod models;
pub mod parser;

pub use models::{
    Artifacts, Download, EventConfig, Job, JobNeeds, Matrix, Step, Strategy, Trigger, Upload,
    Workflow,
};
pub use parser::WorkflowParser;

use crate::config::ConfigOverrides;
use crate::execution::context::RunContext;
use crate::execution::trigger::{self, TriggerSpec};
use crate::models::JobDefinition;

use serde::{Deserialize, Serialize};

/// A parsed pipeline: triggers, settings and jobs in declaration order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineDeclaration {
    pub name: String,
    /// Empty means the pipeline runs for every event
    #[serde(default)]
    pub triggers: Vec<TriggerSpec>,
    #[serde(default)]
    pub settings: ConfigOverrides,
    pub jobs: Vec<JobDefinition>,
}

impl PipelineDeclaration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn trigger(mut self, trigger: TriggerSpec) -> Self {
        self.triggers.push(trigger);
        self
    }

    pub fn job(mut self, job: JobDefinition) -> Self {
        self.jobs.push(job);
        self
    }

    pub fn with_settings(mut self, settings: ConfigOverrides) -> Self {
        self.settings = settings;
        self
    }

    /// Does this context start the pipeline?
    pub fn matches(&self, context: &RunContext) -> bool {
        trigger::any_matches(&self.triggers, context)
    }
}
