// Run Context
// Immutable facts describing why and how the current run was triggered

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use std::fmt;
use std::str::FromStr;

/// Kind of event that triggered a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Push,
    PullRequest,
    Schedule,
    Manual,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::Push,
        EventKind::PullRequest,
        EventKind::Schedule,
        EventKind::Manual,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Push => "push",
            EventKind::PullRequest => "pull_request",
            EventKind::Schedule => "schedule",
            EventKind::Manual => "manual",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "push" => Ok(EventKind::Push),
            "pull_request" | "pull-request" | "pr" => Ok(EventKind::PullRequest),
            "schedule" => Ok(EventKind::Schedule),
            // workflow_dispatch is the vendor spelling of a manual run
            "manual" | "workflow_dispatch" => Ok(EventKind::Manual),
            other => Err(format!("unknown event kind '{}'", other)),
        }
    }
}

/// Pull request metadata attached to `pull_request` runs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: Option<u64>,
    pub title: String,
    #[serde(default)]
    pub labels: Vec<String>,
}

/// Snapshot of the invoking environment, created once per run.
///
/// Shared read-only (behind an `Arc`) by the scheduler, the job runners and
/// the condition evaluator; nothing mutates it after the run starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunContext {
    pub run_id: Uuid,
    pub event: EventKind,
    /// Full ref (`refs/heads/main`) or bare branch name (`main`)
    pub git_ref: String,
    pub sha: String,
    pub actor: String,
    pub pull_request: Option<PullRequest>,
}

impl RunContext {
    pub fn new(
        event: EventKind,
        git_ref: impl Into<String>,
        sha: impl Into<String>,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            event,
            git_ref: git_ref.into(),
            sha: sha.into(),
            actor: actor.into(),
            pull_request: None,
        }
    }

    pub fn with_pull_request(mut self, pull_request: PullRequest) -> Self {
        self.pull_request = Some(pull_request);
        self
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    /// Branch name with any `refs/heads/` prefix removed
    pub fn branch(&self) -> &str {
        self.git_ref
            .strip_prefix("refs/heads/")
            .unwrap_or(&self.git_ref)
    }

    pub fn pr_title(&self) -> &str {
        self.pull_request
            .as_ref()
            .map(|pr| pr.title.as_str())
            .unwrap_or("")
    }

    pub fn pr_labels(&self) -> &[String] {
        self.pull_request
            .as_ref()
            .map(|pr| pr.labels.as_slice())
            .unwrap_or(&[])
    }

    /// Environment variables exposing the context to step commands
    pub fn env_vars(&self) -> Vec<(String, String)> {
        let mut vars = vec![
            ("CI".to_string(), "true".to_string()),
            ("FLOWRUN_RUN_ID".to_string(), self.run_id.to_string()),
            ("FLOWRUN_EVENT".to_string(), self.event.to_string()),
            ("FLOWRUN_REF".to_string(), self.git_ref.clone()),
            ("FLOWRUN_BRANCH".to_string(), self.branch().to_string()),
            ("FLOWRUN_SHA".to_string(), self.sha.clone()),
            ("FLOWRUN_ACTOR".to_string(), self.actor.clone()),
        ];

        if let Some(pr) = &self.pull_request {
            vars.push(("FLOWRUN_PR_TITLE".to_string(), pr.title.clone()));
            if let Some(number) = pr.number {
                vars.push(("FLOWRUN_PR_NUMBER".to_string(), number.to_string()));
            }
        }

        vars
    }
}
