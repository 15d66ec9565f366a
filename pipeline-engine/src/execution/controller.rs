// Run Controller
// Entry point for a run: builds the graph, drives the scheduler, aggregates results

use crate::artifacts::{ArtifactStore, MemoryArtifactStore};
use crate::config::{ConfigOverrides, ExecutorConfig};
use crate::error::ConfigError;
use crate::execution::context::RunContext;
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::graph::ExecutionGraph;
use crate::execution::runner::JobRunner;
use crate::execution::scheduler::Scheduler;
use crate::models::{RunResult, RunStatus};
use crate::runners::{ShellExecutor, StepExecutor};
use crate::workflow::PipelineDeclaration;

use chrono::Utc;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

/// Token of the run in progress, replaced at the start of every run
type CancelSlot = Arc<Mutex<CancellationToken>>;

fn current(slot: &CancelSlot) -> MutexGuard<'_, CancellationToken> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Aborts a run from outside the controller (for example on Ctrl-C)
#[derive(Debug, Clone)]
pub struct RunHandle {
    cancel: CancelSlot,
}

impl RunHandle {
    pub fn abort(&self) {
        tracing::info!("run abort requested");
        current(&self.cancel).cancel();
    }

    /// Whether the current run has been aborted
    pub fn is_aborted(&self) -> bool {
        current(&self.cancel).is_cancelled()
    }
}

/// Executes pipeline declarations.
///
/// A controller drives one run at a time; its [`RunHandle`] aborts whichever
/// run is in progress.
pub struct RunController {
    config: ExecutorConfig,
    overrides: ConfigOverrides,
    executor: Arc<dyn StepExecutor>,
    store: Arc<dyn ArtifactStore>,
    event_tx: Option<ProgressSender>,
    cancel: CancelSlot,
}

impl RunController {
    /// Controller running steps in local shells from the current directory,
    /// with an in-memory artifact store
    pub fn new() -> Self {
        let working_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            config: ExecutorConfig::default(),
            overrides: ConfigOverrides::default(),
            executor: Arc::new(ShellExecutor::new(working_dir)),
            store: Arc::new(MemoryArtifactStore::new()),
            event_tx: None,
            cancel: Arc::new(Mutex::new(CancellationToken::new())),
        }
    }

    /// Base configuration, below the declaration's `settings:` block
    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Overrides that win over the declaration's `settings:` block
    pub fn with_overrides(mut self, overrides: ConfigOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn StepExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn handle(&self) -> RunHandle {
        RunHandle {
            cancel: self.cancel.clone(),
        }
    }

    /// Effective configuration for a declaration: base, then settings,
    /// then overrides
    pub fn effective_config(&self, declaration: &PipelineDeclaration) -> ExecutorConfig {
        self.config
            .clone()
            .apply(&declaration.settings)
            .apply(&self.overrides)
            .normalized()
    }

    /// Validate a declaration into its execution graph without running it
    pub fn plan(&self, declaration: &PipelineDeclaration) -> Result<ExecutionGraph, ConfigError> {
        let config = self.effective_config(declaration);
        ExecutionGraph::build_with_policy(declaration.jobs.clone(), config.empty_matrix_policy)
    }

    /// Run a declaration against a context.
    ///
    /// Only an invalid graph is an error; job failures, skips and aborts are
    /// all reported in the returned [`RunResult`].
    pub async fn execute(
        &self,
        declaration: &PipelineDeclaration,
        context: RunContext,
    ) -> Result<RunResult, ConfigError> {
        let started_at = Utc::now();
        let run_id = context.run_id;
        let cancel = {
            let mut slot = current(&self.cancel);
            *slot = CancellationToken::new();
            slot.clone()
        };

        if !declaration.matches(&context) {
            tracing::info!(
                pipeline = %declaration.name,
                event = %context.event,
                branch = context.branch(),
                "triggers did not match, nothing to run"
            );
            let finished_at = Utc::now();
            self.event_tx.send_event(ExecutionEvent::run_completed(
                run_id,
                RunStatus::NotTriggered,
                std::time::Duration::ZERO,
            ));
            return Ok(RunResult {
                run_id,
                pipeline: declaration.name.clone(),
                status: RunStatus::NotTriggered,
                instances: Vec::new(),
                started_at,
                finished_at,
            });
        }

        let config = self.effective_config(declaration);
        let graph = Arc::new(ExecutionGraph::build_with_policy(
            declaration.jobs.clone(),
            config.empty_matrix_policy,
        )?);
        for node in graph.nodes() {
            let Some(spec) = &node.definition.matrix else {
                continue;
            };
            for axis in spec.empty_axes() {
                self.event_tx.send_event(ExecutionEvent::warning(
                    format!("job '{}': matrix axis '{}' has no values", node.id(), axis),
                    None,
                ));
            }
        }

        let context = Arc::new(context);
        let mut runner = JobRunner::new(self.executor.clone(), self.store.clone(), context.clone())
            .with_default_retention_days(config.default_retention_days);
        if let Some(tx) = &self.event_tx {
            runner = runner.with_progress(tx.clone());
        }

        let mut scheduler = Scheduler::new(graph.clone(), runner, context).with_config(config);
        if let Some(tx) = &self.event_tx {
            scheduler = scheduler.with_progress(tx.clone());
        }

        let total = graph.instances().len();
        tracing::info!(
            pipeline = %declaration.name,
            %run_id,
            jobs = graph.len(),
            instances = total,
            "run started"
        );
        self.event_tx
            .send_event(ExecutionEvent::run_started(run_id, &declaration.name, total));

        let outcome = scheduler.run(cancel).await;
        let status = RunResult::aggregate_status(&outcome.instances, outcome.aborted);

        let result = RunResult {
            run_id,
            pipeline: declaration.name.clone(),
            status,
            instances: outcome.instances,
            started_at,
            finished_at: Utc::now(),
        };

        tracing::info!(%run_id, %status, duration_ms = result.duration().as_millis() as u64, "run finished");
        self.event_tx
            .send_event(ExecutionEvent::run_completed(run_id, status, result.duration()));

        Ok(result)
    }
}

impl Default for RunController {
    fn default() -> Self {
        Self::new()
    }
}
