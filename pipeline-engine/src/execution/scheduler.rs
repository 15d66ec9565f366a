// Scheduler
// Drives job instances through their state machine with bounded concurrency

use crate::artifacts::ArtifactKey;
use crate::config::ExecutorConfig;
use crate::execution::context::RunContext;
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender, StateChange};
use crate::execution::graph::{ExecutionGraph, JobInstance};
use crate::execution::runner::{JobRunner, ResolvedInput, RunRequest};
use crate::expression::EvalScope;
use crate::models::{
    FailureReason, InstanceId, InstanceResult, InstanceState, JobConclusion, JobOutcome,
    OutcomeStatus, StepRecord,
};

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// What the scheduler hands back once every instance is terminal
#[derive(Debug, Clone)]
pub struct ScheduleOutcome {
    pub instances: Vec<InstanceResult>,
    /// The run was aborted through its cancellation token
    pub aborted: bool,
}

/// Mutable bookkeeping for one instance
struct InstanceRecord {
    instance: JobInstance,
    state: InstanceState,
    warnings: bool,
    reason: Option<FailureReason>,
    steps: Vec<StepRecord>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

/// Decision taken for a job once all of its dependencies are terminal
enum Resolution {
    Ready,
    Skip(FailureReason),
    Cancel(FailureReason),
}

/// Status table of a run. Owned by the scheduler loop only, so every
/// transition and the readiness recomputation it triggers happen in one step.
struct RunState {
    records: Vec<InstanceRecord>,
    /// Instance ids per job index
    by_job: Vec<Vec<InstanceId>>,
    /// Conclusions of direct dependencies, captured when a job resolves
    needs: HashMap<usize, HashMap<String, JobConclusion>>,
    /// Ready instances in admission order
    queue: VecDeque<InstanceId>,
    running_per_job: Vec<usize>,
    aborted: bool,
    event_tx: Option<ProgressSender>,
}

impl RunState {
    fn new(graph: &ExecutionGraph, event_tx: Option<ProgressSender>) -> Self {
        let mut by_job = vec![Vec::new(); graph.len()];
        let records = graph
            .instances()
            .into_iter()
            .map(|instance| {
                by_job[instance.job].push(instance.id);
                InstanceRecord {
                    instance,
                    state: InstanceState::Pending,
                    warnings: false,
                    reason: None,
                    steps: Vec::new(),
                    started_at: None,
                    finished_at: None,
                }
            })
            .collect();

        Self {
            records,
            by_job,
            needs: HashMap::new(),
            queue: VecDeque::new(),
            running_per_job: vec![0; graph.len()],
            aborted: false,
            event_tx,
        }
    }

    fn state(&self, id: InstanceId) -> InstanceState {
        self.records[id].state
    }

    /// Apply one edge of the state machine and report it
    fn transition(&mut self, id: InstanceId, to: InstanceState, reason: Option<FailureReason>) {
        let record = &mut self.records[id];
        let from = record.state;

        if !from.can_transition_to(to) {
            tracing::error!(instance = %record.instance.name, %from, %to, "rejected invalid state transition");
            return;
        }

        let now = Utc::now();
        record.state = to;
        if reason.is_some() {
            record.reason = reason.clone();
        }
        if to == InstanceState::Running {
            record.started_at = Some(now);
        }
        if to.is_terminal() {
            record.finished_at = Some(now);
        }

        tracing::debug!(instance = %record.instance.name, %from, %to, "instance state changed");

        self.event_tx
            .send_event(ExecutionEvent::InstanceStateChanged(StateChange {
                instance: id,
                name: record.instance.name.clone(),
                job_id: record.instance.job_id.clone(),
                from,
                to,
                at: now,
                reason,
            }));
    }

    fn job_is_terminal(&self, job: usize) -> bool {
        self.by_job[job]
            .iter()
            .all(|&id| self.records[id].state.is_terminal())
    }

    fn conclusion(&self, job: usize) -> JobConclusion {
        JobConclusion::from_states(self.by_job[job].iter().map(|&id| self.records[id].state))
    }

    /// Cancel everything that has not started. Running instances keep
    /// their slot until they report back or the grace period runs out.
    fn abort(&mut self) {
        self.aborted = true;
        self.queue.clear();

        for id in 0..self.records.len() {
            let state = self.state(id);
            if !state.is_terminal() && state != InstanceState::Running {
                self.transition(id, InstanceState::Cancelled, Some(FailureReason::RunCancelled));
            }
        }
    }
}

/// Schedules the instances of an execution graph onto a job runner
pub struct Scheduler {
    graph: Arc<ExecutionGraph>,
    runner: JobRunner,
    context: Arc<RunContext>,
    config: ExecutorConfig,
    event_tx: Option<ProgressSender>,
}

impl Scheduler {
    pub fn new(graph: Arc<ExecutionGraph>, runner: JobRunner, context: Arc<RunContext>) -> Self {
        Self {
            graph,
            runner,
            context,
            config: ExecutorConfig::default(),
            event_tx: None,
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config.normalized();
        self
    }

    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Run every instance to a terminal state.
    ///
    /// Cancelling `cancel` aborts the run: instances that have not started
    /// are cancelled at once, running ones are signalled and force-marked
    /// cancelled after the grace period.
    pub async fn run(&self, cancel: CancellationToken) -> ScheduleOutcome {
        let mut state = RunState::new(&self.graph, self.event_tx.clone());
        let slots = Arc::new(Semaphore::new(self.config.max_parallel));
        let mut tasks: JoinSet<(InstanceId, JobOutcome)> = JoinSet::new();

        tracing::info!(
            instances = state.records.len(),
            max_parallel = self.config.max_parallel,
            "scheduling run"
        );

        loop {
            if cancel.is_cancelled() && !state.aborted {
                tracing::info!("run cancelled, stopping remaining instances");
                state.abort();
            }

            self.settle(&mut state);
            self.admit(&mut state, &slots, &mut tasks, &cancel);

            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                biased;

                _ = cancel.cancelled(), if !state.aborted => {
                    tracing::info!("run cancelled, stopping remaining instances");
                    state.abort();
                }

                joined = tasks.join_next() => match joined {
                    Some(Ok((id, outcome))) => self.finish(&mut state, id, outcome),
                    Some(Err(e)) => tracing::error!(error = %e, "instance task failed to join"),
                    None => {}
                },
            }
        }

        self.close_out(&mut state);

        let aborted = state.aborted;
        let instances = state
            .records
            .into_iter()
            .map(|record| InstanceResult {
                id: record.instance.id,
                matrix: (!record.instance.binding.is_empty())
                    .then(|| record.instance.binding.values().clone()),
                job_id: record.instance.job_id,
                name: record.instance.name,
                state: record.state,
                warnings: record.warnings,
                reason: record.reason,
                steps: record.steps,
                started_at: record.started_at,
                finished_at: record.finished_at,
            })
            .collect();

        ScheduleOutcome { instances, aborted }
    }

    /// Resolve every job whose dependencies allow it, in topological order
    /// so that skips and cancellations cascade within a single pass
    fn settle(&self, state: &mut RunState) {
        let mut ready = Vec::new();

        for job in self.graph.topological_order() {
            let waiting: Vec<InstanceId> = state.by_job[job]
                .iter()
                .copied()
                .filter(|&id| {
                    matches!(state.state(id), InstanceState::Pending | InstanceState::Blocked)
                })
                .collect();
            if waiting.is_empty() {
                continue;
            }

            let node = self.graph.node(job);
            let unresolved = node
                .dependencies
                .iter()
                .any(|&dep| !state.job_is_terminal(dep));

            if unresolved {
                for id in waiting {
                    if state.state(id) == InstanceState::Pending {
                        state.transition(id, InstanceState::Blocked, None);
                    }
                }
                continue;
            }

            match self.resolve(state, job) {
                Resolution::Ready => {
                    for id in waiting {
                        state.transition(id, InstanceState::Ready, None);
                        ready.push(id);
                    }
                }
                Resolution::Skip(reason) => {
                    tracing::info!(job = node.id(), %reason, "job skipped");
                    for id in waiting {
                        state.transition(id, InstanceState::Skipped, Some(reason.clone()));
                    }
                }
                Resolution::Cancel(reason) => {
                    tracing::info!(job = node.id(), %reason, "job cancelled");
                    for id in waiting {
                        state.transition(id, InstanceState::Cancelled, Some(reason.clone()));
                    }
                }
            }
        }

        // FIFO across passes, deterministic within one
        ready.sort_by(|&a, &b| {
            let (a, b) = (&state.records[a].instance, &state.records[b].instance);
            a.job_id
                .cmp(&b.job_id)
                .then(a.matrix_index().cmp(&b.matrix_index()))
        });
        state.queue.extend(ready);
    }

    fn resolve(&self, state: &mut RunState, job: usize) -> Resolution {
        if state.aborted {
            return Resolution::Cancel(FailureReason::RunCancelled);
        }

        let node = self.graph.node(job);
        let mut needs = HashMap::new();
        let mut failed_dependency = None;

        for &dep in &node.dependencies {
            let conclusion = state.conclusion(dep);
            if matches!(conclusion, JobConclusion::Failure | JobConclusion::Cancelled)
                && failed_dependency.is_none()
            {
                failed_dependency = Some(self.graph.node(dep).id().to_string());
            }
            needs.insert(self.graph.node(dep).id().to_string(), conclusion);
        }

        let upstream_failed = failed_dependency.is_some();
        let resolution = match failed_dependency {
            Some(dependency) if !node.is_status_aware() => {
                Resolution::Cancel(FailureReason::DependencyFailed { job: dependency })
            }
            _ => {
                let scope = EvalScope::new(&self.context, &needs)
                    .with_upstream_failed(upstream_failed)
                    .with_run_cancelled(state.aborted);
                let activated = match &node.condition {
                    Some(condition) => condition.evaluate(&scope),
                    None => !upstream_failed,
                };

                if activated {
                    Resolution::Ready
                } else {
                    Resolution::Skip(FailureReason::ConditionFalse)
                }
            }
        };

        state.needs.insert(job, needs);
        resolution
    }

    /// Start queued instances while slots are free. An instance whose job is
    /// at its own `max_parallel` cap stays queued without blocking later ones.
    fn admit(
        &self,
        state: &mut RunState,
        slots: &Arc<Semaphore>,
        tasks: &mut JoinSet<(InstanceId, JobOutcome)>,
        cancel: &CancellationToken,
    ) {
        while !state.aborted {
            let position = state.queue.iter().position(|&id| {
                let job = state.records[id].instance.job;
                let cap = self.graph.node(job).definition.max_parallel;
                cap.map(|cap| state.running_per_job[job] < cap)
                    .unwrap_or(true)
            });
            let Some(position) = position else {
                break;
            };

            let Ok(permit) = slots.clone().try_acquire_owned() else {
                break;
            };

            let Some(id) = state.queue.remove(position) else {
                break;
            };
            self.spawn_instance(state, id, permit, tasks, cancel);
        }
    }

    fn spawn_instance(
        &self,
        state: &mut RunState,
        id: InstanceId,
        permit: tokio::sync::OwnedSemaphorePermit,
        tasks: &mut JoinSet<(InstanceId, JobOutcome)>,
        cancel: &CancellationToken,
    ) {
        let instance = state.records[id].instance.clone();
        let job = instance.job;
        let definition = &self.graph.node(job).definition;

        let inputs = self.resolve_inputs(state, job);
        let needs = state.needs.get(&job).cloned().unwrap_or_default();
        let budget = definition
            .timeout
            .unwrap_or(self.config.default_job_timeout);

        state.running_per_job[job] += 1;
        state.transition(id, InstanceState::Running, None);
        tracing::info!(instance = %instance.name, "instance started");

        let graph = self.graph.clone();
        let runner = self.runner.clone();
        let token = cancel.clone();
        let stop = cancel.clone();
        let grace = self.config.cancel_grace_period;

        tasks.spawn(async move {
            let _permit = permit;
            let started = Instant::now();

            // A nested task turns a panicking runner into a failed instance
            let mut work = tokio::spawn(async move {
                let request = RunRequest {
                    instance: &instance,
                    node: graph.node(instance.job),
                    inputs: &inputs,
                    needs: &needs,
                    budget,
                };
                runner.run(request, token).await
            });

            let outcome = tokio::select! {
                joined = &mut work => match joined {
                    Ok(outcome) => outcome,
                    Err(e) => JobOutcome::new(
                        OutcomeStatus::Failed(FailureReason::Internal {
                            message: e.to_string(),
                        }),
                        Vec::new(),
                        started.elapsed(),
                    ),
                },
                _ = grace_expired(stop, grace) => {
                    work.abort();
                    JobOutcome::cancelled(Vec::new(), started.elapsed())
                }
            };

            (id, outcome)
        });
    }

    /// Artifacts a job downloads, bound to the instances that produced them.
    /// Producers that did not succeed contribute nothing.
    fn resolve_inputs(&self, state: &RunState, job: usize) -> Vec<ResolvedInput> {
        let mut resolved = Vec::new();

        for input in &self.graph.node(job).definition.artifact_inputs {
            let Some(producer) = self.graph.index_of(&input.job) else {
                continue;
            };
            let producers = &state.by_job[producer];
            let fan_out = producers.len() > 1;

            for &pid in producers {
                let record = &state.records[pid];
                if record.state != InstanceState::Succeeded {
                    continue;
                }

                let destination = if fan_out {
                    format!("{}/{}", input.destination(), record.instance.name)
                } else {
                    input.destination().to_string()
                };

                resolved.push(ResolvedInput {
                    key: ArtifactKey::new(self.context.run_id, &record.instance.name, &input.name),
                    destination,
                });
            }
        }

        resolved
    }

    /// Fold a runner outcome into the status table
    fn finish(&self, state: &mut RunState, id: InstanceId, outcome: JobOutcome) {
        let job = state.records[id].instance.job;
        state.running_per_job[job] = state.running_per_job[job].saturating_sub(1);
        state.records[id].steps = outcome.steps;

        if state.aborted {
            if outcome.status != OutcomeStatus::Cancelled {
                let name = state.records[id].instance.name.clone();
                tracing::warn!(instance = %name, "discarding result that arrived after cancellation");
                state.event_tx.send_event(ExecutionEvent::warning(
                    format!("{}: result arrived after cancellation and was discarded", name),
                    Some(name.clone()),
                ));
            }
            state.transition(id, InstanceState::Cancelled, Some(FailureReason::RunCancelled));
            return;
        }

        tracing::info!(
            instance = %state.records[id].instance.name,
            duration_ms = outcome.duration.as_millis() as u64,
            status = ?outcome.status,
            "instance finished"
        );

        match outcome.status {
            OutcomeStatus::Succeeded => {
                state.transition(id, InstanceState::Succeeded, None);
            }
            OutcomeStatus::SucceededWithWarnings(reason) => {
                state.records[id].warnings = true;
                state.transition(id, InstanceState::Succeeded, Some(reason));
            }
            OutcomeStatus::Failed(reason) => {
                state.transition(id, InstanceState::Failed, Some(reason));
                if self.graph.node(job).definition.fail_fast {
                    self.cancel_siblings(state, id);
                }
            }
            OutcomeStatus::Cancelled => {
                state.transition(id, InstanceState::Cancelled, Some(FailureReason::RunCancelled));
            }
        }
    }

    /// Fail-fast: cancel sibling instances that have not started yet
    fn cancel_siblings(&self, state: &mut RunState, failed: InstanceId) {
        let job = state.records[failed].instance.job;
        let sibling = state.records[failed].instance.name.clone();
        let pending: Vec<InstanceId> = state.by_job[job]
            .iter()
            .copied()
            .filter(|&id| {
                matches!(
                    state.state(id),
                    InstanceState::Pending | InstanceState::Blocked | InstanceState::Ready
                )
            })
            .collect();

        if pending.is_empty() {
            return;
        }

        tracing::info!(instance = %sibling, cancelled = pending.len(), "fail-fast cancelling siblings");
        state.queue.retain(|id| !pending.contains(id));
        for id in pending {
            state.transition(
                id,
                InstanceState::Cancelled,
                Some(FailureReason::FailFast {
                    sibling: sibling.clone(),
                }),
            );
        }
    }

    /// Nothing may leave the scheduler non-terminal
    fn close_out(&self, state: &mut RunState) {
        for id in 0..state.records.len() {
            match state.state(id) {
                InstanceState::Running => {
                    tracing::error!(instance = %state.records[id].instance.name, "instance lost its task");
                    let reason = if state.aborted {
                        FailureReason::RunCancelled
                    } else {
                        FailureReason::Internal {
                            message: "instance task ended without an outcome".to_string(),
                        }
                    };
                    let to = if state.aborted {
                        InstanceState::Cancelled
                    } else {
                        InstanceState::Failed
                    };
                    state.transition(id, to, Some(reason));
                }
                s if !s.is_terminal() => {
                    tracing::error!(instance = %state.records[id].instance.name, state = %s, "instance never resolved");
                    state.transition(
                        id,
                        InstanceState::Cancelled,
                        Some(FailureReason::Internal {
                            message: format!("instance left {} when the run ended", s),
                        }),
                    );
                }
                _ => {}
            }
        }
    }
}

/// Completes once `stop` fired and the grace period has passed
async fn grace_expired(stop: CancellationToken, grace: Duration) {
    stop.cancelled().await;
    tokio::time::sleep(grace).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::MemoryArtifactStore;
    use crate::error::StepError;
    use crate::execution::context::EventKind;
    use crate::execution::events::progress_channel;
    use crate::execution::matrix::MatrixSpec;
    use crate::models::{CommandSpec, JobDefinition};
    use crate::runners::{StepExecutor, StepOutput};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records start order; "fail" exits 1, "hang" ignores cancellation
    #[derive(Default)]
    struct Recorder {
        started: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl StepExecutor for Recorder {
        async fn execute(
            &self,
            command: &CommandSpec,
            env: &HashMap<String, String>,
            _timeout: Duration,
            _cancel: CancellationToken,
        ) -> Result<StepOutput, StepError> {
            let instance = env.get("FLOWRUN_INSTANCE").cloned().unwrap_or_default();
            self.started.lock().unwrap().push(instance);

            tokio::time::sleep(Duration::from_millis(10)).await;
            if command.run == "hang" {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            if command.run == "fail" {
                return Ok(StepOutput::new(1, ""));
            }
            Ok(StepOutput::new(0, ""))
        }
    }

    fn fixture(
        jobs: Vec<JobDefinition>,
        config: ExecutorConfig,
    ) -> (Arc<Recorder>, Scheduler) {
        let executor = Arc::new(Recorder::default());
        let context = Arc::new(RunContext::new(EventKind::Push, "main", "abc", "octo"));
        let runner = JobRunner::new(
            executor.clone(),
            Arc::new(MemoryArtifactStore::new()),
            context.clone(),
        );
        let graph = Arc::new(ExecutionGraph::build(jobs).unwrap());
        let scheduler = Scheduler::new(graph, runner, context).with_config(config);
        (executor, scheduler)
    }

    fn state_of(outcome: &ScheduleOutcome, name: &str) -> InstanceState {
        outcome
            .instances
            .iter()
            .find(|i| i.name == name)
            .map(|i| i.state)
            .unwrap()
    }

    #[tokio::test]
    async fn test_single_slot_admits_in_job_id_order() {
        let (executor, scheduler) = fixture(
            vec![
                JobDefinition::new("zeta").run("s", "ok"),
                JobDefinition::new("alpha").run("s", "ok"),
                JobDefinition::new("mid").run("s", "ok"),
            ],
            ExecutorConfig::default().with_max_parallel(1),
        );

        let outcome = scheduler.run(CancellationToken::new()).await;

        assert!(!outcome.aborted);
        assert_eq!(
            *executor.started.lock().unwrap(),
            vec!["alpha".to_string(), "mid".to_string(), "zeta".to_string()]
        );
    }

    #[tokio::test]
    async fn test_dependents_wait_for_every_matrix_instance() {
        let matrix = MatrixSpec::builder().axis("python", ["3.10", "3.11"]).build();
        let (executor, scheduler) = fixture(
            vec![
                JobDefinition::new("test").with_matrix(matrix).run("s", "ok"),
                JobDefinition::new("build").needs(["test"]).run("s", "ok"),
            ],
            ExecutorConfig::default().with_max_parallel(4),
        );

        let outcome = scheduler.run(CancellationToken::new()).await;

        let started = executor.started.lock().unwrap().clone();
        assert_eq!(started.last().map(String::as_str), Some("build"));
        assert_eq!(state_of(&outcome, "build"), InstanceState::Succeeded);
    }

    #[tokio::test]
    async fn test_fail_fast_cancels_queued_siblings() {
        let matrix = MatrixSpec::builder().axis("shard", ["1", "2", "3"]).build();
        let (_executor, scheduler) = fixture(
            vec![JobDefinition::new("test")
                .with_matrix(matrix)
                .fail_fast(true)
                .run("s", "fail")],
            ExecutorConfig::default().with_max_parallel(1),
        );

        let outcome = scheduler.run(CancellationToken::new()).await;

        assert_eq!(state_of(&outcome, "test[0]"), InstanceState::Failed);
        for name in ["test[1]", "test[2]"] {
            let instance = outcome.instances.iter().find(|i| i.name == name).unwrap();
            assert_eq!(instance.state, InstanceState::Cancelled);
            assert_eq!(
                instance.reason,
                Some(FailureReason::FailFast {
                    sibling: "test[0]".to_string()
                })
            );
        }
    }

    #[tokio::test]
    async fn test_without_fail_fast_siblings_still_run() {
        let matrix = MatrixSpec::builder().axis("shard", ["1", "2"]).build();
        let (executor, scheduler) = fixture(
            vec![JobDefinition::new("test")
                .with_matrix(matrix)
                .run("s", "fail")],
            ExecutorConfig::default().with_max_parallel(1),
        );

        let outcome = scheduler.run(CancellationToken::new()).await;

        assert_eq!(executor.started.lock().unwrap().len(), 2);
        assert_eq!(state_of(&outcome, "test[1]"), InstanceState::Failed);
    }

    #[tokio::test]
    async fn test_job_max_parallel_lets_other_jobs_through() {
        let matrix = MatrixSpec::builder().axis("shard", ["1", "2"]).build();
        let (executor, scheduler) = fixture(
            vec![
                JobDefinition::new("a-matrix")
                    .with_matrix(matrix)
                    .with_max_parallel(1)
                    .run("s", "ok"),
                JobDefinition::new("b-single").run("s", "ok"),
            ],
            ExecutorConfig::default().with_max_parallel(2),
        );

        scheduler.run(CancellationToken::new()).await;

        let mut first_two = executor.started.lock().unwrap()[..2].to_vec();
        first_two.sort();
        assert_eq!(first_two, vec!["a-matrix[0]".to_string(), "b-single".to_string()]);
    }

    #[tokio::test]
    async fn test_abort_forces_running_instances_after_grace() {
        let (_executor, scheduler) = fixture(
            vec![
                JobDefinition::new("slow").run("s", "hang"),
                JobDefinition::new("after").needs(["slow"]).run("s", "ok"),
            ],
            ExecutorConfig::default()
                .with_max_parallel(2)
                .with_cancel_grace_period(Duration::from_millis(50)),
        );

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let outcome = scheduler.run(cancel).await;

        assert!(outcome.aborted);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(state_of(&outcome, "slow"), InstanceState::Cancelled);
        assert_eq!(state_of(&outcome, "after"), InstanceState::Cancelled);
    }

    #[tokio::test]
    async fn test_transitions_are_reported_in_order() {
        let (tx, mut rx) = progress_channel();
        let (_executor, scheduler) = fixture(
            vec![JobDefinition::new("lint").run("s", "ok")],
            ExecutorConfig::default(),
        );
        let scheduler = scheduler.with_progress(tx);

        scheduler.run(CancellationToken::new()).await;
        drop(scheduler);

        let mut path = vec![InstanceState::Pending];
        while let Some(event) = rx.recv().await {
            if let ExecutionEvent::InstanceStateChanged(change) = event {
                assert_eq!(Some(&change.from), path.last());
                path.push(change.to);
            }
        }
        assert_eq!(
            path,
            vec![
                InstanceState::Pending,
                InstanceState::Ready,
                InstanceState::Running,
                InstanceState::Succeeded,
            ]
        );
    }
}
