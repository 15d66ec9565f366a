// Job Runner
// Executes one job instance: stage inputs, run steps in order, upload outputs

use crate::artifacts::{ArtifactKey, ArtifactStore};
use crate::config::ExecutorConfig;
use crate::error::StepError;
use crate::execution::context::RunContext;
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::graph::{JobInstance, JobNode};
use crate::execution::matrix::MatrixBinding;
use crate::expression::EvalScope;
use crate::models::{
    CommandSpec, FailureReason, JobConclusion, JobDefinition, JobOutcome, OutcomeStatus,
    StepRecord, StepStatus,
};
use crate::runners::StepExecutor;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// An artifact input resolved to a concrete producing instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedInput {
    pub key: ArtifactKey,
    /// Path handed to the executor's `stage_artifact`
    pub destination: String,
}

/// Everything a runner needs to know about one instance
pub struct RunRequest<'a> {
    pub instance: &'a JobInstance,
    pub node: &'a JobNode,
    pub inputs: &'a [ResolvedInput],
    /// Conclusions of the job's direct dependencies
    pub needs: &'a HashMap<String, JobConclusion>,
    /// Wall-clock budget for the whole instance
    pub budget: Duration,
}

/// Runs job instances against a step executor and an artifact store
#[derive(Clone)]
pub struct JobRunner {
    executor: Arc<dyn StepExecutor>,
    store: Arc<dyn ArtifactStore>,
    context: Arc<RunContext>,
    event_tx: Option<ProgressSender>,
    default_retention_days: u32,
}

impl JobRunner {
    pub fn new(
        executor: Arc<dyn StepExecutor>,
        store: Arc<dyn ArtifactStore>,
        context: Arc<RunContext>,
    ) -> Self {
        Self {
            executor,
            store,
            context,
            event_tx: None,
            default_retention_days: ExecutorConfig::default().default_retention_days,
        }
    }

    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn with_default_retention_days(mut self, days: u32) -> Self {
        self.default_retention_days = days;
        self
    }

    /// Run one instance to completion, timeout or cancellation.
    ///
    /// Never returns an error: every problem becomes part of the outcome.
    pub async fn run(&self, request: RunRequest<'_>, cancel: CancellationToken) -> JobOutcome {
        let start = Instant::now();
        let token = cancel.child_token();
        let mut steps = Vec::new();

        let timed = tokio::time::timeout(
            request.budget,
            self.run_steps(&request, &token, &mut steps),
        )
        .await;

        let status = match timed {
            Ok(status) => status,
            Err(_) => {
                token.cancel();
                tracing::warn!(
                    instance = %request.instance.name,
                    budget_secs = request.budget.as_secs(),
                    "job instance timed out"
                );
                OutcomeStatus::Failed(FailureReason::Timeout {
                    after: request.budget,
                })
            }
        };

        // Only a timeout or cancellation leaves steps unrecorded here
        mark_unfinished(&mut steps, request.node, StepStatus::Cancelled);

        JobOutcome::new(status, steps, start.elapsed())
    }

    async fn run_steps(
        &self,
        request: &RunRequest<'_>,
        cancel: &CancellationToken,
        steps: &mut Vec<StepRecord>,
    ) -> OutcomeStatus {
        let instance = request.instance;
        let definition = &request.node.definition;
        let deadline = Instant::now() + request.budget;

        if let Err(reason) = self.stage_inputs(instance, request.inputs).await {
            mark_unfinished(steps, request.node, StepStatus::Skipped);
            return OutcomeStatus::Failed(reason);
        }

        let base_env = self.base_env(instance, definition);
        let mut failure: Option<FailureReason> = None;
        let mut warnings: Vec<FailureReason> = Vec::new();

        for (index, step) in definition.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                return OutcomeStatus::Cancelled;
            }

            let scope = EvalScope::new(&self.context, request.needs)
                .with_matrix(&instance.binding)
                .with_upstream_failed(failure.is_some());
            let should_run = match &request.node.step_conditions[index] {
                Some(condition) => condition.evaluate(&scope),
                None => failure.is_none(),
            };

            if !should_run {
                tracing::debug!(instance = %instance.name, step = %step.name, "step skipped");
                steps.push(StepRecord::skipped(index, &step.name));
                continue;
            }

            let mut env = base_env.clone();
            for (key, value) in &step.env {
                env.insert(key.clone(), interpolate(value, &instance.binding));
            }
            let command = CommandSpec {
                run: interpolate(&step.command.run, &instance.binding),
                shell: step.command.shell.clone(),
            };

            self.event_tx.send_event(ExecutionEvent::step_started(
                instance.id,
                &instance.name,
                index,
                &step.name,
            ));

            let step_start = Instant::now();
            let remaining = deadline.saturating_duration_since(Instant::now());
            let result = self
                .executor
                .execute(&command, &env, remaining, cancel.clone())
                .await;

            let mut record = StepRecord {
                index,
                name: step.name.clone(),
                status: StepStatus::Succeeded,
                exit_code: None,
                duration: Duration::ZERO,
                output: String::new(),
                error: None,
            };

            let step_failure = match result {
                Ok(output) => {
                    record.exit_code = output.exit_code;
                    record.output = output.text();
                    if output.success() {
                        None
                    } else {
                        Some(FailureReason::StepFailed {
                            step_index: index,
                            step: step.name.clone(),
                            exit_code: output.exit_code,
                        })
                    }
                }
                Err(StepError::Cancelled) => {
                    record.status = StepStatus::Cancelled;
                    record.duration = step_start.elapsed();
                    steps.push(record);
                    return OutcomeStatus::Cancelled;
                }
                Err(StepError::TimedOut(_)) => {
                    record.status = StepStatus::Cancelled;
                    record.duration = step_start.elapsed();
                    steps.push(record);
                    return OutcomeStatus::Failed(FailureReason::Timeout {
                        after: request.budget,
                    });
                }
                Err(e) => {
                    record.error = Some(e.to_string());
                    Some(FailureReason::ExecutorError {
                        step_index: index,
                        step: step.name.clone(),
                        message: e.to_string(),
                    })
                }
            };
            record.duration = step_start.elapsed();

            if let Some(reason) = step_failure {
                if step.continue_on_error || definition.continue_on_error {
                    tracing::info!(instance = %instance.name, step = %step.name, %reason, "step failure tolerated");
                    record.status = StepStatus::SucceededWithWarnings;
                    warnings.push(reason);
                } else {
                    record.status = StepStatus::Failed;
                    failure.get_or_insert(reason);
                }
            }

            if !record.output.is_empty() {
                self.event_tx.send_event(ExecutionEvent::step_output(
                    instance.id,
                    index,
                    record.output.clone(),
                ));
            }
            self.event_tx.send_event(ExecutionEvent::StepCompleted {
                instance: instance.id,
                name: instance.name.clone(),
                step_index: index,
                step: step.name.clone(),
                status: record.status,
                exit_code: record.exit_code,
                duration: record.duration,
            });
            steps.push(record);
        }

        if let Some(reason) = failure {
            return OutcomeStatus::Failed(reason);
        }

        if cancel.is_cancelled() {
            return OutcomeStatus::Cancelled;
        }

        if let Err(reason) = self.upload_outputs(instance, definition).await {
            return OutcomeStatus::Failed(reason);
        }

        match warnings.into_iter().next() {
            Some(reason) => OutcomeStatus::SucceededWithWarnings(reason),
            None => OutcomeStatus::Succeeded,
        }
    }

    async fn stage_inputs(
        &self,
        instance: &JobInstance,
        inputs: &[ResolvedInput],
    ) -> Result<(), FailureReason> {
        for input in inputs {
            let data = self.store.get(&input.key).await.map_err(|e| {
                FailureReason::Artifact {
                    message: format!("download of '{}' failed: {}", input.key, e),
                }
            })?;

            self.executor
                .stage_artifact(&instance.name, &input.destination, &data)
                .await
                .map_err(|e| FailureReason::Artifact {
                    message: format!("staging '{}' failed: {}", input.key, e),
                })?;

            tracing::debug!(instance = %instance.name, artifact = %input.key, "artifact staged");
        }

        Ok(())
    }

    async fn upload_outputs(
        &self,
        instance: &JobInstance,
        definition: &JobDefinition,
    ) -> Result<(), FailureReason> {
        for output in &definition.artifact_outputs {
            let data = self
                .executor
                .collect_artifact(&instance.name, &output.path)
                .await
                .map_err(|e| FailureReason::Artifact {
                    message: format!("collecting '{}' failed: {}", output.name, e),
                })?;

            let key = ArtifactKey::new(self.context.run_id, &instance.name, &output.name);
            let retention = output
                .retention_days
                .unwrap_or(self.default_retention_days);

            self.store
                .put(&key, data, retention)
                .await
                .map_err(|e| FailureReason::Artifact {
                    message: format!("upload of '{}' failed: {}", key, e),
                })?;

            tracing::info!(instance = %instance.name, artifact = %key, "artifact uploaded");
        }

        Ok(())
    }

    /// Context variables, then job env, then matrix variables
    fn base_env(
        &self,
        instance: &JobInstance,
        definition: &JobDefinition,
    ) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = self.context.env_vars().into_iter().collect();
        env.insert("FLOWRUN_JOB".to_string(), instance.job_id.clone());
        env.insert("FLOWRUN_INSTANCE".to_string(), instance.name.clone());

        for (key, value) in &definition.env {
            env.insert(key.clone(), interpolate(value, &instance.binding));
        }
        env.extend(instance.binding.env_vars());

        env
    }
}

/// Record steps that never ran, so every step of the job is accounted for
fn mark_unfinished(steps: &mut Vec<StepRecord>, node: &JobNode, status: StepStatus) {
    for (index, step) in node.definition.steps.iter().enumerate().skip(steps.len()) {
        let mut record = StepRecord::skipped(index, &step.name);
        record.status = status;
        steps.push(record);
    }
}

/// Substitute `${{ matrix.<axis> }}` placeholders, leaving anything else untouched
pub fn interpolate(text: &str, binding: &MatrixBinding) -> String {
    let mut result = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("${{") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 3..];

        let Some(end) = after.find("}}") else {
            result.push_str(&rest[start..]);
            return result;
        };

        let expr = after[..end].trim();
        let value = expr
            .strip_prefix("matrix.")
            .and_then(|axis| binding.get(axis.trim()));

        match value {
            Some(value) => result.push_str(value),
            None => result.push_str(&rest[start..start + 3 + end + 2]),
        }
        rest = &after[end + 2..];
    }

    result.push_str(rest);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::MemoryArtifactStore;
    use crate::execution::context::EventKind;
    use crate::execution::graph::ExecutionGraph;
    use crate::execution::matrix::{MatrixExpander, MatrixSpec};
    use crate::models::StepSpec;
    use crate::runners::StepOutput;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Fails commands containing "fail", sleeps on "hang", records the rest
    #[derive(Default)]
    struct Scripted {
        commands: Mutex<Vec<String>>,
        staged: Mutex<Vec<(String, Vec<u8>)>>,
    }

    #[async_trait]
    impl StepExecutor for Scripted {
        async fn execute(
            &self,
            command: &CommandSpec,
            env: &HashMap<String, String>,
            timeout: Duration,
            cancel: CancellationToken,
        ) -> Result<StepOutput, StepError> {
            self.commands.lock().unwrap().push(command.run.clone());

            if command.run.contains("hang") {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => return Err(StepError::TimedOut(timeout)),
                    _ = cancel.cancelled() => return Err(StepError::Cancelled),
                }
            }
            if command.run.contains("fail") {
                return Ok(StepOutput::new(2, "boom"));
            }

            let echoed = env.get("MATRIX_PYTHON").cloned().unwrap_or_default();
            Ok(StepOutput::new(0, echoed))
        }

        async fn stage_artifact(
            &self,
            _instance: &str,
            path: &str,
            data: &[u8],
        ) -> Result<(), StepError> {
            self.staged
                .lock()
                .unwrap()
                .push((path.to_string(), data.to_vec()));
            Ok(())
        }

        async fn collect_artifact(&self, instance: &str, path: &str) -> Result<Vec<u8>, StepError> {
            if path == "missing" {
                return Err(StepError::Unsupported("missing path"));
            }
            Ok(format!("{}:{}", instance, path).into_bytes())
        }
    }

    struct Fixture {
        executor: Arc<Scripted>,
        store: Arc<MemoryArtifactStore>,
        runner: JobRunner,
        context: Arc<RunContext>,
    }

    fn fixture() -> Fixture {
        let executor = Arc::new(Scripted::default());
        let store = Arc::new(MemoryArtifactStore::new());
        let context = Arc::new(RunContext::new(EventKind::Push, "main", "abc", "octo"));
        let runner = JobRunner::new(executor.clone(), store.clone(), context.clone());
        Fixture {
            executor,
            store,
            runner,
            context,
        }
    }

    async fn run_job(
        fixture: &Fixture,
        definition: JobDefinition,
        budget: Duration,
    ) -> JobOutcome {
        let graph = ExecutionGraph::build(vec![definition]).unwrap();
        let instance = graph.instances().remove(0);
        let needs = HashMap::new();
        fixture
            .runner
            .run(
                RunRequest {
                    instance: &instance,
                    node: graph.node(0),
                    inputs: &[],
                    needs: &needs,
                    budget,
                },
                CancellationToken::new(),
            )
            .await
    }

    #[tokio::test]
    async fn test_steps_run_in_order() {
        let fx = fixture();
        let outcome = run_job(
            &fx,
            JobDefinition::new("lint").run("a", "echo a").run("b", "echo b"),
            Duration::from_secs(5),
        )
        .await;

        assert_eq!(outcome.status, OutcomeStatus::Succeeded);
        assert_eq!(
            *fx.executor.commands.lock().unwrap(),
            vec!["echo a".to_string(), "echo b".to_string()]
        );
    }

    #[tokio::test]
    async fn test_failure_skips_remaining_steps() {
        let fx = fixture();
        let outcome = run_job(
            &fx,
            JobDefinition::new("test")
                .run("setup", "echo setup")
                .run("pytest", "fail")
                .run("report", "echo report")
                .step(StepSpec::new("cleanup", "echo cleanup").with_condition("always()")),
            Duration::from_secs(5),
        )
        .await;

        assert_eq!(
            outcome.status,
            OutcomeStatus::Failed(FailureReason::StepFailed {
                step_index: 1,
                step: "pytest".to_string(),
                exit_code: Some(2),
            })
        );
        let statuses: Vec<StepStatus> = outcome.steps.iter().map(|s| s.status).collect();
        assert_eq!(
            statuses,
            vec![
                StepStatus::Succeeded,
                StepStatus::Failed,
                StepStatus::Skipped,
                StepStatus::Succeeded,
            ]
        );
    }

    #[tokio::test]
    async fn test_job_continue_on_error_keeps_going() {
        let fx = fixture();
        let outcome = run_job(
            &fx,
            JobDefinition::new("security")
                .continue_on_error(true)
                .run("audit", "fail")
                .run("report", "echo report"),
            Duration::from_secs(5),
        )
        .await;

        assert!(matches!(
            outcome.status,
            OutcomeStatus::SucceededWithWarnings(FailureReason::StepFailed { .. })
        ));
        assert_eq!(outcome.steps[1].status, StepStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_step_continue_on_error() {
        let fx = fixture();
        let outcome = run_job(
            &fx,
            JobDefinition::new("lint")
                .step(StepSpec::new("optional", "fail").continue_on_error(true))
                .run("required", "echo ok"),
            Duration::from_secs(5),
        )
        .await;

        assert!(outcome.is_success());
        assert_eq!(outcome.steps[0].status, StepStatus::SucceededWithWarnings);
    }

    #[tokio::test]
    async fn test_timeout_is_distinguished() {
        let fx = fixture();
        let outcome = run_job(
            &fx,
            JobDefinition::new("slow").run("wait", "hang").run("after", "echo"),
            Duration::from_millis(50),
        )
        .await;

        assert!(matches!(
            outcome.status,
            OutcomeStatus::Failed(FailureReason::Timeout { .. })
        ));
        assert_eq!(outcome.steps.len(), 2);
    }

    #[tokio::test]
    async fn test_outputs_are_uploaded() {
        let fx = fixture();
        let outcome = run_job(
            &fx,
            JobDefinition::new("build").run("b", "echo").upload("dist", "dist/app.whl"),
            Duration::from_secs(5),
        )
        .await;

        assert_eq!(outcome.status, OutcomeStatus::Succeeded);
        let key = ArtifactKey::new(fx.context.run_id, "build", "dist");
        assert_eq!(fx.store.get(&key).await.unwrap(), b"build:dist/app.whl");

        let records = fx.store.list(fx.context.run_id).await.unwrap();
        assert_eq!(
            records[0].retention_days,
            ExecutorConfig::default().default_retention_days
        );
    }

    #[tokio::test]
    async fn test_collect_failure_fails_job() {
        let fx = fixture();
        let outcome = run_job(
            &fx,
            JobDefinition::new("build")
                .continue_on_error(true)
                .run("b", "echo")
                .upload("dist", "missing"),
            Duration::from_secs(5),
        )
        .await;

        assert!(matches!(
            outcome.status,
            OutcomeStatus::Failed(FailureReason::Artifact { .. })
        ));
    }

    #[tokio::test]
    async fn test_inputs_are_staged() {
        let fx = fixture();
        let key = ArtifactKey::new(fx.context.run_id, "build", "dist");
        fx.store.put(&key, b"wheel".to_vec(), 7).await.unwrap();

        let graph = ExecutionGraph::build(vec![JobDefinition::new("deploy").run("d", "echo")])
            .unwrap();
        let instance = graph.instances().remove(0);
        let needs = HashMap::new();
        let inputs = vec![ResolvedInput {
            key,
            destination: "dist".to_string(),
        }];

        let outcome = fx
            .runner
            .run(
                RunRequest {
                    instance: &instance,
                    node: graph.node(0),
                    inputs: &inputs,
                    needs: &needs,
                    budget: Duration::from_secs(5),
                },
                CancellationToken::new(),
            )
            .await;

        assert!(outcome.is_success());
        assert_eq!(
            *fx.executor.staged.lock().unwrap(),
            vec![("dist".to_string(), b"wheel".to_vec())]
        );
    }

    #[tokio::test]
    async fn test_missing_input_fails_before_steps() {
        let fx = fixture();
        let graph = ExecutionGraph::build(vec![JobDefinition::new("deploy").run("d", "echo")])
            .unwrap();
        let instance = graph.instances().remove(0);
        let needs = HashMap::new();
        let inputs = vec![ResolvedInput {
            key: ArtifactKey::new(fx.context.run_id, "build", "dist"),
            destination: "dist".to_string(),
        }];

        let outcome = fx
            .runner
            .run(
                RunRequest {
                    instance: &instance,
                    node: graph.node(0),
                    inputs: &inputs,
                    needs: &needs,
                    budget: Duration::from_secs(5),
                },
                CancellationToken::new(),
            )
            .await;

        assert!(matches!(
            outcome.status,
            OutcomeStatus::Failed(FailureReason::Artifact { .. })
        ));
        assert!(fx.executor.commands.lock().unwrap().is_empty());
        assert_eq!(outcome.steps[0].status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn test_matrix_binding_reaches_env_and_command() {
        let fx = fixture();
        let spec = MatrixSpec::builder().axis("python", ["3.11"]).build();
        let outcome = run_job(
            &fx,
            JobDefinition::new("test")
                .with_matrix(spec)
                .run("pytest", "tox -e py${{ matrix.python }}"),
            Duration::from_secs(5),
        )
        .await;

        assert_eq!(outcome.steps[0].output, "3.11");
        assert_eq!(
            fx.executor.commands.lock().unwrap()[0],
            "tox -e py3.11"
        );
    }

    #[test]
    fn test_interpolate() {
        let spec = MatrixSpec::builder().axis("os", ["linux"]).build();
        let binding = &MatrixExpander::expand(&spec)[0];

        assert_eq!(interpolate("run-${{ matrix.os }}", binding), "run-linux");
        assert_eq!(
            interpolate("${{ secrets.TOKEN }} ${{matrix.os}}", binding),
            "${{ secrets.TOKEN }} linux"
        );
        assert_eq!(interpolate("open ${{ matrix.os", binding), "open ${{ matrix.os");
    }
}
