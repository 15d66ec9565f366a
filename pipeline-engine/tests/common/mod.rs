// Shared fixtures for engine integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use pipeline_engine::execution::progress_channel;
use pipeline_engine::{
    CommandSpec, EventKind, ExecutionEvent, ExecutorConfig, InstanceState, MemoryArtifactStore,
    RunContext, RunController, StepError, StepExecutor, StepOutput,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Step executor whose behaviour is driven by the command text:
///
/// - `fail` exits 1
/// - `fail-if:<python>` exits 1 when `MATRIX_PYTHON` equals the value
/// - `hang` waits for cancellation or its timeout
/// - `stubborn` ignores cancellation for 30 seconds
/// - anything else succeeds after a short delay
pub struct Scripted {
    delay: Duration,
    current: AtomicUsize,
    pub peak: AtomicUsize,
    pub started: Mutex<Vec<String>>,
    pub staged: Mutex<Vec<(String, String, Vec<u8>)>>,
}

impl Scripted {
    pub fn new() -> Arc<Self> {
        Self::with_delay(Duration::from_millis(20))
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            started: Mutex::new(Vec::new()),
            staged: Mutex::new(Vec::new()),
        })
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn staged(&self) -> Vec<(String, String, Vec<u8>)> {
        self.staged.lock().unwrap().clone()
    }
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
        let instance = env.get("FLOWRUN_INSTANCE").cloned().unwrap_or_default();
        self.started.lock().unwrap().push(instance);

        let running = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        let result = self.run(command, env, timeout, cancel).await;
        self.current.fetch_sub(1, Ordering::SeqCst);

        result
    }

    async fn stage_artifact(&self, instance: &str, path: &str, data: &[u8]) -> Result<(), StepError> {
        self.staged
            .lock()
            .unwrap()
            .push((instance.to_string(), path.to_string(), data.to_vec()));
        Ok(())
    }

    async fn collect_artifact(&self, instance: &str, path: &str) -> Result<Vec<u8>, StepError> {
        Ok(format!("{}:{}", instance, path).into_bytes())
    }
}

impl Scripted {
    async fn run(
        &self,
        command: &CommandSpec,
        env: &HashMap<String, String>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<StepOutput, StepError> {
        let script = command.run.as_str();

        if script == "hang" {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => return Err(StepError::TimedOut(timeout)),
                _ = cancel.cancelled() => return Err(StepError::Cancelled),
            }
        }
        if script == "stubborn" {
            tokio::time::sleep(Duration::from_secs(30)).await;
            return Ok(StepOutput::new(0, "finished anyway"));
        }

        tokio::time::sleep(self.delay).await;

        if script == "fail" {
            return Ok(StepOutput::new(1, "failed"));
        }
        if let Some(version) = script.strip_prefix("fail-if:") {
            if env.get("MATRIX_PYTHON").map(String::as_str) == Some(version) {
                return Ok(StepOutput::new(1, format!("python {} failed", version)));
            }
        }

        Ok(StepOutput::new(0, script))
    }
}

pub fn context(branch: &str) -> RunContext {
    RunContext::new(EventKind::Push, format!("refs/heads/{}", branch), "0a1b2c3", "octocat")
}

pub fn controller(executor: Arc<Scripted>, max_parallel: usize) -> RunController {
    RunController::new()
        .with_executor(executor)
        .with_store(Arc::new(MemoryArtifactStore::new()))
        .with_config(
            ExecutorConfig::default()
                .with_max_parallel(max_parallel)
                .with_cancel_grace_period(Duration::from_millis(100)),
        )
}

/// Attach a progress channel and return the collected events once the
/// controller is dropped
pub fn with_events(
    controller: RunController,
) -> (RunController, tokio::sync::mpsc::UnboundedReceiver<ExecutionEvent>) {
    let (tx, rx) = progress_channel();
    (controller.with_progress(tx), rx)
}

pub async fn drain(mut rx: tokio::sync::mpsc::UnboundedReceiver<ExecutionEvent>) -> Vec<ExecutionEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

/// State path of each instance, in the order transitions were reported
pub fn state_paths(events: &[ExecutionEvent]) -> HashMap<String, Vec<InstanceState>> {
    let mut paths: HashMap<String, Vec<InstanceState>> = HashMap::new();
    for event in events {
        if let ExecutionEvent::InstanceStateChanged(change) = event {
            let path = paths
                .entry(change.name.clone())
                .or_insert_with(|| vec![InstanceState::Pending]);
            assert_eq!(
                path.last(),
                Some(&change.from),
                "{} reported a transition from a state it was not in",
                change.name
            );
            path.push(change.to);
        }
    }
    paths
}
