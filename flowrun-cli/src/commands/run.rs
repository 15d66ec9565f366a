use super::{load, SettingsArgs};
use crate::output;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use color_eyre::Result;

use pipeline_engine::execution::{progress_channel, LogLevel};
use pipeline_engine::{
    EventKind, ExecutionEvent, FsArtifactStore, InstanceState, PullRequest, RunContext,
    RunController, Shell, ShellExecutor, StepStatus, CONFIG_ERROR_EXIT_CODE,
};

/// Run a pipeline locally
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the pipeline YAML file
    pub pipeline: PathBuf,

    #[command(flatten)]
    pub settings: SettingsArgs,

    /// Event that triggers the run (push, pull_request, schedule, manual)
    #[arg(long, env = "FLOWRUN_EVENT", default_value = "push")]
    pub event: EventKind,

    /// Git ref of the run (`refs/heads/main` or a bare branch name)
    #[arg(long = "ref", env = "FLOWRUN_REF", default_value = "refs/heads/main")]
    pub git_ref: String,

    /// Commit sha of the run
    #[arg(long, env = "FLOWRUN_SHA", default_value = "0000000")]
    pub sha: String,

    /// User the run is attributed to (default: $USER)
    #[arg(long, env = "FLOWRUN_ACTOR")]
    pub actor: Option<String>,

    /// Pull request number, for pull_request runs
    #[arg(long, env = "FLOWRUN_PR_NUMBER")]
    pub pr_number: Option<u64>,

    /// Pull request title, for pull_request runs
    #[arg(long, env = "FLOWRUN_PR_TITLE")]
    pub pr_title: Option<String>,

    /// Pull request label (can be repeated)
    #[arg(long = "pr-label", value_name = "LABEL")]
    pub pr_labels: Vec<String>,

    /// Working directory for steps
    #[arg(long, short = 'w', env = "FLOWRUN_WORKING_DIR", value_name = "DIR")]
    pub working_dir: Option<PathBuf>,

    /// Artifact store directory (default: ~/.flowrun/artifacts)
    #[arg(long, env = "FLOWRUN_ARTIFACTS_DIR", value_name = "DIR")]
    pub artifacts_dir: Option<PathBuf>,

    /// Shell for steps that do not name one
    #[arg(long, env = "FLOWRUN_SHELL")]
    pub shell: Option<Shell>,
}

impl RunArgs {
    fn context(&self) -> RunContext {
        let actor = self
            .actor
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "local".to_string());

        let context = RunContext::new(self.event, self.git_ref.clone(), self.sha.clone(), actor);
        if self.pr_number.is_none() && self.pr_title.is_none() && self.pr_labels.is_empty() {
            return context;
        }

        context.with_pull_request(PullRequest {
            number: self.pr_number,
            title: self.pr_title.clone().unwrap_or_default(),
            labels: self.pr_labels.clone(),
        })
    }
}

pub async fn execute(args: RunArgs) -> Result<()> {
    let declaration = load(&args.pipeline)?;
    let context = args.context();
    tracing::debug!(run_id = %context.run_id, event = %context.event, git_ref = %context.git_ref, "run context");

    let working_dir = match &args.working_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };
    let mut executor = ShellExecutor::new(working_dir);
    if let Some(shell) = args.shell {
        executor = executor.with_default_shell(shell);
    }

    let store = FsArtifactStore::new(
        args.artifacts_dir
            .clone()
            .unwrap_or_else(FsArtifactStore::default_root),
    );
    match store.purge_expired(chrono::Utc::now()).await {
        Ok(0) => {}
        Ok(purged) => output::dim(&format!("Purged {} expired artifacts", purged)),
        Err(e) => output::warning(&format!("Could not purge expired artifacts: {}", e)),
    }

    output::status("Running", &format!("{}", args.pipeline.display()));
    output::info(&format!(
        "{} on {} ({} jobs)",
        context.event,
        context.branch(),
        declaration.jobs.len()
    ));

    let (tx, mut rx) = progress_channel();
    let controller = RunController::new()
        .with_executor(Arc::new(executor))
        .with_store(Arc::new(store))
        .with_overrides(args.settings.overrides())
        .with_progress(tx);

    let handle = controller.handle();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if handle.is_aborted() {
                output::error("Interrupted again, exiting without waiting for steps");
                std::process::exit(130);
            }
            output::warning("Interrupted, cancelling run (press Ctrl-C again to exit now)");
            handle.abort();
        }
    });

    // Spawn execution in background
    let exec_handle =
        tokio::spawn(async move { controller.execute(&declaration, context).await });

    // Process events in the foreground
    let mut names: HashMap<usize, String> = HashMap::new();
    while let Some(event) = rx.recv().await {
        match event {
            ExecutionEvent::RunStarted {
                pipeline,
                total_instances,
                ..
            } => {
                println!();
                output::header(&format!(
                    "Pipeline '{}' ({} instances)",
                    pipeline, total_instances
                ));
            }

            ExecutionEvent::RunCompleted { .. } => {}

            ExecutionEvent::InstanceStateChanged(change) => {
                names.insert(change.instance, change.name.clone());
                let reason = change.reason.as_ref().map(ToString::to_string);
                match change.to {
                    InstanceState::Running
                    | InstanceState::Succeeded
                    | InstanceState::Failed
                    | InstanceState::Skipped
                    | InstanceState::Cancelled => {
                        output::transition(&change.name, change.to, reason.as_deref())
                    }
                    _ => {}
                }
            }

            ExecutionEvent::StepStarted { name, step, .. } => {
                output::dim(&format!("[{}] > {}", name, step));
            }

            ExecutionEvent::StepOutput {
                instance,
                output: text,
                ..
            } => {
                let name = names.get(&instance).map(String::as_str).unwrap_or("?");
                for line in text.lines() {
                    output::step_output(name, line);
                }
            }

            ExecutionEvent::StepCompleted {
                name,
                step,
                status,
                exit_code,
                duration,
                ..
            } => {
                let exit_info = match exit_code {
                    Some(code) if code != 0 => format!(" (exit code: {})", code),
                    _ => String::new(),
                };
                let line = format!(
                    "[{}] {} {:?} ({:.2}s){}",
                    name,
                    step,
                    status,
                    duration.as_secs_f64(),
                    exit_info
                );
                match status {
                    StepStatus::Failed => output::failure(&line),
                    StepStatus::SucceededWithWarnings => output::warning(&line),
                    _ => output::dim(&line),
                }
            }

            ExecutionEvent::Log { level, message, .. } => match level {
                LogLevel::Error => output::error(&message),
                LogLevel::Warning => output::warning(&message),
                LogLevel::Info => output::dim(&message),
            },
        }
    }

    match exec_handle.await? {
        Ok(result) => {
            output::summary(&result);
            std::process::exit(result.exit_code());
        }
        Err(e) => {
            output::error(&e.to_string());
            std::process::exit(CONFIG_ERROR_EXIT_CODE);
        }
    }
}
