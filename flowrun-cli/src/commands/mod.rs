pub mod plan;
pub mod run;
pub mod validate;

use crate::output;

use std::path::Path;

use clap::{Args, Subcommand};
use color_eyre::Result;

use pipeline_engine::{
    ConfigOverrides, EmptyMatrixPolicy, PipelineDeclaration, WorkflowParser,
    CONFIG_ERROR_EXIT_CODE,
};

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a pipeline declaration
    Run(run::RunArgs),
    /// Check a declaration without running anything
    Validate(validate::ValidateArgs),
    /// Show the execution order and matrix instances of a declaration
    Plan(plan::PlanArgs),
}

pub async fn handle_command(command: Commands) -> Result<()> {
    match command {
        Commands::Run(args) => run::execute(args).await,
        Commands::Validate(args) => validate::execute(args),
        Commands::Plan(args) => plan::execute(args),
    }
}

/// Run settings that override the declaration's `settings:` block
#[derive(Args, Debug, Default)]
pub struct SettingsArgs {
    /// Maximum job instances running at once
    #[arg(long, short = 'j', env = "FLOWRUN_MAX_PARALLEL", value_name = "N")]
    pub max_parallel: Option<usize>,

    /// Timeout for jobs that do not set their own
    #[arg(long, env = "FLOWRUN_TIMEOUT_MINUTES", value_name = "MINUTES")]
    pub timeout_minutes: Option<u64>,

    /// Seconds a cancelled job may take to stop before it is force-cancelled
    #[arg(long = "grace", env = "FLOWRUN_CANCEL_GRACE_SECS", value_name = "SECS")]
    pub cancel_grace_secs: Option<u64>,

    /// What to do with a matrix axis that has no values (warn or error)
    #[arg(long = "empty-matrix", env = "FLOWRUN_EMPTY_MATRIX", value_name = "POLICY")]
    pub empty_matrix_policy: Option<EmptyMatrixPolicy>,

    /// Retention for artifacts that do not set their own
    #[arg(long, env = "FLOWRUN_RETENTION_DAYS", value_name = "DAYS")]
    pub retention_days: Option<u32>,
}

impl SettingsArgs {
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            max_parallel: self.max_parallel,
            timeout_minutes: self.timeout_minutes,
            cancel_grace_secs: self.cancel_grace_secs,
            empty_matrix_policy: self.empty_matrix_policy,
            retention_days: self.retention_days,
        }
    }
}

/// Parse a declaration, exiting with the configuration error code on failure
pub fn load(path: &Path) -> Result<PipelineDeclaration> {
    if !path.exists() {
        color_eyre::eyre::bail!("Pipeline file not found: {}", path.display());
    }

    match WorkflowParser::from_file(path) {
        Ok(declaration) => Ok(declaration),
        Err(e) => {
            output::error(&format!("{}: {}", path.display(), e));
            std::process::exit(CONFIG_ERROR_EXIT_CODE);
        }
    }
}
