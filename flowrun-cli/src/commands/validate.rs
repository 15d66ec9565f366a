use super::{load, SettingsArgs};
use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use pipeline_engine::{RunController, CONFIG_ERROR_EXIT_CODE};

/// Validate a pipeline YAML file
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the pipeline YAML file
    pub pipeline: PathBuf,

    #[command(flatten)]
    pub settings: SettingsArgs,
}

pub fn execute(args: ValidateArgs) -> Result<()> {
    output::status("Validating", &format!("{}", args.pipeline.display()));

    // Step 1: YAML syntax and declaration shape
    let declaration = load(&args.pipeline)?;
    output::check("Declaration parsed");

    let steps: usize = declaration.jobs.iter().map(|j| j.steps.len()).sum();
    output::check(&format!(
        "Structure: {} jobs, {} steps, {} triggers",
        declaration.jobs.len(),
        steps,
        declaration.triggers.len()
    ));

    // Step 2: dependencies, conditions, matrices and artifact bindings
    let controller = RunController::new().with_overrides(args.settings.overrides());
    match controller.plan(&declaration) {
        Ok(graph) => {
            output::check(&format!(
                "Graph valid: {} batches, {} instances",
                graph.topological_batches().len(),
                graph.instances().len()
            ));
        }
        Err(e) => {
            output::error(&e.to_string());
            std::process::exit(CONFIG_ERROR_EXIT_CODE);
        }
    }

    println!();
    output::success("Pipeline is valid");

    Ok(())
}
