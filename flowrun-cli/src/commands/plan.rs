use super::{load, SettingsArgs};
use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use pipeline_engine::execution::MatrixExpander;
use pipeline_engine::{RunController, CONFIG_ERROR_EXIT_CODE};

/// Show the execution order and matrix instances of a pipeline
#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Path to the pipeline YAML file
    pub pipeline: PathBuf,

    #[command(flatten)]
    pub settings: SettingsArgs,
}

pub fn execute(args: PlanArgs) -> Result<()> {
    let declaration = load(&args.pipeline)?;
    let controller = RunController::new().with_overrides(args.settings.overrides());
    let config = controller.effective_config(&declaration);

    let graph = match controller.plan(&declaration) {
        Ok(graph) => graph,
        Err(e) => {
            output::error(&e.to_string());
            std::process::exit(CONFIG_ERROR_EXIT_CODE);
        }
    };

    output::header(&format!("Pipeline '{}'", declaration.name));
    if declaration.triggers.is_empty() {
        output::dim("  triggers: any event");
    }
    for trigger in &declaration.triggers {
        let mut line = format!("  on {}", trigger.event);
        if !trigger.branches.is_empty() {
            line.push_str(&format!(" branches [{}]", trigger.branches.join(", ")));
        }
        if !trigger.branches_ignore.is_empty() {
            line.push_str(&format!(" ignoring [{}]", trigger.branches_ignore.join(", ")));
        }
        output::dim(&line);
    }
    output::dim(&format!(
        "  max-parallel {}, timeout {}m, grace {}s, retention {}d, empty matrix: {}",
        config.max_parallel,
        config.default_job_timeout.as_secs() / 60,
        config.cancel_grace_period.as_secs(),
        config.default_retention_days,
        config.empty_matrix_policy,
    ));
    println!();

    for (number, batch) in graph.topological_batches().iter().enumerate() {
        println!("Batch {}", number + 1);
        for &job in batch {
            let Some(idx) = graph.index_of(job) else {
                continue;
            };
            let node = graph.node(idx);
            let definition = &node.definition;

            let mut line = format!("  {}", job);
            if !definition.needs.is_empty() {
                line.push_str(&format!("  needs [{}]", definition.needs.join(", ")));
            }
            if let Some(condition) = &definition.condition {
                line.push_str(&format!("  if {}", condition));
            }
            println!("{}", line);

            if node.has_matrix() {
                let bindings = graph.expand(idx);
                if bindings.is_empty() {
                    output::warning(&format!("{} has an empty matrix axis, no instances", job));
                }
                if let Some(spec) = &definition.matrix {
                    let crossed = MatrixExpander::cross_product_size(spec);
                    if crossed != bindings.len() {
                        output::dim(&format!(
                            "    {} of {} combinations after include/exclude",
                            bindings.len(),
                            crossed
                        ));
                    }
                }
                for binding in bindings {
                    println!("    {}[{}]  {}", job, binding.index(), binding);
                }
            }
        }
    }

    println!();
    output::info(&format!(
        "{} jobs, {} instances",
        graph.len(),
        graph.instances().len()
    ));

    Ok(())
}
