use crate::error::DeclarationError;
use crate::execution::context::EventKind;
use crate::execution::matrix::{MatrixBuilder, MatrixSpec};
use crate::execution::trigger::TriggerSpec;
use crate::models::{CommandSpec, JobDefinition, StepSpec};
use crate::workflow::models::{EventConfig, Job, Matrix, Trigger, Workflow};
use crate::workflow::PipelineDeclaration;

use indexmap::IndexMap;
use serde_json::Value;

use std::path::Path;
use std::time::Duration;

/// Parser for pipeline declaration YAML files.
pub struct WorkflowParser;

impl WorkflowParser {
    /// Parse a declaration from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<PipelineDeclaration, DeclarationError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let mut declaration = Self::parse(&content)?;

        if declaration.name.is_empty() {
            declaration.name = path
                .as_ref()
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "pipeline".to_string());
        }

        Ok(declaration)
    }

    /// Parse a declaration from a YAML string.
    ///
    /// Only the document shape is checked here; graph-level validation
    /// (dependencies, cycles, conditions) happens when the graph is built.
    pub fn parse(content: &str) -> Result<PipelineDeclaration, DeclarationError> {
        let workflow: Workflow = serde_yaml::from_str(content)?;
        Self::lower(workflow)
    }

    /// Turn the YAML document into engine job definitions
    pub fn lower(workflow: Workflow) -> Result<PipelineDeclaration, DeclarationError> {
        let triggers = match &workflow.on {
            Some(trigger) => Self::triggers(trigger)?,
            None => Vec::new(),
        };

        let mut jobs = Vec::with_capacity(workflow.jobs.len());
        for (id, job) in &workflow.jobs {
            jobs.push(Self::job(id, job, &workflow.env)?);
        }

        Ok(PipelineDeclaration {
            name: workflow.name.clone().unwrap_or_default(),
            triggers,
            settings: workflow.settings.clone(),
            jobs,
        })
    }

    fn triggers(trigger: &Trigger) -> Result<Vec<TriggerSpec>, DeclarationError> {
        let mut triggers = Vec::new();

        match trigger {
            Trigger::Single(name) => triggers.push(TriggerSpec::new(event_kind(name)?)),
            Trigger::Multiple(names) => {
                for name in names {
                    triggers.push(TriggerSpec::new(event_kind(name)?));
                }
            }
            Trigger::Detailed(events) => {
                for (name, config) in events {
                    let EventConfig {
                        branches,
                        branches_ignore,
                    } = config.clone().unwrap_or_default();
                    triggers.push(
                        TriggerSpec::new(event_kind(name)?)
                            .with_branches(branches)
                            .with_branches_ignore(branches_ignore),
                    );
                }
            }
        }

        Ok(triggers)
    }

    fn job(
        id: &str,
        job: &Job,
        pipeline_env: &IndexMap<String, String>,
    ) -> Result<JobDefinition, DeclarationError> {
        let mut definition = JobDefinition::new(id).needs(job.needs.to_vec());
        definition.name = job.name.clone();
        definition.condition = job.if_condition.clone();
        definition.continue_on_error = job.continue_on_error;
        definition.timeout = job
            .timeout_minutes
            .map(|minutes| Duration::from_secs(minutes * 60));

        let mut env = pipeline_env.clone();
        env.extend(job.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        definition.env = env;

        if let Some(strategy) = &job.strategy {
            definition.fail_fast = strategy.fail_fast;
            definition.max_parallel = strategy.max_parallel;
            if let Some(matrix) = &strategy.matrix {
                definition.matrix = Some(Self::matrix(id, matrix)?);
            }
        }

        for (index, step) in job.steps.iter().enumerate() {
            let mut command = CommandSpec::new(step.run.clone());
            if let Some(shell) = &step.shell {
                command = command.with_shell(shell.clone());
            }

            let mut spec = StepSpec::new(step.display_name(index), step.run.clone())
                .with_command(command)
                .continue_on_error(step.continue_on_error);
            spec.condition = step.if_condition.clone();
            spec.env = step.env.clone();
            definition.steps.push(spec);
        }

        for upload in &job.artifacts.upload {
            definition = definition.upload(upload.name.clone(), upload.path.clone());
            if let Some(output) = definition.artifact_outputs.last_mut() {
                output.retention_days = upload.retention_days;
            }
        }
        for download in &job.artifacts.download {
            definition = definition.download(
                download.job.clone(),
                download.name.clone(),
                download.path.clone(),
            );
        }

        Ok(definition)
    }

    fn matrix(job: &str, matrix: &Matrix) -> Result<MatrixSpec, DeclarationError> {
        let mut builder = MatrixBuilder::new();

        for (axis, values) in &matrix.dimensions {
            let values = values
                .iter()
                .map(|v| scalar(job, axis, v))
                .collect::<Result<Vec<_>, _>>()?;
            builder = builder.axis(axis.clone(), values);
        }
        for entry in &matrix.exclude {
            builder = builder.exclude(Self::combination(job, entry)?);
        }
        for entry in &matrix.include {
            builder = builder.include(Self::combination(job, entry)?);
        }

        Ok(builder.build())
    }

    fn combination(
        job: &str,
        entry: &IndexMap<String, Value>,
    ) -> Result<Vec<(String, String)>, DeclarationError> {
        entry
            .iter()
            .map(|(axis, value)| scalar(job, axis, value).map(|v| (axis.clone(), v)))
            .collect()
    }
}

fn event_kind(name: &str) -> Result<EventKind, DeclarationError> {
    name.parse()
        .map_err(|_| DeclarationError::UnknownEvent(name.to_string()))
}

/// Matrix values must be scalars; numbers and booleans keep their YAML text
fn scalar(job: &str, axis: &str, value: &Value) -> Result<String, DeclarationError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(DeclarationError::Invalid(format!(
            "job '{}': matrix value for '{}' must be a scalar, got {}",
            job, axis, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmptyMatrixPolicy;
    use crate::execution::context::RunContext;
    use crate::execution::matrix::MatrixExpander;

    const CI: &str = r#"
name: ci
on:
  push:
    branches: [main, develop]
  pull_request:
settings:
  max-parallel: 4
  empty-matrix-policy: error
env:
  PYTHONUNBUFFERED: "1"
jobs:
  quality-check:
    steps:
      - name: Lint
        run: ruff check .
  test:
    needs: quality-check
    strategy:
      fail-fast: true
      max-parallel: 2
      matrix:
        python: ["3.8", "3.9", "3.10", "3.11"]
        exclude:
          - python: "3.8"
    steps:
      - run: pytest --cov
        env:
          COVERAGE_FILE: .coverage.${{ matrix.python }}
  build:
    needs: [test]
    timeout-minutes: 20
    steps:
      - run: python -m build
    artifacts:
      upload:
        - name: dist
          path: dist
          retention-days: 30
  deploy-staging:
    needs: build
    if: branch == 'develop'
    steps:
      - name: Deploy
        run: ./deploy.sh staging
        continue-on-error: true
    artifacts:
      download:
        - job: build
          name: dist
"#;

    fn parse() -> PipelineDeclaration {
        WorkflowParser::parse(CI).unwrap()
    }

    #[test]
    fn test_jobs_keep_declaration_order() {
        let declaration = parse();
        let ids: Vec<&str> = declaration.jobs.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["quality-check", "test", "build", "deploy-staging"]);
        assert_eq!(declaration.name, "ci");
    }

    #[test]
    fn test_needs_forms() {
        let declaration = parse();
        assert_eq!(declaration.jobs[1].needs, vec!["quality-check".to_string()]);
        assert_eq!(declaration.jobs[2].needs, vec!["test".to_string()]);
    }

    #[test]
    fn test_strategy_is_lowered() {
        let declaration = parse();
        let test = &declaration.jobs[1];

        assert!(test.fail_fast);
        assert_eq!(test.max_parallel, Some(2));
        let bindings = MatrixExpander::expand(test.matrix.as_ref().unwrap());
        let versions: Vec<&str> = bindings.iter().filter_map(|b| b.get("python")).collect();
        assert_eq!(versions, vec!["3.9", "3.10", "3.11"]);
    }

    #[test]
    fn test_env_layers_and_step_names() {
        let declaration = parse();
        let test = &declaration.jobs[1];

        assert_eq!(test.env.get("PYTHONUNBUFFERED").map(String::as_str), Some("1"));
        assert_eq!(test.steps[0].name, "pytest --cov");
        assert_eq!(
            test.steps[0].env.get("COVERAGE_FILE").map(String::as_str),
            Some(".coverage.${{ matrix.python }}")
        );
    }

    #[test]
    fn test_artifacts_and_timeout() {
        let declaration = parse();
        let build = &declaration.jobs[2];
        let deploy = &declaration.jobs[3];

        assert_eq!(build.timeout, Some(Duration::from_secs(20 * 60)));
        assert_eq!(build.artifact_outputs[0].retention_days, Some(30));
        assert_eq!(deploy.artifact_inputs[0].job, "build");
        assert_eq!(deploy.artifact_inputs[0].destination(), "dist");
        assert!(deploy.steps[0].continue_on_error);
    }

    #[test]
    fn test_settings_and_triggers() {
        let declaration = parse();
        assert_eq!(declaration.settings.max_parallel, Some(4));
        assert_eq!(
            declaration.settings.empty_matrix_policy,
            Some(EmptyMatrixPolicy::Error)
        );

        assert_eq!(declaration.triggers.len(), 2);
        assert!(declaration.matches(&RunContext::new(EventKind::Push, "develop", "abc", "octo")));
        assert!(!declaration.matches(&RunContext::new(EventKind::Push, "feature/x", "abc", "octo")));
        assert!(declaration.matches(&RunContext::new(
            EventKind::PullRequest,
            "feature/x",
            "abc",
            "octo"
        )));
    }

    #[test]
    fn test_trigger_shorthands() {
        let single = WorkflowParser::parse("on: push\njobs: {}\n").unwrap();
        assert_eq!(single.triggers, vec![TriggerSpec::new(EventKind::Push)]);

        let list = WorkflowParser::parse("on: [push, workflow_dispatch]\njobs: {}\n").unwrap();
        assert_eq!(list.triggers[1].event, EventKind::Manual);

        let none = WorkflowParser::parse("jobs: {}\n").unwrap();
        assert!(none.triggers.is_empty());
    }

    #[test]
    fn test_unknown_event_is_rejected() {
        let err = WorkflowParser::parse("on: release\njobs: {}\n").unwrap_err();
        assert!(matches!(err, DeclarationError::UnknownEvent(e) if e == "release"));
    }

    #[test]
    fn test_nested_matrix_value_is_rejected() {
        let yaml = "jobs:\n  t:\n    strategy:\n      matrix:\n        os: [[a]]\n    steps:\n      - run: x\n";
        assert!(matches!(
            WorkflowParser::parse(yaml),
            Err(DeclarationError::Invalid(_))
        ));
    }

    #[test]
    fn test_step_without_run_is_a_yaml_error() {
        let yaml = "jobs:\n  t:\n    steps:\n      - name: nothing\n";
        assert!(matches!(
            WorkflowParser::parse(yaml),
            Err(DeclarationError::Yaml(_))
        ));
    }

    #[test]
    fn test_from_file_defaults_name_to_file_stem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nightly.yml");
        std::fs::write(&path, "jobs:\n  a:\n    steps:\n      - run: echo\n").unwrap();

        let declaration = WorkflowParser::from_file(&path).unwrap();
        assert_eq!(declaration.name, "nightly");
        assert_eq!(declaration.jobs.len(), 1);
    }
}
