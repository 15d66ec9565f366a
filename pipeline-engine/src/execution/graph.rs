// Execution Graph (DAG) Builder
// Validates job definitions and resolves them into an ordered, instance-expandable DAG

use crate::config::EmptyMatrixPolicy;
use crate::error::ConfigError;
use crate::execution::matrix::{MatrixBinding, MatrixExpander};
use crate::expression::{CompileScope, CompiledCondition, EvalScope};
use crate::models::{InstanceId, JobDefinition};

use std::collections::{HashMap, HashSet, VecDeque};

/// A node representing a job in the execution graph
#[derive(Debug, Clone)]
pub struct JobNode {
    pub definition: JobDefinition,
    /// Indices of direct dependencies, in `needs` order
    pub dependencies: Vec<usize>,
    /// Indices of jobs that directly need this one
    pub dependents: Vec<usize>,
    pub condition: Option<CompiledCondition>,
    /// Compiled step conditions, parallel to `definition.steps`
    pub step_conditions: Vec<Option<CompiledCondition>>,
}

impl JobNode {
    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn has_matrix(&self) -> bool {
        self.definition
            .matrix
            .as_ref()
            .map(|m| !m.is_empty())
            .unwrap_or(false)
    }

    /// Status-aware conditions run even when a dependency failed
    pub fn is_status_aware(&self) -> bool {
        self.condition
            .as_ref()
            .map(CompiledCondition::is_status_aware)
            .unwrap_or(false)
    }
}

/// One concrete execution of a job for one matrix binding
#[derive(Debug, Clone, PartialEq)]
pub struct JobInstance {
    pub id: InstanceId,
    /// Index of the job node
    pub job: usize,
    pub job_id: String,
    /// `job` or `job[index]`
    pub name: String,
    pub binding: MatrixBinding,
}

impl JobInstance {
    pub fn matrix_index(&self) -> usize {
        self.binding.index()
    }
}

/// Execution graph of a run's jobs
#[derive(Debug, Clone)]
pub struct ExecutionGraph {
    nodes: Vec<JobNode>,
    indices: HashMap<String, usize>,
    batches: Vec<Vec<usize>>,
}

impl ExecutionGraph {
    /// Build a graph, treating empty matrix axes as a warning
    pub fn build(definitions: Vec<JobDefinition>) -> Result<Self, ConfigError> {
        Self::build_with_policy(definitions, EmptyMatrixPolicy::Warn)
    }

    /// Build and validate a graph from job definitions.
    ///
    /// Checks run in order: duplicate ids, self and unknown dependencies,
    /// cycles, conditions, matrices, then artifact bindings. The first
    /// problem found is returned.
    pub fn build_with_policy(
        definitions: Vec<JobDefinition>,
        empty_matrix: EmptyMatrixPolicy,
    ) -> Result<Self, ConfigError> {
        let mut indices = HashMap::with_capacity(definitions.len());
        for (i, def) in definitions.iter().enumerate() {
            if indices.insert(def.id.clone(), i).is_some() {
                return Err(ConfigError::DuplicateId(def.id.clone()));
            }
        }

        let mut nodes = Vec::with_capacity(definitions.len());
        for def in definitions {
            let dependencies = Self::resolve_dependencies(&def, &indices)?;
            nodes.push(JobNode {
                definition: def,
                dependencies,
                dependents: Vec::new(),
                condition: None,
                step_conditions: Vec::new(),
            });
        }

        for i in 0..nodes.len() {
            for dep in nodes[i].dependencies.clone() {
                nodes[dep].dependents.push(i);
            }
        }

        let batches = Self::kahn_batches(&nodes)?;

        let mut graph = Self {
            nodes,
            indices,
            batches,
        };

        graph.compile_conditions()?;
        graph.validate_matrices(empty_matrix)?;
        graph.validate_artifacts()?;

        tracing::debug!(
            jobs = graph.nodes.len(),
            batches = graph.batches.len(),
            "built execution graph"
        );

        Ok(graph)
    }

    fn resolve_dependencies(
        def: &JobDefinition,
        indices: &HashMap<String, usize>,
    ) -> Result<Vec<usize>, ConfigError> {
        let mut deps = Vec::with_capacity(def.needs.len());

        for need in &def.needs {
            if need == &def.id {
                return Err(ConfigError::SelfDependency(def.id.clone()));
            }
            let Some(&idx) = indices.get(need) else {
                return Err(ConfigError::UnknownDependency {
                    job: def.id.clone(),
                    dependency: need.clone(),
                });
            };
            if !deps.contains(&idx) {
                deps.push(idx);
            }
        }

        Ok(deps)
    }

    /// Kahn's algorithm, grouping every wave of zero in-degree nodes
    fn kahn_batches(nodes: &[JobNode]) -> Result<Vec<Vec<usize>>, ConfigError> {
        let mut in_degree: Vec<usize> = nodes.iter().map(|n| n.dependencies.len()).collect();
        let mut current: Vec<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut batches = Vec::new();
        let mut processed = 0;

        while !current.is_empty() {
            let mut next = Vec::new();
            for &idx in &current {
                processed += 1;
                for &dependent in &nodes[idx].dependents {
                    in_degree[dependent] -= 1;
                    if in_degree[dependent] == 0 {
                        next.push(dependent);
                    }
                }
            }
            next.sort_unstable();
            batches.push(std::mem::replace(&mut current, next));
        }

        if processed < nodes.len() {
            return Err(ConfigError::Cycle {
                cycle: Self::find_cycle(nodes, &in_degree),
            });
        }

        Ok(batches)
    }

    /// Walk dependencies among the nodes Kahn could not remove until one repeats.
    /// Every such node has at least one dependency that is also left over.
    fn find_cycle(nodes: &[JobNode], in_degree: &[usize]) -> Vec<String> {
        let remaining = |i: usize| in_degree[i] > 0;

        let Some(start) = (0..nodes.len()).find(|&i| remaining(i)) else {
            return Vec::new();
        };

        let mut path = vec![start];
        let mut seen = HashMap::from([(start, 0usize)]);
        let mut current = start;

        loop {
            let Some(&next) = nodes[current]
                .dependencies
                .iter()
                .find(|&&d| remaining(d))
            else {
                break;
            };

            if let Some(&pos) = seen.get(&next) {
                let mut cycle: Vec<String> = path[pos..]
                    .iter()
                    .map(|&i| nodes[i].id().to_string())
                    .collect();
                cycle.push(nodes[next].id().to_string());
                return cycle;
            }

            seen.insert(next, path.len());
            path.push(next);
            current = next;
        }

        path.iter().map(|&i| nodes[i].id().to_string()).collect()
    }

    fn compile_conditions(&mut self) -> Result<(), ConfigError> {
        for node in &mut self.nodes {
            let def = &node.definition;

            let job_scope = CompileScope {
                needs: &def.needs,
                matrix_axes: None,
            };
            node.condition = def
                .condition
                .as_deref()
                .map(|source| CompiledCondition::compile(source, job_scope))
                .transpose()
                .map_err(|e| ConfigError::job_condition(&def.id, e.message))?;

            let axes = def
                .matrix
                .as_ref()
                .map(|m| m.axis_names())
                .unwrap_or_default();
            let step_scope = CompileScope {
                needs: &def.needs,
                matrix_axes: Some(&axes),
            };

            let mut step_conditions = Vec::with_capacity(def.steps.len());
            for step in &def.steps {
                let compiled = step
                    .condition
                    .as_deref()
                    .map(|source| CompiledCondition::compile(source, step_scope))
                    .transpose()
                    .map_err(|e| ConfigError::step_condition(&def.id, &step.name, e.message))?;
                step_conditions.push(compiled);
            }
            node.step_conditions = step_conditions;
        }

        Ok(())
    }

    fn validate_matrices(&self, policy: EmptyMatrixPolicy) -> Result<(), ConfigError> {
        for node in &self.nodes {
            let def = &node.definition;

            if def.max_parallel == Some(0) {
                return Err(ConfigError::InvalidMatrix {
                    job: def.id.clone(),
                    message: "max-parallel must be at least 1".to_string(),
                });
            }

            let Some(spec) = &def.matrix else {
                continue;
            };

            for partial in &spec.exclude {
                if let Some(axis) = partial.keys().find(|k| !spec.axes.contains_key(*k)) {
                    return Err(ConfigError::InvalidMatrix {
                        job: def.id.clone(),
                        message: format!("exclude references undeclared axis '{}'", axis),
                    });
                }
            }

            if let Some(axis) = spec.empty_axes().first() {
                match policy {
                    EmptyMatrixPolicy::Error => {
                        return Err(ConfigError::EmptyMatrixAxis {
                            job: def.id.clone(),
                            axis: axis.to_string(),
                        });
                    }
                    EmptyMatrixPolicy::Warn => {
                        tracing::warn!(
                            job = %def.id,
                            axis = %axis,
                            "matrix axis has no values, job will have no instances"
                        );
                    }
                }
            }
        }

        Ok(())
    }

    /// Every artifact input must name a transitive dependency declaring that output
    fn validate_artifacts(&self) -> Result<(), ConfigError> {
        for (idx, node) in self.nodes.iter().enumerate() {
            let def = &node.definition;

            let mut names = HashSet::new();
            for output in &def.artifact_outputs {
                if output.retention_days == Some(0) {
                    return Err(ConfigError::InvalidArtifact {
                        job: def.id.clone(),
                        message: format!("artifact '{}' must be retained at least one day", output.name),
                    });
                }
                if !names.insert(output.name.as_str()) {
                    return Err(ConfigError::InvalidArtifact {
                        job: def.id.clone(),
                        message: format!("artifact '{}' is uploaded twice", output.name),
                    });
                }
            }

            if def.artifact_inputs.is_empty() {
                continue;
            }

            let ancestors = self.ancestors(idx);
            for input in &def.artifact_inputs {
                let Some(&producer) = self.indices.get(&input.job) else {
                    return Err(ConfigError::InvalidArtifact {
                        job: def.id.clone(),
                        message: format!("artifact producer '{}' is not a job", input.job),
                    });
                };
                if !ancestors.contains(&producer) {
                    return Err(ConfigError::InvalidArtifact {
                        job: def.id.clone(),
                        message: format!(
                            "'{}' downloads from '{}', which is not among its dependencies",
                            def.id, input.job
                        ),
                    });
                }
                let declared = self.nodes[producer]
                    .definition
                    .artifact_outputs
                    .iter()
                    .any(|o| o.name == input.name);
                if !declared {
                    return Err(ConfigError::InvalidArtifact {
                        job: def.id.clone(),
                        message: format!(
                            "job '{}' does not upload an artifact named '{}'",
                            input.job, input.name
                        ),
                    });
                }
            }
        }

        Ok(())
    }

    /// Transitive dependencies of a node
    pub fn ancestors(&self, idx: usize) -> HashSet<usize> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<usize> = self.nodes[idx].dependencies.iter().copied().collect();

        while let Some(dep) = queue.pop_front() {
            if seen.insert(dep) {
                queue.extend(self.nodes[dep].dependencies.iter().copied());
            }
        }

        seen
    }

    /// Topological batches of job ids: each batch only needs earlier batches
    pub fn topological_batches(&self) -> Vec<Vec<&str>> {
        self.batches
            .iter()
            .map(|batch| batch.iter().map(|&i| self.nodes[i].id()).collect())
            .collect()
    }

    /// Job indices in topological order
    pub fn topological_order(&self) -> impl Iterator<Item = usize> + '_ {
        self.batches.iter().flatten().copied()
    }

    /// Matrix bindings of a job (one empty binding without a matrix)
    pub fn expand(&self, idx: usize) -> Vec<MatrixBinding> {
        match &self.nodes[idx].definition.matrix {
            Some(spec) => MatrixExpander::expand(spec),
            None => vec![MatrixBinding::default()],
        }
    }

    /// Materialize every instance of every job, in topological order.
    /// Instance ids are positions in the returned table.
    pub fn instances(&self) -> Vec<JobInstance> {
        let mut table = Vec::new();

        for idx in self.topological_order() {
            let node = &self.nodes[idx];
            let matrix = node.has_matrix();
            for binding in self.expand(idx) {
                let name = if matrix {
                    format!("{}[{}]", node.id(), binding.index())
                } else {
                    node.id().to_string()
                };
                table.push(JobInstance {
                    id: table.len(),
                    job: idx,
                    job_id: node.id().to_string(),
                    name,
                    binding,
                });
            }
        }

        table
    }

    /// Instances a job would run with, after its condition: empty when the
    /// condition is false, the job is unknown, or an axis has no values
    pub fn instances_for(&self, job_id: &str, scope: &EvalScope<'_>) -> Vec<JobInstance> {
        let Some(&idx) = self.indices.get(job_id) else {
            return Vec::new();
        };

        let activated = self.nodes[idx]
            .condition
            .as_ref()
            .map(|c| c.evaluate(scope))
            .unwrap_or_else(|| !scope.upstream_failed && !scope.run_cancelled);
        if !activated {
            return Vec::new();
        }

        self.instances()
            .into_iter()
            .filter(|instance| instance.job == idx)
            .collect()
    }

    pub fn node(&self, idx: usize) -> &JobNode {
        &self.nodes[idx]
    }

    pub fn get(&self, id: &str) -> Option<&JobNode> {
        self.indices.get(id).map(|&i| &self.nodes[i])
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.indices.get(id).copied()
    }

    pub fn nodes(&self) -> &[JobNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::context::{EventKind, RunContext};
    use crate::execution::matrix::MatrixSpec;
    use crate::models::{JobConclusion, StepSpec};

    fn job(id: &str, needs: &[&str]) -> JobDefinition {
        JobDefinition::new(id)
            .needs(needs.iter().copied())
            .run("step", "true")
    }

    fn ci_jobs() -> Vec<JobDefinition> {
        vec![
            job("quality-check", &[]),
            job("test", &["quality-check"]).with_matrix(
                MatrixSpec::builder()
                    .axis("python", ["3.8", "3.9", "3.10", "3.11"])
                    .build(),
            ),
            job("build", &["test"]),
            job("deploy-staging", &["build"]).with_condition("branch == 'develop'"),
            job("deploy-production", &["build"]).with_condition("branch == 'main'"),
        ]
    }

    #[test]
    fn test_topological_batches() {
        let graph = ExecutionGraph::build(ci_jobs()).unwrap();
        assert_eq!(
            graph.topological_batches(),
            vec![
                vec!["quality-check"],
                vec!["test"],
                vec!["build"],
                vec!["deploy-staging", "deploy-production"],
            ]
        );
    }

    #[test]
    fn test_batches_respect_every_edge() {
        let graph = ExecutionGraph::build(vec![
            job("d", &["b", "c"]),
            job("b", &["a"]),
            job("c", &[]),
            job("a", &[]),
        ])
        .unwrap();

        let position: HashMap<&str, usize> = graph
            .topological_batches()
            .into_iter()
            .enumerate()
            .flat_map(|(i, batch)| batch.into_iter().map(move |id| (id, i)))
            .collect();

        for node in graph.nodes() {
            for need in &node.definition.needs {
                assert!(position[need.as_str()] < position[node.id()]);
            }
        }
    }

    #[test]
    fn test_unknown_dependency() {
        let err = ExecutionGraph::build(vec![job("build", &["compile"])]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::UnknownDependency {
                job: "build".to_string(),
                dependency: "compile".to_string(),
            }
        );
    }

    #[test]
    fn test_duplicate_and_self_dependency() {
        let err = ExecutionGraph::build(vec![job("a", &[]), job("a", &[])]).unwrap_err();
        assert_eq!(err, ConfigError::DuplicateId("a".to_string()));

        let err = ExecutionGraph::build(vec![job("a", &["a"])]).unwrap_err();
        assert_eq!(err, ConfigError::SelfDependency("a".to_string()));
    }

    #[test]
    fn test_cycle_is_named() {
        let err = ExecutionGraph::build(vec![
            job("root", &[]),
            job("a", &["root", "c"]),
            job("b", &["a"]),
            job("c", &["b"]),
        ])
        .unwrap_err();

        let ConfigError::Cycle { cycle } = err else {
            panic!("expected cycle error");
        };
        assert_eq!(cycle, vec!["a", "c", "b", "a"]);
    }

    #[test]
    fn test_instance_naming() {
        let graph = ExecutionGraph::build(ci_jobs()).unwrap();
        let names: Vec<String> = graph.instances().into_iter().map(|i| i.name).collect();

        assert_eq!(
            names,
            vec![
                "quality-check",
                "test[0]",
                "test[1]",
                "test[2]",
                "test[3]",
                "build",
                "deploy-staging",
                "deploy-production",
            ]
        );
    }

    #[test]
    fn test_instances_for_applies_condition() {
        let graph = ExecutionGraph::build(ci_jobs()).unwrap();
        let ctx = RunContext::new(EventKind::Push, "refs/heads/develop", "abc", "octo");
        let mut needs = std::collections::HashMap::new();
        needs.insert("build".to_string(), JobConclusion::Success);
        let scope = EvalScope::new(&ctx, &needs);

        assert_eq!(graph.instances_for("deploy-staging", &scope).len(), 1);
        assert!(graph.instances_for("deploy-production", &scope).is_empty());
        assert_eq!(graph.instances_for("test", &scope).len(), 4);
    }

    #[test]
    fn test_malformed_condition_fails_build() {
        let err = ExecutionGraph::build(vec![
            job("a", &[]).with_condition("branchname == 'main'")
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::MalformedCondition { .. }));

        let err = ExecutionGraph::build(vec![job("a", &[])
            .step(StepSpec::new("s", "true").with_condition("matrix.os == 'linux'"))])
        .unwrap_err();
        assert!(err.to_string().contains("step 's' of job 'a'"));
    }

    #[test]
    fn test_empty_axis_policy() {
        let jobs = || {
            vec![job("a", &[]).with_matrix(
                MatrixSpec::builder()
                    .axis("os", Vec::<String>::new())
                    .build(),
            )]
        };

        let graph = ExecutionGraph::build(jobs()).unwrap();
        assert!(graph.instances().is_empty());

        let err =
            ExecutionGraph::build_with_policy(jobs(), EmptyMatrixPolicy::Error).unwrap_err();
        assert_eq!(
            err,
            ConfigError::EmptyMatrixAxis {
                job: "a".to_string(),
                axis: "os".to_string(),
            }
        );
    }

    #[test]
    fn test_artifact_bindings_validated() {
        let producer = job("build", &[]).upload("dist", "dist/");
        let ok = ExecutionGraph::build(vec![
            producer.clone(),
            job("test", &["build"]),
            job("deploy", &["test"]).download("build", "dist", None),
        ]);
        assert!(ok.is_ok());

        let not_ancestor = ExecutionGraph::build(vec![
            producer.clone(),
            job("deploy", &[]).download("build", "dist", None),
        ])
        .unwrap_err();
        assert!(matches!(not_ancestor, ConfigError::InvalidArtifact { .. }));

        let undeclared = ExecutionGraph::build(vec![
            producer,
            job("deploy", &["build"]).download("build", "wheels", None),
        ])
        .unwrap_err();
        assert!(undeclared.to_string().contains("wheels"));
    }
}
