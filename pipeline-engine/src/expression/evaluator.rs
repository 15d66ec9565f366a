// Condition Evaluator
// Compiles parsed conditions into a typed form and evaluates them against a run

use crate::execution::context::{EventKind, RunContext};
use crate::execution::matrix::MatrixBinding;
use crate::expression::parser::{BinaryOp, Expr, ExprParser};
use crate::models::JobConclusion;

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;

/// Field of the run context a condition can read
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Event,
    Ref,
    Branch,
    Sha,
    Actor,
    PrTitle,
    PrLabels,
    PrNumber,
    /// `needs.<job>.result`
    NeedsResult(String),
    /// `matrix.<axis>`, step conditions only
    Matrix(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Field(Field),
    Literal(Literal),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextTest {
    Contains,
    StartsWith,
    EndsWith,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCheck {
    Success,
    Failure,
    Always,
    Cancelled,
}

/// Typed condition tree
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Const(bool),
    Compare {
        left: Operand,
        right: Operand,
        negated: bool,
    },
    Text {
        test: TextTest,
        haystack: Operand,
        needle: Operand,
    },
    Status(StatusCheck),
    Truthy(Field),
    Not(Box<Condition>),
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
}

/// What a condition is allowed to reference
#[derive(Debug, Clone, Copy, Default)]
pub struct CompileScope<'a> {
    /// Direct dependencies of the owning job
    pub needs: &'a [String],
    /// Matrix axes, `None` when matrix references are not allowed
    pub matrix_axes: Option<&'a [String]>,
}

/// Error raised when a condition cannot be compiled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    pub message: String,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for CompileError {}

impl CompileError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Run-time inputs to condition evaluation
#[derive(Debug, Clone, Copy)]
pub struct EvalScope<'a> {
    pub context: &'a RunContext,
    pub needs: &'a HashMap<String, JobConclusion>,
    pub matrix: Option<&'a MatrixBinding>,
    /// A dependency (job scope) or an earlier step (step scope) failed
    pub upstream_failed: bool,
    pub run_cancelled: bool,
}

impl<'a> EvalScope<'a> {
    pub fn new(context: &'a RunContext, needs: &'a HashMap<String, JobConclusion>) -> Self {
        Self {
            context,
            needs,
            matrix: None,
            upstream_failed: false,
            run_cancelled: false,
        }
    }

    pub fn with_matrix(mut self, matrix: &'a MatrixBinding) -> Self {
        self.matrix = Some(matrix);
        self
    }

    pub fn with_upstream_failed(mut self, failed: bool) -> Self {
        self.upstream_failed = failed;
        self
    }

    pub fn with_run_cancelled(mut self, cancelled: bool) -> Self {
        self.run_cancelled = cancelled;
        self
    }
}

/// A condition compiled against its job, ready for evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledCondition {
    source: String,
    root: Condition,
}

impl CompiledCondition {
    /// Parse and type-check a condition string
    pub fn compile(source: &str, scope: CompileScope<'_>) -> Result<Self, CompileError> {
        let expr = ExprParser::parse_str(source).map_err(|e| CompileError::new(e.to_string()))?;
        let root = Compiler { scope }.condition(&expr)?;

        Ok(Self {
            source: source.trim().to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn root(&self) -> &Condition {
        &self.root
    }

    /// True when the condition asks to run after upstream failures
    /// (`always()` or `failure()` appear anywhere in it)
    pub fn is_status_aware(&self) -> bool {
        fn walk(condition: &Condition) -> bool {
            match condition {
                Condition::Status(StatusCheck::Always | StatusCheck::Failure) => true,
                Condition::Not(inner) => walk(inner),
                Condition::And(a, b) | Condition::Or(a, b) => walk(a) || walk(b),
                _ => false,
            }
        }
        walk(&self.root)
    }

    /// Evaluate against the run. Pure: same scope, same answer.
    pub fn evaluate(&self, scope: &EvalScope<'_>) -> bool {
        eval(&self.root, scope)
    }
}

impl fmt::Display for CompiledCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

struct Compiler<'a> {
    scope: CompileScope<'a>,
}

impl Compiler<'_> {
    fn condition(&self, expr: &Expr) -> Result<Condition, CompileError> {
        match expr {
            Expr::Bool(b) => Ok(Condition::Const(*b)),
            Expr::Not(inner) => Ok(Condition::Not(Box::new(self.condition(inner)?))),
            Expr::Binary { op, left, right } => match op {
                BinaryOp::And => Ok(Condition::And(
                    Box::new(self.condition(left)?),
                    Box::new(self.condition(right)?),
                )),
                BinaryOp::Or => Ok(Condition::Or(
                    Box::new(self.condition(left)?),
                    Box::new(self.condition(right)?),
                )),
                BinaryOp::Eq | BinaryOp::Ne => {
                    let (left, right) = self.comparison(left, right)?;
                    Ok(Condition::Compare {
                        left,
                        right,
                        negated: *op == BinaryOp::Ne,
                    })
                }
            },
            Expr::Call { name, args } => self.call(name, args),
            Expr::Reference(path) => Ok(Condition::Truthy(self.field(path)?)),
            Expr::Null | Expr::Number(_) | Expr::String(_) => Err(CompileError::new(
                "a literal cannot be used as a condition on its own",
            )),
        }
    }

    fn call(&self, name: &str, args: &[Expr]) -> Result<Condition, CompileError> {
        let lowered = name.to_ascii_lowercase();

        let status = match lowered.as_str() {
            "success" | "succeeded" => Some(StatusCheck::Success),
            "failure" | "failed" => Some(StatusCheck::Failure),
            "always" => Some(StatusCheck::Always),
            "cancelled" | "canceled" => Some(StatusCheck::Cancelled),
            _ => None,
        };
        if let Some(status) = status {
            if !args.is_empty() {
                return Err(CompileError::new(format!("{}() takes no arguments", name)));
            }
            return Ok(Condition::Status(status));
        }

        let test = match lowered.as_str() {
            "contains" => TextTest::Contains,
            "startswith" => TextTest::StartsWith,
            "endswith" => TextTest::EndsWith,
            _ => return Err(CompileError::new(format!("unknown function '{}'", name))),
        };

        let [haystack, needle] = args else {
            return Err(CompileError::new(format!(
                "{}() takes exactly 2 arguments, got {}",
                name,
                args.len()
            )));
        };

        Ok(Condition::Text {
            test,
            haystack: self.operand(haystack)?,
            needle: self.operand(needle)?,
        })
    }

    fn comparison(&self, left: &Expr, right: &Expr) -> Result<(Operand, Operand), CompileError> {
        let mut left = self.operand(left)?;
        let mut right = self.operand(right)?;

        normalize_literal(&left, &mut right)?;
        normalize_literal(&right, &mut left)?;

        Ok((left, right))
    }

    fn operand(&self, expr: &Expr) -> Result<Operand, CompileError> {
        match expr {
            Expr::Reference(path) => Ok(Operand::Field(self.field(path)?)),
            Expr::String(s) => Ok(Operand::Literal(Literal::Str(s.clone()))),
            Expr::Number(n) => Ok(Operand::Literal(Literal::Number(*n))),
            Expr::Bool(b) => Ok(Operand::Literal(Literal::Bool(*b))),
            Expr::Null => Ok(Operand::Literal(Literal::Null)),
            _ => Err(CompileError::new(
                "expected a context field or a literal as operand",
            )),
        }
    }

    fn field(&self, path: &[String]) -> Result<Field, CompileError> {
        let parts: Vec<&str> = path.iter().map(String::as_str).collect();

        match parts.as_slice() {
            ["event"] => Ok(Field::Event),
            ["ref"] => Ok(Field::Ref),
            ["branch"] => Ok(Field::Branch),
            ["sha"] => Ok(Field::Sha),
            ["actor"] => Ok(Field::Actor),
            ["pr", "title"] => Ok(Field::PrTitle),
            ["pr", "labels"] => Ok(Field::PrLabels),
            ["pr", "number"] => Ok(Field::PrNumber),
            ["needs", job, "result"] => {
                if self.scope.needs.iter().any(|n| n == job) {
                    Ok(Field::NeedsResult(job.to_string()))
                } else {
                    Err(CompileError::new(format!(
                        "'needs.{}' does not name a direct dependency",
                        job
                    )))
                }
            }
            ["matrix", axis] => match self.scope.matrix_axes {
                Some(axes) if axes.iter().any(|a| a == axis) => Ok(Field::Matrix(axis.to_string())),
                Some(_) => Err(CompileError::new(format!("unknown matrix axis '{}'", axis))),
                None => Err(CompileError::new(
                    "matrix values are not available in job conditions",
                )),
            },
            _ => Err(CompileError::new(format!(
                "unknown field '{}'",
                path.join(".")
            ))),
        }
    }
}

/// Check literals compared against enumerated fields and canonicalize them
fn normalize_literal(field: &Operand, literal: &mut Operand) -> Result<(), CompileError> {
    let Operand::Literal(Literal::Str(value)) = literal else {
        return Ok(());
    };

    match field {
        Operand::Field(Field::Event) => {
            let kind: EventKind = value.parse().map_err(CompileError::new)?;
            *value = kind.as_str().to_string();
        }
        Operand::Field(Field::NeedsResult(job)) => {
            if JobConclusion::parse(value).is_none() {
                return Err(CompileError::new(format!(
                    "'{}' is not a job result for needs.{} (expected success, failure, cancelled or skipped)",
                    value, job
                )));
            }
        }
        _ => {}
    }

    Ok(())
}

enum Resolved<'a> {
    Null,
    Bool(bool),
    Number(f64),
    Str(Cow<'a, str>),
    List(&'a [String]),
}

fn resolve<'a>(operand: &'a Operand, scope: &EvalScope<'a>) -> Resolved<'a> {
    match operand {
        Operand::Literal(Literal::Null) => Resolved::Null,
        Operand::Literal(Literal::Bool(b)) => Resolved::Bool(*b),
        Operand::Literal(Literal::Number(n)) => Resolved::Number(*n),
        Operand::Literal(Literal::Str(s)) => Resolved::Str(Cow::Borrowed(s)),
        Operand::Field(field) => resolve_field(field, scope),
    }
}

fn resolve_field<'a>(field: &'a Field, scope: &EvalScope<'a>) -> Resolved<'a> {
    let ctx = scope.context;
    match field {
        Field::Event => Resolved::Str(Cow::Borrowed(ctx.event.as_str())),
        Field::Ref => Resolved::Str(Cow::Borrowed(&ctx.git_ref)),
        Field::Branch => Resolved::Str(Cow::Borrowed(ctx.branch())),
        Field::Sha => Resolved::Str(Cow::Borrowed(&ctx.sha)),
        Field::Actor => Resolved::Str(Cow::Borrowed(&ctx.actor)),
        Field::PrTitle => match &ctx.pull_request {
            Some(pr) => Resolved::Str(Cow::Borrowed(&pr.title)),
            None => Resolved::Null,
        },
        Field::PrLabels => Resolved::List(ctx.pr_labels()),
        Field::PrNumber => match ctx.pull_request.as_ref().and_then(|pr| pr.number) {
            Some(n) => Resolved::Number(n as f64),
            None => Resolved::Null,
        },
        Field::NeedsResult(job) => match scope.needs.get(job) {
            Some(conclusion) => Resolved::Str(Cow::Borrowed(conclusion.as_str())),
            None => Resolved::Null,
        },
        Field::Matrix(axis) => match scope.matrix.and_then(|m| m.get(axis)) {
            Some(value) => Resolved::Str(Cow::Borrowed(value)),
            None => Resolved::Null,
        },
    }
}

fn eval(condition: &Condition, scope: &EvalScope<'_>) -> bool {
    match condition {
        Condition::Const(b) => *b,
        Condition::Not(inner) => !eval(inner, scope),
        Condition::And(a, b) => eval(a, scope) && eval(b, scope),
        Condition::Or(a, b) => eval(a, scope) || eval(b, scope),
        Condition::Status(check) => match check {
            StatusCheck::Success => !scope.upstream_failed && !scope.run_cancelled,
            StatusCheck::Failure => scope.upstream_failed,
            StatusCheck::Always => true,
            StatusCheck::Cancelled => scope.run_cancelled,
        },
        Condition::Truthy(field) => truthy(&resolve_field(field, scope)),
        Condition::Compare {
            left,
            right,
            negated,
        } => {
            let equal = values_equal(&resolve(left, scope), &resolve(right, scope));
            equal != *negated
        }
        Condition::Text {
            test,
            haystack,
            needle,
        } => text_test(*test, &resolve(haystack, scope), &resolve(needle, scope)),
    }
}

fn truthy(value: &Resolved<'_>) -> bool {
    match value {
        Resolved::Null => false,
        Resolved::Bool(b) => *b,
        Resolved::Number(n) => *n != 0.0,
        Resolved::Str(s) => !s.is_empty(),
        Resolved::List(items) => !items.is_empty(),
    }
}

fn values_equal(left: &Resolved<'_>, right: &Resolved<'_>) -> bool {
    match (left, right) {
        (Resolved::Null, Resolved::Null) => true,
        (Resolved::Null, Resolved::Str(s)) | (Resolved::Str(s), Resolved::Null) => s.is_empty(),
        (Resolved::Bool(a), Resolved::Bool(b)) => a == b,
        (Resolved::Number(a), Resolved::Number(b)) => a == b,
        (Resolved::Number(n), Resolved::Str(s)) | (Resolved::Str(s), Resolved::Number(n)) => {
            s.trim().parse::<f64>().map(|v| v == *n).unwrap_or(false)
        }
        (Resolved::Str(a), Resolved::Str(b)) => a == b,
        _ => false,
    }
}

fn as_text(value: &Resolved<'_>) -> Option<String> {
    match value {
        Resolved::Str(s) => Some(s.to_string()),
        Resolved::Number(n) => Some(n.to_string()),
        Resolved::Bool(b) => Some(b.to_string()),
        Resolved::Null | Resolved::List(_) => None,
    }
}

// String tests ignore case, matching how CI predicates are usually written
fn text_test(test: TextTest, haystack: &Resolved<'_>, needle: &Resolved<'_>) -> bool {
    let Some(needle) = as_text(needle).map(|n| n.to_lowercase()) else {
        return false;
    };

    if let Resolved::List(items) = haystack {
        return test == TextTest::Contains && items.iter().any(|i| i.to_lowercase() == needle);
    }

    let Some(haystack) = as_text(haystack).map(|h| h.to_lowercase()) else {
        return false;
    };

    match test {
        TextTest::Contains => haystack.contains(&needle),
        TextTest::StartsWith => haystack.starts_with(&needle),
        TextTest::EndsWith => haystack.ends_with(&needle),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::context::PullRequest;
    use crate::execution::matrix::{MatrixExpander, MatrixSpec};

    fn push_to(branch: &str) -> RunContext {
        RunContext::new(EventKind::Push, branch, "deadbeef", "octocat")
    }

    fn compile(source: &str) -> CompiledCondition {
        CompiledCondition::compile(source, CompileScope::default()).unwrap()
    }

    fn eval_with(source: &str, ctx: &RunContext) -> bool {
        let needs = HashMap::new();
        compile(source).evaluate(&EvalScope::new(ctx, &needs))
    }

    #[test]
    fn test_branch_equality() {
        let ctx = push_to("refs/heads/develop");
        assert!(eval_with("branch == 'develop'", &ctx));
        assert!(!eval_with("branch == 'main'", &ctx));
        assert!(eval_with("ref == 'refs/heads/develop'", &ctx));
        assert!(eval_with("branch != 'main'", &ctx));
    }

    #[test]
    fn test_event_kind_and_logic() {
        let ctx = push_to("main");
        assert!(eval_with("event == 'push' && branch == 'main'", &ctx));
        assert!(!eval_with("event == 'pull_request' || branch == 'develop'", &ctx));
        assert!(eval_with("!(event == 'schedule')", &ctx));
        // vendor alias is normalized at compile time
        assert!(!eval_with("event == 'workflow_dispatch'", &ctx));
    }

    #[test]
    fn test_pr_title_contains_ignores_case() {
        let ctx = RunContext::new(EventKind::PullRequest, "feature/x", "abc", "octocat")
            .with_pull_request(PullRequest {
                number: Some(7),
                title: "Release: [DEPLOY] v2".to_string(),
                labels: vec!["ready".to_string()],
            });

        assert!(eval_with("contains(pr.title, '[deploy]')", &ctx));
        assert!(eval_with("startsWith(pr.title, 'release')", &ctx));
        assert!(eval_with("contains(pr.labels, 'Ready')", &ctx));
        assert!(eval_with("pr.number == 7", &ctx));
        assert!(!eval_with("contains(pr.title, 'hotfix')", &ctx));
    }

    #[test]
    fn test_missing_pull_request_is_falsy() {
        let ctx = push_to("main");
        assert!(!eval_with("contains(pr.title, 'x')", &ctx));
        assert!(!eval_with("pr.title", &ctx));
    }

    #[test]
    fn test_needs_result() {
        let ctx = push_to("main");
        let needs_list = vec!["test".to_string()];
        let condition = CompiledCondition::compile(
            "needs.test.result == 'success'",
            CompileScope {
                needs: &needs_list,
                matrix_axes: None,
            },
        )
        .unwrap();

        let mut needs = HashMap::new();
        needs.insert("test".to_string(), JobConclusion::Success);
        assert!(condition.evaluate(&EvalScope::new(&ctx, &needs)));

        needs.insert("test".to_string(), JobConclusion::Failure);
        assert!(!condition.evaluate(&EvalScope::new(&ctx, &needs)));
    }

    #[test]
    fn test_status_functions() {
        let ctx = push_to("main");
        let needs = HashMap::new();
        let scope = EvalScope::new(&ctx, &needs).with_upstream_failed(true);

        assert!(!compile("success()").evaluate(&scope));
        assert!(compile("failure()").evaluate(&scope));
        assert!(compile("always()").evaluate(&scope));
        assert!(!compile("cancelled()").evaluate(&scope));

        assert!(compile("always() && branch == 'main'").is_status_aware());
        assert!(compile("failure()").is_status_aware());
        assert!(!compile("success() && branch == 'main'").is_status_aware());
    }

    #[test]
    fn test_matrix_reference_in_step_scope() {
        let spec = MatrixSpec::builder()
            .axis("python", ["3.8", "3.9"])
            .build();
        let bindings = MatrixExpander::expand(&spec);
        let axes = vec!["python".to_string()];

        let condition = CompiledCondition::compile(
            "matrix.python == '3.9'",
            CompileScope {
                needs: &[],
                matrix_axes: Some(&axes),
            },
        )
        .unwrap();

        let ctx = push_to("main");
        let needs = HashMap::new();
        let first = EvalScope::new(&ctx, &needs).with_matrix(&bindings[0]);
        let second = EvalScope::new(&ctx, &needs).with_matrix(&bindings[1]);
        assert!(!condition.evaluate(&first));
        assert!(condition.evaluate(&second));
    }

    #[test]
    fn test_compile_errors() {
        let scope = CompileScope::default();
        let err = CompiledCondition::compile("branchh == 'main'", scope).unwrap_err();
        assert!(err.message.contains("unknown field 'branchh'"));

        assert!(CompiledCondition::compile("needs.build.result == 'success'", scope).is_err());
        assert!(CompiledCondition::compile("matrix.os == 'linux'", scope).is_err());
        assert!(CompiledCondition::compile("event == 'release'", scope).is_err());
        assert!(CompiledCondition::compile("frobnicate()", scope).is_err());
        assert!(CompiledCondition::compile("contains(pr.title)", scope).is_err());
        assert!(CompiledCondition::compile("'just a string'", scope).is_err());
    }

    #[test]
    fn test_evaluation_is_idempotent() {
        let ctx = push_to("develop");
        let needs = HashMap::new();
        let condition = compile("branch == 'develop' && !contains(actor, 'bot')");
        let scope = EvalScope::new(&ctx, &needs);

        let first = condition.evaluate(&scope);
        let second = condition.evaluate(&scope);
        assert_eq!(first, second);
        assert!(first);
    }
}
