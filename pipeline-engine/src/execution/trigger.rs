// Trigger Matching
// Decides whether a run context starts a pipeline at all

use crate::execution::context::{EventKind, RunContext};

use serde::{Deserialize, Serialize};

/// One `on:` entry: an event kind with optional branch filters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerSpec {
    pub event: EventKind,
    /// Glob patterns; empty means every branch
    #[serde(default)]
    pub branches: Vec<String>,
    #[serde(default)]
    pub branches_ignore: Vec<String>,
}

impl TriggerSpec {
    pub fn new(event: EventKind) -> Self {
        Self {
            event,
            branches: Vec::new(),
            branches_ignore: Vec::new(),
        }
    }

    pub fn with_branches<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.branches.extend(patterns.into_iter().map(Into::into));
        self
    }

    pub fn with_branches_ignore<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.branches_ignore
            .extend(patterns.into_iter().map(Into::into));
        self
    }

    /// Event kind must agree; the branch must hit an include pattern (if any)
    /// and miss every ignore pattern
    pub fn matches(&self, context: &RunContext) -> bool {
        if self.event != context.event {
            return false;
        }

        let branch = context.branch();
        let included = self.branches.is_empty()
            || self.branches.iter().any(|p| branch_matches(p, branch));
        let ignored = self
            .branches_ignore
            .iter()
            .any(|p| branch_matches(p, branch));

        included && !ignored
    }
}

/// True when no triggers are declared or any of them matches
pub fn any_matches(triggers: &[TriggerSpec], context: &RunContext) -> bool {
    triggers.is_empty() || triggers.iter().any(|t| t.matches(context))
}

/// Glob matching for branch names.
///
/// `*` matches within one path segment, `**` across segments, `?` one
/// character other than `/`.
pub fn branch_matches(pattern: &str, branch: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let branch: Vec<char> = branch.chars().collect();
    glob(&pattern, &branch)
}

fn glob(pattern: &[char], text: &[char]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some('*') if pattern.get(1) == Some(&'*') => {
            let rest = &pattern[2..];
            (0..=text.len()).any(|skip| glob(rest, &text[skip..]))
        }
        Some('*') => {
            let rest = &pattern[1..];
            for skip in 0..=text.len() {
                if glob(rest, &text[skip..]) {
                    return true;
                }
                if text.get(skip) == Some(&'/') {
                    break;
                }
            }
            false
        }
        Some('?') => match text.first() {
            Some(c) if *c != '/' => glob(&pattern[1..], &text[1..]),
            _ => false,
        },
        Some(p) => match text.first() {
            Some(c) if c == p => glob(&pattern[1..], &text[1..]),
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::context::PullRequest;

    fn push(branch: &str) -> RunContext {
        RunContext::new(EventKind::Push, format!("refs/heads/{}", branch), "abc", "octo")
    }

    #[test]
    fn test_branch_globs() {
        assert!(branch_matches("main", "main"));
        assert!(!branch_matches("main", "maintenance"));
        assert!(branch_matches("release/*", "release/1.0"));
        assert!(!branch_matches("release/*", "release/1.0/hotfix"));
        assert!(branch_matches("release/**", "release/1.0/hotfix"));
        assert!(branch_matches("v?", "v2"));
        assert!(!branch_matches("v?", "v/"));
        assert!(branch_matches("*", "develop"));
    }

    #[test]
    fn test_push_trigger_with_branches() {
        let trigger = TriggerSpec::new(EventKind::Push).with_branches(["main", "develop"]);

        assert!(trigger.matches(&push("main")));
        assert!(trigger.matches(&push("develop")));
        assert!(!trigger.matches(&push("feature/login")));
    }

    #[test]
    fn test_branches_ignore() {
        let trigger = TriggerSpec::new(EventKind::Push).with_branches_ignore(["docs/**"]);

        assert!(trigger.matches(&push("main")));
        assert!(!trigger.matches(&push("docs/readme")));
    }

    #[test]
    fn test_event_must_match() {
        let trigger = TriggerSpec::new(EventKind::PullRequest).with_branches(["main"]);
        let pr = RunContext::new(EventKind::PullRequest, "main", "abc", "octo").with_pull_request(
            PullRequest {
                number: Some(7),
                title: "Add login".to_string(),
                labels: Vec::new(),
            },
        );

        assert!(trigger.matches(&pr));
        assert!(!trigger.matches(&push("main")));
    }

    #[test]
    fn test_no_triggers_always_match() {
        assert!(any_matches(&[], &push("anything")));
        assert!(!any_matches(
            &[TriggerSpec::new(EventKind::Schedule)],
            &push("main")
        ));
    }
}
