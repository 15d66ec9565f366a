// Executor Configuration
// Run-wide knobs for concurrency, timeouts, cancellation and artifacts

use serde::{Deserialize, Serialize};

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// What to do with a matrix axis that has no values
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyMatrixPolicy {
    /// Log a warning; the job contributes zero instances
    #[default]
    Warn,
    /// Reject the graph with a configuration error
    Error,
}

impl FromStr for EmptyMatrixPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "warn" | "warning" => Ok(EmptyMatrixPolicy::Warn),
            "error" => Ok(EmptyMatrixPolicy::Error),
            other => Err(format!(
                "unknown empty matrix policy '{}' (expected warn or error)",
                other
            )),
        }
    }
}

impl fmt::Display for EmptyMatrixPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmptyMatrixPolicy::Warn => write!(f, "warn"),
            EmptyMatrixPolicy::Error => write!(f, "error"),
        }
    }
}

/// Configuration for a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Maximum instances running at once (K)
    pub max_parallel: usize,
    /// Budget for jobs that do not set their own timeout
    pub default_job_timeout: Duration,
    /// How long a cancelled instance may take to stop before it is force-marked
    pub cancel_grace_period: Duration,
    pub empty_matrix_policy: EmptyMatrixPolicy,
    /// Retention for artifact outputs that do not set their own
    pub default_retention_days: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_parallelism(),
            default_job_timeout: Duration::from_secs(360 * 60),
            cancel_grace_period: Duration::from_secs(10),
            empty_matrix_policy: EmptyMatrixPolicy::Warn,
            default_retention_days: 7,
        }
    }
}

impl ExecutorConfig {
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel;
        self
    }

    pub fn with_default_job_timeout(mut self, timeout: Duration) -> Self {
        self.default_job_timeout = timeout;
        self
    }

    pub fn with_cancel_grace_period(mut self, grace: Duration) -> Self {
        self.cancel_grace_period = grace;
        self
    }

    pub fn with_empty_matrix_policy(mut self, policy: EmptyMatrixPolicy) -> Self {
        self.empty_matrix_policy = policy;
        self
    }

    pub fn with_default_retention_days(mut self, days: u32) -> Self {
        self.default_retention_days = days;
        self
    }

    /// Clamp values that would stall a run
    pub fn normalized(mut self) -> Self {
        if self.max_parallel == 0 {
            tracing::warn!("max_parallel of 0 would never admit a job, using 1");
            self.max_parallel = 1;
        }
        if self.default_retention_days == 0 {
            self.default_retention_days = 1;
        }
        if self.default_job_timeout.is_zero() {
            self.default_job_timeout = ExecutorConfig::default().default_job_timeout;
        }
        self
    }

    /// Layer overrides on top of this config, `Some` values win
    pub fn apply(mut self, overrides: &ConfigOverrides) -> Self {
        if let Some(max_parallel) = overrides.max_parallel {
            self.max_parallel = max_parallel;
        }
        if let Some(minutes) = overrides.timeout_minutes {
            self.default_job_timeout = Duration::from_secs(minutes * 60);
        }
        if let Some(secs) = overrides.cancel_grace_secs {
            self.cancel_grace_period = Duration::from_secs(secs);
        }
        if let Some(policy) = overrides.empty_matrix_policy {
            self.empty_matrix_policy = policy;
        }
        if let Some(days) = overrides.retention_days {
            self.default_retention_days = days;
        }
        self
    }
}

/// Partial configuration from a declaration `settings:` block or the CLI
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ConfigOverrides {
    pub max_parallel: Option<usize>,
    pub timeout_minutes: Option<u64>,
    pub cancel_grace_secs: Option<u64>,
    pub empty_matrix_policy: Option<EmptyMatrixPolicy>,
    pub retention_days: Option<u32>,
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ExecutorConfig::default();
        assert!(config.max_parallel >= 1);
        assert_eq!(config.empty_matrix_policy, EmptyMatrixPolicy::Warn);
        assert_eq!(config.default_retention_days, 7);
        assert_eq!(config.cancel_grace_period, Duration::from_secs(10));
    }

    #[test]
    fn test_zero_parallelism_is_clamped() {
        let config = ExecutorConfig::default().with_max_parallel(0).normalized();
        assert_eq!(config.max_parallel, 1);
    }

    #[test]
    fn test_overrides_layer_in_order() {
        let settings = ConfigOverrides {
            max_parallel: Some(2),
            retention_days: Some(30),
            ..Default::default()
        };
        let cli = ConfigOverrides {
            max_parallel: Some(8),
            empty_matrix_policy: Some(EmptyMatrixPolicy::Error),
            ..Default::default()
        };

        let config = ExecutorConfig::default().apply(&settings).apply(&cli);
        assert_eq!(config.max_parallel, 8);
        assert_eq!(config.default_retention_days, 30);
        assert_eq!(config.empty_matrix_policy, EmptyMatrixPolicy::Error);
    }

    #[test]
    fn test_settings_block_deserializes() {
        let yaml = "max-parallel: 3\nempty-matrix-policy: error\ntimeout-minutes: 15\n";
        let overrides: ConfigOverrides = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(overrides.max_parallel, Some(3));
        assert_eq!(overrides.empty_matrix_policy, Some(EmptyMatrixPolicy::Error));
        assert_eq!(overrides.timeout_minutes, Some(15));
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("warn".parse::<EmptyMatrixPolicy>(), Ok(EmptyMatrixPolicy::Warn));
        assert_eq!("ERROR".parse::<EmptyMatrixPolicy>(), Ok(EmptyMatrixPolicy::Error));
        assert!("ignore".parse::<EmptyMatrixPolicy>().is_err());
    }
}
