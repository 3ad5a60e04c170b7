use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::clock::seconds;
use crate::defaults;

/// What the pipeline does when a step is still failing after its retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    #[default]
    Abort,
    WarnAndContinue,
    TriggerRollback,
}

impl FailurePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailurePolicy::Abort => "abort",
            FailurePolicy::WarnAndContinue => "warn-and-continue",
            FailurePolicy::TriggerRollback => "trigger-rollback",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    #[default]
    Fixed,
    Exponential,
}

/// One command-level unit of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub name: String,
    pub command_template: String,
    #[serde(default = "defaults::step_timeout_seconds")]
    pub timeout_seconds: f64,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub retry_backoff_seconds: f64,
    #[serde(default)]
    pub backoff: BackoffStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_backoff_seconds: Option<f64>,
    #[serde(default)]
    pub on_failure: FailurePolicy,
    /// Overrides the target's working directory for this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
}

impl Step {
    pub fn new(name: impl Into<String>, command_template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command_template: command_template.into(),
            timeout_seconds: defaults::step_timeout_seconds(),
            retry_count: 0,
            retry_backoff_seconds: 0.0,
            backoff: BackoffStrategy::Fixed,
            max_backoff_seconds: None,
            on_failure: FailurePolicy::Abort,
            working_directory: None,
        }
    }

    pub fn with_timeout(mut self, timeout_seconds: f64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    pub fn with_retries(mut self, retry_count: u32, backoff_seconds: f64) -> Self {
        self.retry_count = retry_count;
        self.retry_backoff_seconds = backoff_seconds;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy, max_backoff_seconds: Option<f64>) -> Self {
        self.backoff = backoff;
        self.max_backoff_seconds = max_backoff_seconds;
        self
    }

    pub fn on_failure(mut self, policy: FailurePolicy) -> Self {
        self.on_failure = policy;
        self
    }

    pub fn timeout(&self) -> Duration {
        seconds(self.timeout_seconds)
    }

    /// Initial attempt plus every permitted retry.
    pub fn max_attempts(&self) -> u32 {
        self.retry_count.saturating_add(1)
    }

    /// Delay before attempt `failed_attempt + 1`, where `failed_attempt` is 1-based.
    pub fn backoff_after(&self, failed_attempt: u32) -> Duration {
        let base = self.retry_backoff_seconds.max(0.0);
        let raw = match self.backoff {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Exponential => {
                let exponent = i32::try_from(failed_attempt.saturating_sub(1)).unwrap_or(i32::MAX);
                base * 2f64.powi(exponent)
            }
        };
        let capped = match self.max_backoff_seconds {
            Some(max) => raw.min(max),
            None => raw,
        };
        seconds(capped)
    }

    pub(crate) fn collect_problems(&self, field: &str, problems: &mut Vec<String>) {
        if self.name.trim().is_empty() {
            problems.push(format!("{}.name must not be empty", field));
        }
        if self.command_template.trim().is_empty() {
            problems.push(format!("{}.commandTemplate must not be empty", field));
        }
        if !(self.timeout_seconds.is_finite() && self.timeout_seconds > 0.0) {
            problems.push(format!("{}.timeoutSeconds must be a positive number", field));
        }
        if !(self.retry_backoff_seconds.is_finite() && self.retry_backoff_seconds >= 0.0) {
            problems.push(format!("{}.retryBackoffSeconds must not be negative", field));
        }
        if let Some(max) = self.max_backoff_seconds {
            if !(max.is_finite() && max >= 0.0) {
                problems.push(format!("{}.maxBackoffSeconds must not be negative", field));
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepStatus {
    Success,
    Failed,
    TimedOut,
}

/// Outcome of one executed step. Reflects the last attempt; never mutated
/// after the executor returns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub name: String,
    pub command: String,
    pub status: StepStatus,
    pub policy: FailurePolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backoffs_ms: Vec<u64>,
    pub stdout: String,
    pub stderr: String,
    #[serde(default)]
    pub stdout_truncated: bool,
    #[serde(default)]
    pub stderr_truncated: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepResult {
    pub fn succeeded(&self) -> bool {
        self.status == StepStatus::Success
    }

    /// Last few lines of stderr, falling back to stdout.
    pub fn output_tail(&self, lines: usize) -> String {
        let source = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let all: Vec<&str> = source.lines().collect();
        all[all.len().saturating_sub(lines)..].join("\n")
    }

    /// One-line description of a failed result for notes and warnings.
    pub fn failure_summary(&self) -> String {
        let outcome = match (self.status, self.exit_code) {
            (StepStatus::TimedOut, _) => "timed out".to_string(),
            (_, Some(code)) => format!("exited with code {}", code),
            _ => self.error.clone().unwrap_or_else(|| "failed".to_string()),
        };
        format!(
            "Step '{}' {} after {} attempt(s)",
            self.name, outcome, self.attempts
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_pipeline_record_with_defaults() {
        let step: Step = serde_json::from_str(
            r#"{"name":"build","commandTemplate":"make","onFailure":"warn-and-continue"}"#,
        )
        .unwrap();
        assert_eq!(step.timeout_seconds, 300.0);
        assert_eq!(step.retry_count, 0);
        assert_eq!(step.on_failure, FailurePolicy::WarnAndContinue);
        assert_eq!(step.backoff, BackoffStrategy::Fixed);
        assert_eq!(step.max_attempts(), 1);
    }

    #[test]
    fn rejects_unknown_failure_policy() {
        let result: Result<Step, _> = serde_json::from_str(
            r#"{"name":"x","commandTemplate":"true","onFailure":"ignore"}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let step = Step::new("s", "true").with_retries(3, 2.0);
        assert_eq!(step.backoff_after(1), Duration::from_secs(2));
        assert_eq!(step.backoff_after(3), Duration::from_secs(2));
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let step = Step::new("s", "true")
            .with_retries(5, 1.0)
            .with_backoff(BackoffStrategy::Exponential, Some(5.0));
        assert_eq!(step.backoff_after(1), Duration::from_secs(1));
        assert_eq!(step.backoff_after(2), Duration::from_secs(2));
        assert_eq!(step.backoff_after(3), Duration::from_secs(4));
        assert_eq!(step.backoff_after(4), Duration::from_secs(5));
    }

    #[test]
    fn invalid_numbers_are_reported() {
        let mut step = Step::new("", "").with_timeout(0.0);
        step.retry_backoff_seconds = -1.0;
        let mut problems = Vec::new();
        step.collect_problems("steps[0]", &mut problems);
        assert_eq!(problems.len(), 4);
    }

    #[test]
    fn status_wire_names() {
        assert_eq!(serde_json::to_value(StepStatus::TimedOut).unwrap(), "timed-out");
        assert_eq!(
            serde_json::to_value(FailurePolicy::TriggerRollback).unwrap(),
            "trigger-rollback"
        );
    }
}
