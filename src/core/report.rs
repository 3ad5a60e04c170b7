//! Run reports: the one structured artifact a run hands back to its caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::clock::{millis, Clock};
use crate::error::ErrorCode;
use crate::health::{HealthOutcome, Probe};
use crate::step::{FailurePolicy, StepResult, StepStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Succeeded,
    Failed,
    RolledBack,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::RolledBack => "rolled-back",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Succeeded => 0,
            RunStatus::Failed => 1,
            RunStatus::RolledBack => 2,
        }
    }

    fn severity(&self) -> u8 {
        match self {
            RunStatus::Succeeded => 0,
            RunStatus::RolledBack => 1,
            RunStatus::Failed => 2,
        }
    }

    /// Worst of several run outcomes: failed > rolled-back > succeeded.
    pub fn worst<I: IntoIterator<Item = RunStatus>>(statuses: I) -> RunStatus {
        statuses
            .into_iter()
            .max_by_key(|s| s.severity())
            .unwrap_or(RunStatus::Succeeded)
    }
}

/// A coded explanation attached to a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunNote {
    pub code: String,
    pub message: String,
}

impl RunNote {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.as_str().to_string(),
            message: message.into(),
        }
    }

    /// Note explaining a failed step: which one, how often it ran, and its output tail.
    pub fn for_step(result: &StepResult) -> Self {
        let code = match result.status {
            StepStatus::TimedOut => ErrorCode::RemoteCommandTimeout,
            _ => ErrorCode::RemoteCommandFailed,
        };
        let tail = result.output_tail(OUTPUT_TAIL_LINES);
        let message = if tail.trim().is_empty() {
            result.failure_summary()
        } else {
            format!("{}:\n{}", result.failure_summary(), tail)
        };
        Self::new(code, message)
    }
}

const OUTPUT_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub total_steps: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub next_actions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: String,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<String>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub captures: Vec<StepResult>,
    pub steps: Vec<StepResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    pub health: Option<HealthOutcome>,
    pub rollback: Option<Box<RunReport>>,
    pub rollback_attempted: bool,
    pub cancelled: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<RunNote>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub summary: RunSummary,
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }

    pub fn has_note(&self, code: ErrorCode) -> bool {
        self.notes.iter().any(|n| n.code == code.as_str())
    }
}

/// Accumulates the pieces of a report while a run is in flight.
pub struct ReportBuilder {
    run_id: String,
    target: String,
    pipeline: Option<String>,
    started_at: DateTime<Utc>,
    started: Instant,
    pub captures: Vec<StepResult>,
    pub steps: Vec<StepResult>,
    pub failed_step: Option<String>,
    pub health: Option<HealthOutcome>,
    pub rollback: Option<RunReport>,
    pub rollback_attempted: bool,
    pub cancelled: bool,
    pub notes: Vec<RunNote>,
    pub warnings: Vec<String>,
}

impl ReportBuilder {
    pub fn new(
        run_id: impl Into<String>,
        target: impl Into<String>,
        pipeline: Option<String>,
        clock: &dyn Clock,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            target: target.into(),
            pipeline,
            started_at: Utc::now(),
            started: clock.now(),
            captures: Vec::new(),
            steps: Vec::new(),
            failed_step: None,
            health: None,
            rollback: None,
            rollback_attempted: false,
            cancelled: false,
            notes: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn note(&mut self, code: ErrorCode, message: impl Into<String>) {
        self.notes.push(RunNote::new(code, message));
    }

    pub fn finish(self, status: RunStatus, clock: &dyn Clock) -> RunReport {
        let summary = build_summary(&self.steps, status);
        RunReport {
            run_id: self.run_id,
            target: self.target,
            pipeline: self.pipeline,
            status,
            started_at: self.started_at,
            finished_at: Utc::now(),
            duration_ms: millis(clock.now().saturating_duration_since(self.started)),
            captures: self.captures,
            steps: self.steps,
            failed_step: self.failed_step,
            health: self.health,
            rollback: self.rollback.map(Box::new),
            rollback_attempted: self.rollback_attempted,
            cancelled: self.cancelled,
            notes: self.notes,
            warnings: self.warnings,
            summary,
        }
    }
}

fn build_summary(steps: &[StepResult], status: RunStatus) -> RunSummary {
    let succeeded = steps.iter().filter(|s| s.status == StepStatus::Success).count();
    let failed = steps.iter().filter(|s| s.status == StepStatus::Failed).count();
    let timed_out = steps.iter().filter(|s| s.status == StepStatus::TimedOut).count();
    let attempts = steps.iter().map(|s| s.attempts).sum();

    let next_actions = match status {
        RunStatus::Succeeded => Vec::new(),
        RunStatus::RolledBack => vec![
            "The target was restored; fix the failing step and re-run the pipeline".to_string(),
        ],
        RunStatus::Failed => vec![
            "Inspect the notes and output tails, fix the issue and re-run (completed steps are expected to be idempotent)"
                .to_string(),
        ],
    };

    RunSummary {
        total_steps: steps.len(),
        succeeded,
        failed,
        timed_out,
        attempts,
        next_actions,
    }
}

/// One rendered command as it would run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedCommand {
    pub name: String,
    pub command: String,
    pub timeout_seconds: f64,
    pub retry_count: u32,
    pub on_failure: FailurePolicy,
}

/// What a dry run would execute, in order, without opening a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunPlan {
    pub target: String,
    pub destination: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub captures: Vec<PlannedCommand>,
    pub steps: Vec<PlannedCommand>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rollback: Vec<PlannedCommand>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub probes: Vec<Probe>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_deadline_seconds: Option<f64>,
}
