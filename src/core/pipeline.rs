use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::defaults;
use crate::executor::StepExecutor;
use crate::health::{within_health_bound, Probe};
use crate::step::{FailurePolicy, Step, StepResult};
use crate::transport::Session;
use crate::utils::template::Variables;

/// A deployment definition: ordered steps plus everything around them.
///
/// The step sequence is immutable once a run begins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pipeline {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackPlan>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub probes: Vec<Probe>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, String>,
    /// Last-known-good references captured before the first step runs.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub capture: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_deadline_seconds: Option<f64>,
}

impl Pipeline {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            name: None,
            steps,
            rollback: None,
            probes: Vec::new(),
            variables: BTreeMap::new(),
            capture: BTreeMap::new(),
            health_deadline_seconds: None,
        }
    }

    pub fn with_rollback(mut self, steps: Vec<Step>) -> Self {
        self.rollback = Some(RollbackPlan { steps });
        self
    }

    pub fn with_probes(mut self, probes: Vec<Probe>) -> Self {
        self.probes = probes;
        self
    }

    pub fn with_capture(mut self, name: impl Into<String>, command: impl Into<String>) -> Self {
        self.capture.insert(name.into(), command.into());
        self
    }

    /// Shared deadline for all probes: configured, else the longest probe wait.
    pub fn health_deadline_seconds(&self) -> f64 {
        self.health_deadline_seconds.unwrap_or_else(|| {
            self.probes
                .iter()
                .map(|p| p.max_wait_seconds)
                .fold(0.0, f64::max)
        })
    }

    pub(crate) fn collect_problems(&self, problems: &mut Vec<String>) {
        if self.steps.is_empty() {
            problems.push("pipeline.steps must contain at least one step".to_string());
        }
        collect_step_problems("steps", &self.steps, problems);

        if let Some(plan) = &self.rollback {
            if plan.steps.is_empty() {
                problems.push("pipeline.rollback must contain at least one step".to_string());
            }
            collect_step_problems("rollback", &plan.steps, problems);
            for step in &plan.steps {
                if step.on_failure == FailurePolicy::TriggerRollback {
                    problems.push(format!(
                        "rollback.{}.onFailure cannot be trigger-rollback",
                        step.name
                    ));
                }
            }
        }

        for (idx, probe) in self.probes.iter().enumerate() {
            probe.collect_problems(&format!("probes[{}]", idx), problems);
        }

        if let Some(deadline) = self.health_deadline_seconds {
            if !within_health_bound(deadline) {
                problems.push(format!(
                    "pipeline.healthDeadlineSeconds must be a positive number of at most {}",
                    defaults::MAX_HEALTH_WAIT_SECS
                ));
            }
        }

        for (name, command) in &self.capture {
            if command.trim().is_empty() {
                problems.push(format!("capture.{} must not be empty", name));
            }
        }
    }
}

fn collect_step_problems(field: &str, steps: &[Step], problems: &mut Vec<String>) {
    let mut seen = HashSet::new();
    for (idx, step) in steps.iter().enumerate() {
        step.collect_problems(&format!("{}[{}]", field, idx), problems);
        if !seen.insert(step.name.as_str()) {
            problems.push(format!("Duplicate step name '{}' in {}", step.name, field));
        }
    }
}

/// A secondary pipeline that restores a known-good state. Always declared
/// ahead of time; the engine never infers one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RollbackPlan {
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    StepFailed { step: String },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineState {
    NotStarted,
    Running(usize),
    Completed,
    Aborted(AbortReason),
    RollbackTriggered { step: String },
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PipelineState::NotStarted | PipelineState::Running(_))
    }
}

/// Transition out of `Running(index)` once that step's result is final.
pub fn next_state(index: usize, step_count: usize, result: &StepResult) -> PipelineState {
    if result.succeeded() {
        return advance(index, step_count);
    }

    match result.policy {
        FailurePolicy::Abort => PipelineState::Aborted(AbortReason::StepFailed {
            step: result.name.clone(),
        }),
        FailurePolicy::WarnAndContinue => advance(index, step_count),
        FailurePolicy::TriggerRollback => PipelineState::RollbackTriggered {
            step: result.name.clone(),
        },
    }
}

fn advance(index: usize, step_count: usize) -> PipelineState {
    if index + 1 >= step_count {
        PipelineState::Completed
    } else {
        PipelineState::Running(index + 1)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub state: PipelineState,
    pub results: Vec<StepResult>,
    pub warnings: Vec<String>,
}

impl PipelineRun {
    /// Name of the step whose failure ended the run, if any.
    pub fn failed_step(&self) -> Option<&str> {
        match &self.state {
            PipelineState::Aborted(AbortReason::StepFailed { step })
            | PipelineState::RollbackTriggered { step } => Some(step),
            _ => None,
        }
    }
}

/// Drives a step sequence strictly in declared order, one step at a time.
pub struct PipelineEngine<'a> {
    executor: &'a StepExecutor<'a>,
}

impl<'a> PipelineEngine<'a> {
    pub fn new(executor: &'a StepExecutor<'a>) -> Self {
        Self { executor }
    }

    pub fn run(
        &self,
        label: &str,
        steps: &[Step],
        session: &mut dyn Session,
        variables: &Variables,
        default_dir: &str,
    ) -> PipelineRun {
        let cancel = self.executor.cancel_token();
        let mut results = Vec::with_capacity(steps.len());
        let mut warnings = Vec::new();

        let mut state = if steps.is_empty() {
            PipelineState::Completed
        } else {
            PipelineState::Running(0)
        };

        while let PipelineState::Running(index) = state {
            if cancel.is_cancelled() {
                log_status!("pipeline", "{}: cancelled before step {}", label, steps[index].name);
                state = PipelineState::Aborted(AbortReason::Cancelled);
                break;
            }

            let step = &steps[index];
            let result = self.executor.execute(session, step, variables, default_dir);
            state = next_state(index, steps.len(), &result);

            if !result.succeeded() {
                match step.on_failure {
                    FailurePolicy::WarnAndContinue => {
                        let warning = format!("{}; continuing", result.failure_summary());
                        log_status!("pipeline", "{}: {}", label, warning);
                        warnings.push(warning);
                    }
                    FailurePolicy::Abort => {
                        log_status!("pipeline", "{}: {}; aborting", label, result.failure_summary());
                    }
                    FailurePolicy::TriggerRollback => {
                        log_status!(
                            "pipeline",
                            "{}: {}; rollback triggered",
                            label,
                            result.failure_summary()
                        );
                    }
                }
            }

            results.push(result);
        }

        if state == PipelineState::Completed {
            log_status!("pipeline", "{}: completed {} step(s)", label, results.len());
        }

        PipelineRun {
            state,
            results,
            warnings,
        }
    }
}
