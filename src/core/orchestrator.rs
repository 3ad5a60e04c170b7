//! One run end to end: validate, connect, capture, steps, health, rollback.

use std::sync::Arc;
use std::thread;

use crate::cancel::CancelToken;
use crate::clock::{seconds, Clock, SystemClock};
use crate::config;
use crate::credentials::{CredentialProvider, DefaultCredentialProvider};
use crate::defaults;
use crate::error::{Error, ErrorCode, Result};
use crate::executor::{render_command, StepExecutor};
use crate::health::{DefaultProbeChecker, HealthMonitor, HealthStatus, ProbeChecker, ProbeScope};
use crate::pipeline::{AbortReason, Pipeline, PipelineEngine, PipelineState};
use crate::report::{PlannedCommand, ReportBuilder, RunNote, RunPlan, RunReport, RunStatus};
use crate::rollback::RollbackController;
use crate::step::Step;
use crate::target::Target;
use crate::transport::{DefaultTransport, Session, SessionGuard, Transport};
use crate::utils::template::Variables;

/// How the main sequence ended.
enum Outcome {
    Succeeded,
    Failed,
    NeedsRollback(String),
    Cancelled,
}

pub struct Orchestrator {
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialProvider>,
    checker: Arc<dyn ProbeChecker>,
    clock: Arc<dyn Clock>,
}

impl Orchestrator {
    pub fn new(
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialProvider>,
        checker: Arc<dyn ProbeChecker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            transport,
            credentials,
            checker,
            clock,
        }
    }

    /// SSH (or local) transport, built-in credential schemes, real HTTP probes.
    pub fn with_defaults() -> Result<Self> {
        Ok(Self::new(
            DefaultTransport::shared(defaults::OUTPUT_CAP_BYTES),
            Arc::new(DefaultCredentialProvider),
            Arc::new(DefaultProbeChecker::new()?),
            Arc::new(SystemClock),
        ))
    }

    pub fn validate(&self, target: &Target, pipeline: &Pipeline, overrides: &Variables) -> Result<()> {
        config::validate(target, pipeline, overrides)
    }

    /// Render every command a run would execute, without connecting.
    pub fn plan(&self, target: &Target, pipeline: &Pipeline, overrides: &Variables) -> Result<RunPlan> {
        config::validate(target, pipeline, overrides)?;

        let mut vars = config::base_variables(target, pipeline, overrides, "dry-run");
        let captures = pipeline
            .capture
            .iter()
            .map(|(name, command)| {
                let step = capture_step(name, command);
                planned(&step, &vars, &target.working_directory)
            })
            .collect::<Result<Vec<_>>>()?;

        for name in pipeline.capture.keys() {
            vars.entry(name.clone()).or_insert_with(|| format!("<{}>", name));
        }

        let steps = pipeline
            .steps
            .iter()
            .map(|step| planned(step, &vars, &target.working_directory))
            .collect::<Result<Vec<_>>>()?;

        let rollback = pipeline
            .rollback
            .iter()
            .flat_map(|plan| plan.steps.iter())
            .map(|step| planned(step, &vars, &target.working_directory))
            .collect::<Result<Vec<_>>>()?;

        Ok(RunPlan {
            target: target.label().to_string(),
            destination: target.destination(),
            pipeline: pipeline.name.clone(),
            captures,
            steps,
            rollback,
            probes: pipeline.probes.clone(),
            health_deadline_seconds: if pipeline.probes.is_empty() {
                None
            } else {
                Some(pipeline.health_deadline_seconds())
            },
        })
    }

    /// Run `pipeline` against `target`.
    ///
    /// Configuration, credential and connection problems are returned as `Err`
    /// before any step runs. Everything after the session opens is reported in
    /// the `RunReport`.
    pub fn run(
        &self,
        target: &Target,
        pipeline: &Pipeline,
        overrides: &Variables,
        cancel: &CancelToken,
    ) -> Result<RunReport> {
        config::validate(target, pipeline, overrides)?;

        let run_id = uuid::Uuid::new_v4().to_string();
        let clock = self.clock.as_ref();

        if cancel.is_cancelled() {
            log_status!("run", "{}: cancelled before connecting", target.label());
            let mut report = ReportBuilder::new(run_id.as_str(), target.label(), pipeline.name.clone(), clock);
            report.cancelled = true;
            report.note(ErrorCode::RunCancelled, "Run cancelled before connecting");
            return Ok(report.finish(RunStatus::Failed, clock));
        }

        let credential = self.credentials.resolve(target.credential_ref.as_deref())?;
        log_status!("run", "{}: starting run {}", target.label(), run_id);

        let session = self.transport.open(target, &credential)?;
        let mut guard = SessionGuard::new(session, target.label());

        let mut report = ReportBuilder::new(run_id.as_str(), target.label(), pipeline.name.clone(), clock);
        let mut vars = config::base_variables(target, pipeline, overrides, &run_id);

        let outcome = self.execute(
            guard.session(),
            target,
            pipeline,
            overrides,
            cancel,
            &mut vars,
            &mut report,
        );

        let status = match outcome {
            Outcome::Succeeded => RunStatus::Succeeded,
            Outcome::Failed => RunStatus::Failed,
            Outcome::Cancelled => {
                report.cancelled = true;
                if cancel.rollback_requested() && pipeline.rollback.is_some() {
                    self.roll_back(guard.session(), target, pipeline, &vars, &run_id, "run cancelled", &mut report)
                } else {
                    RunStatus::Failed
                }
            }
            Outcome::NeedsRollback(reason) => {
                self.roll_back(guard.session(), target, pipeline, &vars, &run_id, &reason, &mut report)
            }
        };

        if let Err(err) = guard.close() {
            report
                .warnings
                .push(format!("Session close failed: {}", err.message));
        }

        log_status!("run", "{}: {}", target.label(), status.as_str());
        Ok(report.finish(status, clock))
    }

    /// Run each target independently; with `parallel`, one thread per target.
    pub fn run_all(
        &self,
        targets: &[Target],
        pipeline: &Pipeline,
        overrides: &Variables,
        cancel: &CancelToken,
        parallel: bool,
    ) -> Vec<Result<RunReport>> {
        if !parallel || targets.len() < 2 {
            return targets
                .iter()
                .map(|target| self.run(target, pipeline, overrides, cancel))
                .collect();
        }

        thread::scope(|scope| {
            let handles: Vec<_> = targets
                .iter()
                .map(|target| scope.spawn(move || self.run(target, pipeline, overrides, cancel)))
                .collect();

            handles
                .into_iter()
                .map(|handle| {
                    handle.join().unwrap_or_else(|_| {
                        Err(Error::internal_unexpected("run thread panicked"))
                    })
                })
                .collect()
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn execute(
        &self,
        session: &mut dyn Session,
        target: &Target,
        pipeline: &Pipeline,
        overrides: &Variables,
        cancel: &CancelToken,
        vars: &mut Variables,
        report: &mut ReportBuilder,
    ) -> Outcome {
        let clock = self.clock.as_ref();
        let executor = StepExecutor::new(clock, cancel);

        for (name, command) in &pipeline.capture {
            if cancel.is_cancelled() {
                report.note(
                    ErrorCode::RunCancelled,
                    format!("Run cancelled before capture '{}'", name),
                );
                return Outcome::Cancelled;
            }

            let step = capture_step(name, command);
            let result = executor.execute(session, &step, vars, &target.working_directory);
            if !result.succeeded() {
                report.notes.push(RunNote::for_step(&result));
                report.failed_step = Some(result.name.clone());
                report.captures.push(result);
                return Outcome::Failed;
            }
            // A truncated value is not a usable last-known-good reference.
            if result.stdout_truncated {
                report.note(
                    ErrorCode::RemoteCommandFailed,
                    format!(
                        "Capture '{}' exceeded the output cap; a truncated value cannot be used",
                        name
                    ),
                );
                report.failed_step = Some(result.name.clone());
                report.captures.push(result);
                return Outcome::Failed;
            }
            vars.insert(name.clone(), result.stdout.trim().to_string());
            report.captures.push(result);
        }
        // Explicit overrides win over captured values.
        vars.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));

        let engine = PipelineEngine::new(&executor);
        let run = engine.run("deploy", &pipeline.steps, session, vars, &target.working_directory);

        report.warnings.extend(run.warnings.iter().cloned());
        report.failed_step = run.failed_step().map(str::to_string);
        if let Some(failed) = run.results.iter().find(|r| Some(r.name.as_str()) == run.failed_step()) {
            report.notes.push(RunNote::for_step(failed));
        }
        report.steps = run.results;

        match run.state {
            PipelineState::Completed => {}
            PipelineState::Aborted(AbortReason::Cancelled) => {
                report.note(ErrorCode::RunCancelled, "Run cancelled between steps");
                return Outcome::Cancelled;
            }
            PipelineState::RollbackTriggered { step } => {
                let reason = format!("step '{}' failed with trigger-rollback", step);
                if pipeline.rollback.is_none() {
                    report.note(
                        ErrorCode::RollbackFailed,
                        format!("{}, but the pipeline declares no rollback plan", reason),
                    );
                    return Outcome::Failed;
                }
                return Outcome::NeedsRollback(reason);
            }
            _ => return Outcome::Failed,
        }

        if pipeline.probes.is_empty() {
            return Outcome::Succeeded;
        }

        let monitor = HealthMonitor::new(clock, cancel);
        let mut scope = ProbeScope {
            session,
            target,
            variables: &*vars,
        };
        let outcome = monitor.await_healthy(
            &pipeline.probes,
            seconds(pipeline.health_deadline_seconds()),
            self.checker.as_ref(),
            &mut scope,
        );
        let status = outcome.status;
        let unsatisfied = outcome.unsatisfied.join(", ");
        report.health = Some(outcome);

        match status {
            HealthStatus::Ok => Outcome::Succeeded,
            HealthStatus::Cancelled => {
                report.note(ErrorCode::RunCancelled, "Run cancelled while waiting for health");
                Outcome::Cancelled
            }
            HealthStatus::TimedOut => {
                report.note(
                    ErrorCode::ProbeUnsatisfied,
                    format!("Health deadline passed; unsatisfied: {}", unsatisfied),
                );
                if pipeline.rollback.is_some() {
                    Outcome::NeedsRollback(format!("health check timed out ({})", unsatisfied))
                } else {
                    Outcome::Failed
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn roll_back(
        &self,
        session: &mut dyn Session,
        target: &Target,
        pipeline: &Pipeline,
        vars: &Variables,
        run_id: &str,
        reason: &str,
        report: &mut ReportBuilder,
    ) -> RunStatus {
        let Some(plan) = pipeline.rollback.as_ref() else {
            return RunStatus::Failed;
        };

        let controller = RollbackController::new(self.clock.as_ref(), self.checker.as_ref());
        let rollback = controller.execute(plan, pipeline, session, target, vars, run_id, reason);
        report.rollback_attempted = true;

        let status = if rollback.status == RunStatus::Succeeded {
            RunStatus::RolledBack
        } else {
            report.note(
                ErrorCode::RollbackFailed,
                format!("Rollback was attempted after {} and itself failed", reason),
            );
            RunStatus::Failed
        };
        report.rollback = Some(rollback);
        status
    }
}

fn capture_step(name: &str, command: &str) -> Step {
    Step::new(format!("capture:{}", name), command).with_timeout(defaults::CAPTURE_TIMEOUT_SECS)
}

fn planned(step: &Step, vars: &Variables, default_dir: &str) -> Result<PlannedCommand> {
    Ok(PlannedCommand {
        name: step.name.clone(),
        command: render_command(step, vars, default_dir)?,
        timeout_seconds: step.timeout_seconds,
        retry_count: step.retry_count,
        on_failure: step.on_failure,
    })
}
