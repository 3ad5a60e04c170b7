//! Rollback: run the declared restore plan as its own pipeline.
//!
//! The plan reuses the pipeline engine and health monitor against the same
//! session and variables, so captured last-known-good references are visible to
//! it. The result is a nested `RunReport`; its failure is always terminal.

use crate::cancel::CancelToken;
use crate::clock::{seconds, Clock};
use crate::error::ErrorCode;
use crate::executor::StepExecutor;
use crate::health::{HealthMonitor, ProbeChecker, ProbeScope};
use crate::pipeline::{Pipeline, PipelineEngine, PipelineState, RollbackPlan};
use crate::report::{ReportBuilder, RunNote, RunReport, RunStatus};
use crate::target::Target;
use crate::transport::Session;
use crate::utils::template::Variables;

pub struct RollbackController<'a> {
    clock: &'a dyn Clock,
    checker: &'a dyn ProbeChecker,
}

impl<'a> RollbackController<'a> {
    pub fn new(clock: &'a dyn Clock, checker: &'a dyn ProbeChecker) -> Self {
        Self { clock, checker }
    }

    /// Execute `plan` and re-verify health with the pipeline's probes.
    ///
    /// Rollback is not cancellable: once started it runs to completion or failure.
    #[allow(clippy::too_many_arguments)]
    pub fn execute(
        &self,
        plan: &RollbackPlan,
        pipeline: &Pipeline,
        session: &mut dyn Session,
        target: &Target,
        variables: &Variables,
        run_id: &str,
        reason: &str,
    ) -> RunReport {
        log_status!("rollback", "{}: {}", target.label(), reason);

        let pipeline_name = pipeline
            .name
            .as_ref()
            .map(|name| format!("{} (rollback)", name))
            .or_else(|| Some("rollback".to_string()));
        let mut report = ReportBuilder::new(
            format!("{}-rollback", run_id),
            target.label(),
            pipeline_name,
            self.clock,
        );

        let cancel = CancelToken::new();
        let executor = StepExecutor::new(self.clock, &cancel);
        let engine = PipelineEngine::new(&executor);
        let run = engine.run(
            "rollback",
            &plan.steps,
            session,
            variables,
            &target.working_directory,
        );

        report.warnings.extend(run.warnings.iter().cloned());
        report.failed_step = run.failed_step().map(str::to_string);
        if let Some(failed) = run.results.iter().find(|r| Some(r.name.as_str()) == run.failed_step()) {
            report.notes.push(RunNote::for_step(failed));
        }
        report.steps = run.results;

        let status = match run.state {
            PipelineState::Completed if pipeline.probes.is_empty() => RunStatus::Succeeded,
            PipelineState::Completed => {
                let monitor = HealthMonitor::new(self.clock, &cancel);
                let mut scope = ProbeScope {
                    session,
                    target,
                    variables,
                };
                let outcome = monitor.await_healthy(
                    &pipeline.probes,
                    seconds(pipeline.health_deadline_seconds()),
                    self.checker,
                    &mut scope,
                );
                let healthy = outcome.is_ok();
                if !healthy {
                    report.note(
                        ErrorCode::ProbeUnsatisfied,
                        format!(
                            "Health not restored after rollback; unsatisfied: {}",
                            outcome.unsatisfied.join(", ")
                        ),
                    );
                }
                report.health = Some(outcome);
                if healthy {
                    RunStatus::Succeeded
                } else {
                    RunStatus::Failed
                }
            }
            _ => RunStatus::Failed,
        };

        log_status!("rollback", "{}: rollback {}", target.label(), status.as_str());
        report.finish(status, self.clock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Credential;
    use crate::health::{Probe, ProbeType};
    use crate::step::Step;
    use crate::core::testing::{ManualClock, Reply, ScriptedChecker, ScriptedTransport};
    use crate::transport::Transport;

    fn pipeline(probes: Vec<Probe>) -> Pipeline {
        Pipeline::new(vec![Step::new("deploy", "deploy")])
            .with_rollback(vec![
                Step::new("revert", "git checkout {{previousCommit}}"),
                Step::new("restart", "systemctl restart app"),
            ])
            .with_probes(probes)
    }

    fn execute(transport: &ScriptedTransport, checker: &ScriptedChecker, pipeline: &Pipeline) -> RunReport {
        let clock = ManualClock::new();
        let target = Target::new("web-1", "/srv/app");
        let mut session = transport.open(&target, &Credential::Agent).unwrap();
        let mut vars = Variables::new();
        vars.insert("previousCommit".to_string(), "abc123".to_string());
        let plan = pipeline.rollback.clone().unwrap();

        RollbackController::new(&clock, checker).execute(
            &plan,
            pipeline,
            session.as_mut(),
            &target,
            &vars,
            "run-1",
            "step 'deploy' failed",
        )
    }

    #[test]
    fn completed_plan_without_probes_succeeds() {
        let transport = ScriptedTransport::new();
        let report = execute(&transport, &ScriptedChecker::new(), &pipeline(Vec::new()));

        assert_eq!(report.status, RunStatus::Succeeded);
        assert_eq!(report.run_id, "run-1-rollback");
        assert_eq!(report.steps.len(), 2);
        assert!(report.rollback.is_none());
        assert_eq!(transport.commands()[0], "cd '/srv/app' && git checkout abc123");
    }

    #[test]
    fn failing_rollback_step_is_terminal() {
        let transport = ScriptedTransport::new().on("git checkout", vec![Reply::Exit(1, "")]);
        let report = execute(&transport, &ScriptedChecker::new(), &pipeline(Vec::new()));

        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.failed_step.as_deref(), Some("revert"));
        assert_eq!(report.steps.len(), 1);
        assert_eq!(transport.count("systemctl"), 0);
    }

    #[test]
    fn health_is_rechecked_after_rollback() {
        let probe = Probe::new(ProbeType::HttpStatus, "/health").named("web");
        let transport = ScriptedTransport::new();

        let healthy = execute(&transport, &ScriptedChecker::new().satisfy("web", 2), &pipeline(vec![probe.clone()]));
        assert_eq!(healthy.status, RunStatus::Succeeded);
        assert!(healthy.health.unwrap().is_ok());

        let unhealthy = execute(&transport, &ScriptedChecker::new(), &pipeline(vec![probe]));
        assert_eq!(unhealthy.status, RunStatus::Failed);
        assert!(unhealthy.has_note(ErrorCode::ProbeUnsatisfied));
    }
}
