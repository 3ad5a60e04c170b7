//! Step execution: render, run with timeout, classify, retry.
//!
//! The executor never returns an error for an ordinary command failure. Every
//! outcome is encoded in the `StepResult` status so the pipeline can apply the
//! step's failure policy uniformly.

use chrono::{DateTime, Utc};

use crate::cancel::CancelToken;
use crate::clock::{millis, Clock};
use crate::error::{Error, Result};
use crate::step::{Step, StepResult, StepStatus};
use crate::transport::{CapturedText, RunError, Session};
use crate::utils::shell;
use crate::utils::template::{self, Variables};

/// Render a step's command template and scope it to its working directory.
pub fn render_command(step: &Step, variables: &Variables, default_dir: &str) -> Result<String> {
    let field = format!("steps.{}.commandTemplate", step.name);
    let rendered = template::render(&step.command_template, variables, &field)?;
    let dir = match step.working_directory.as_deref() {
        Some(dir) if !dir.trim().is_empty() => template::render_raw(dir, variables),
        _ => default_dir.to_string(),
    };
    Ok(shell::in_directory(&dir, &rendered))
}

struct Attempt {
    status: StepStatus,
    exit_code: Option<i32>,
    stdout: CapturedText,
    stderr: CapturedText,
    error: Option<String>,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    duration_ms: u64,
}

pub struct StepExecutor<'a> {
    clock: &'a dyn Clock,
    cancel: &'a CancelToken,
}

impl<'a> StepExecutor<'a> {
    pub fn new(clock: &'a dyn Clock, cancel: &'a CancelToken) -> Self {
        Self { clock, cancel }
    }

    pub fn cancel_token(&self) -> &'a CancelToken {
        self.cancel
    }

    /// Render and run `step`, retrying per its policy.
    pub fn execute(
        &self,
        session: &mut dyn Session,
        step: &Step,
        variables: &Variables,
        default_dir: &str,
    ) -> StepResult {
        match render_command(step, variables, default_dir) {
            Ok(command) => self.execute_rendered(session, step, &command),
            Err(err) => unrenderable(step, &err),
        }
    }

    /// Run an already rendered command under `step`'s timeout and retry policy.
    pub fn execute_rendered(&self, session: &mut dyn Session, step: &Step, command: &str) -> StepResult {
        let max_attempts = step.max_attempts();
        let mut backoffs_ms = Vec::new();
        let mut attempt_no = 1;

        loop {
            log_status!(
                "step",
                "{} (attempt {}/{})",
                step.name,
                attempt_no,
                max_attempts
            );

            let mut attempt = self.attempt(session, step, command);
            let mut done = attempt.status == StepStatus::Success || attempt_no >= max_attempts;

            if !done && self.cancel.is_cancelled() {
                attempt.error = Some(match attempt.error.take() {
                    Some(err) => format!("{}; retries stopped: run cancelled", err),
                    None => "retries stopped: run cancelled".to_string(),
                });
                done = true;
            }

            if done {
                return StepResult {
                    name: step.name.clone(),
                    command: command.to_string(),
                    status: attempt.status,
                    policy: step.on_failure,
                    exit_code: attempt.exit_code,
                    attempts: attempt_no,
                    backoffs_ms,
                    stdout: attempt.stdout.text,
                    stderr: attempt.stderr.text,
                    stdout_truncated: attempt.stdout.truncated,
                    stderr_truncated: attempt.stderr.truncated,
                    started_at: attempt.started_at,
                    finished_at: attempt.finished_at,
                    duration_ms: attempt.duration_ms,
                    error: attempt.error,
                };
            }

            let delay = step.backoff_after(attempt_no);
            log_status!(
                "step",
                "{} {}, retrying in {:.1}s",
                step.name,
                describe(&attempt),
                delay.as_secs_f64()
            );
            backoffs_ms.push(millis(delay));
            self.clock.sleep(delay);
            attempt_no += 1;
        }
    }

    fn attempt(&self, session: &mut dyn Session, step: &Step, command: &str) -> Attempt {
        let started_at = Utc::now();
        let started = self.clock.now();
        let outcome = session.run(command, step.timeout());
        let duration_ms = millis(self.clock.now().saturating_duration_since(started));
        let finished_at = Utc::now();

        match outcome {
            Ok(output) => {
                let status = if output.success() {
                    StepStatus::Success
                } else {
                    StepStatus::Failed
                };
                Attempt {
                    status,
                    exit_code: Some(output.exit_code),
                    stdout: output.stdout,
                    stderr: output.stderr,
                    error: None,
                    started_at,
                    finished_at,
                    duration_ms,
                }
            }
            Err(RunError::Timeout { output, .. }) => Attempt {
                status: StepStatus::TimedOut,
                exit_code: None,
                stdout: output.stdout,
                stderr: output.stderr,
                error: Some(Error::remote_command_timeout(&step.name, step.timeout_seconds).message),
                started_at,
                finished_at,
                duration_ms,
            },
            Err(RunError::Session(err)) => Attempt {
                status: StepStatus::Failed,
                exit_code: None,
                stdout: CapturedText::default(),
                stderr: CapturedText::default(),
                error: Some(err.message),
                started_at,
                finished_at,
                duration_ms,
            },
        }
    }
}

fn describe(attempt: &Attempt) -> String {
    match (attempt.status, attempt.exit_code) {
        (StepStatus::TimedOut, _) => "timed out".to_string(),
        (_, Some(code)) => format!("exited with code {}", code),
        _ => attempt.error.clone().unwrap_or_else(|| "failed".to_string()),
    }
}

fn unrenderable(step: &Step, err: &Error) -> StepResult {
    let now = Utc::now();
    StepResult {
        name: step.name.clone(),
        command: step.command_template.clone(),
        status: StepStatus::Failed,
        policy: step.on_failure,
        exit_code: None,
        attempts: 0,
        backoffs_ms: Vec::new(),
        stdout: String::new(),
        stderr: String::new(),
        stdout_truncated: false,
        stderr_truncated: false,
        started_at: now,
        finished_at: now,
        duration_ms: 0,
        error: Some(err.message.clone()),
    }
}
