use clap::Args;
use serde::Serialize;
use std::path::PathBuf;

use rollout::utils::io;
use rollout::{CancelToken, Orchestrator, RunReport, RunStatus};

use super::plan::{self, PlanOutput};
use super::{CmdResult, DefinitionArgs};

#[derive(Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub definitions: DefinitionArgs,

    /// Render every command without connecting or executing anything
    #[arg(long)]
    pub dry_run: bool,

    /// On Ctrl-C, run the declared rollback plan after the current command
    #[arg(long)]
    pub rollback_on_cancel: bool,

    /// Also write the run report(s) to this file
    #[arg(long, value_name = "PATH")]
    pub report: Option<PathBuf>,

    /// Run multiple targets concurrently, one session each
    #[arg(long)]
    pub parallel: bool,
}

#[derive(Serialize)]
#[serde(untagged)]
pub enum RunCommandOutput {
    Run(RunOutput),
    Plan(PlanOutput),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutput {
    pub command: String,
    pub status: RunStatus,
    pub runs: Vec<TargetRun>,
}

/// Per-target entry: a report, or the hard error that stopped the run before it began.
#[derive(Serialize)]
#[serde(untagged)]
pub enum TargetRun {
    Report(Box<RunReport>),
    Error(TargetError),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetError {
    pub target: String,
    pub status: RunStatus,
    pub code: String,
    pub message: String,
    pub details: serde_json::Value,
}

pub fn run(args: RunArgs) -> CmdResult<RunCommandOutput> {
    let defs = args.definitions.load()?;

    if args.dry_run {
        let output = plan::render(&defs, "run --dry-run")?;
        return Ok((RunCommandOutput::Plan(output), 0));
    }

    let orchestrator = Orchestrator::with_defaults()?;
    let cancel = cancel_on_interrupt(args.rollback_on_cancel);

    let results = orchestrator.run_all(
        &defs.targets,
        &defs.pipeline,
        &defs.overrides,
        &cancel,
        args.parallel,
    );

    let single = defs.targets.len() == 1;
    let mut runs = Vec::with_capacity(results.len());
    for (target, result) in defs.targets.iter().zip(results) {
        match result {
            Ok(report) => runs.push(TargetRun::Report(Box::new(report))),
            // A single target's hard error is the command's error.
            Err(err) if single => return Err(err),
            Err(err) => runs.push(TargetRun::Error(TargetError {
                target: target.label().to_string(),
                status: RunStatus::Failed,
                code: err.code.as_str().to_string(),
                message: err.message,
                details: err.details,
            })),
        }
    }

    let status = RunStatus::worst(runs.iter().map(|run| match run {
        TargetRun::Report(report) => report.status,
        TargetRun::Error(err) => err.status,
    }));

    let output = RunOutput {
        command: "run".to_string(),
        status,
        runs,
    };

    if let Some(path) = args.report.as_ref() {
        let content = serde_json::to_string_pretty(&output).map_err(|e| {
            rollout::Error::internal_json(e.to_string(), Some("serialize run report".to_string()))
        })?;
        io::write_file_atomic(path, &content, "write run report")?;
    }

    Ok((RunCommandOutput::Run(output), status.exit_code()))
}

fn cancel_on_interrupt(with_rollback: bool) -> CancelToken {
    let token = CancelToken::new();
    let handler_token = token.clone();

    let installed = ctrlc::set_handler(move || {
        if with_rollback {
            handler_token.cancel_with_rollback();
        } else {
            handler_token.cancel();
        }
        rollout::log_status!("run", "Interrupt received; stopping after the current command");
    });

    if let Err(err) = installed {
        rollout::log_status!("run", "Cannot install interrupt handler: {}", err);
    }
    token
}
