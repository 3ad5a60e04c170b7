use clap::Args;
use serde::Serialize;

use rollout::{Orchestrator, RunPlan};

use super::{CmdResult, DefinitionArgs, Definitions};

#[derive(Args)]
pub struct PlanArgs {
    #[command(flatten)]
    pub definitions: DefinitionArgs,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanOutput {
    pub command: String,
    pub plans: Vec<RunPlan>,
}

pub fn run(args: PlanArgs) -> CmdResult<PlanOutput> {
    let defs = args.definitions.load()?;
    Ok((render(&defs, "plan")?, 0))
}

/// Render every target's plan; shared with `run --dry-run`.
pub(crate) fn render(defs: &Definitions, command: &str) -> rollout::Result<PlanOutput> {
    let orchestrator = Orchestrator::with_defaults()?;
    let plans = defs
        .targets
        .iter()
        .map(|target| orchestrator.plan(target, &defs.pipeline, &defs.overrides))
        .collect::<rollout::Result<Vec<_>>>()?;

    Ok(PlanOutput {
        command: command.to_string(),
        plans,
    })
}
