use clap::Args;
use serde::Serialize;

use rollout::config;

use super::{CmdResult, DefinitionArgs};

#[derive(Args)]
pub struct ValidateArgs {
    #[command(flatten)]
    pub definitions: DefinitionArgs,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateOutput {
    pub command: String,
    pub valid: bool,
    pub targets: Vec<String>,
    pub steps: usize,
    pub rollback_steps: usize,
    pub probes: usize,
}

pub fn run(args: ValidateArgs) -> CmdResult<ValidateOutput> {
    let defs = args.definitions.load()?;
    config::validate_all(&defs.targets, &defs.pipeline, &defs.overrides)?;

    Ok((
        ValidateOutput {
            command: "validate".to_string(),
            valid: true,
            targets: defs.targets.iter().map(|t| t.label().to_string()).collect(),
            steps: defs.pipeline.steps.len(),
            rollback_steps: defs.pipeline.rollback.as_ref().map_or(0, |r| r.steps.len()),
            probes: defs.pipeline.probes.len(),
        },
        0,
    ))
}
