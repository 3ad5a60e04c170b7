use clap::Args;

use rollout::config;
use rollout::utils::template::Variables;
use rollout::{Pipeline, Target};

pub type CmdResult<T> = rollout::Result<(T, i32)>;

/// Definition arguments shared by every command.
#[derive(Args, Debug, Clone)]
pub struct DefinitionArgs {
    /// Target definition: .json/.yaml/.yml/.toml file, inline JSON, or - for stdin
    #[arg(long, short = 't', value_name = "FILE|JSON")]
    pub target: String,

    /// Pipeline definition: .json/.yaml/.yml/.toml file, inline JSON, or - for stdin
    #[arg(long, short = 'p', value_name = "FILE|JSON")]
    pub pipeline: String,

    /// Template variable override, highest precedence (repeatable)
    #[arg(long = "var", value_name = "KEY=VALUE")]
    pub vars: Vec<String>,
}

pub struct Definitions {
    pub targets: Vec<Target>,
    pub pipeline: Pipeline,
    pub overrides: Variables,
}

impl DefinitionArgs {
    pub fn load(&self) -> rollout::Result<Definitions> {
        if self.target.trim() == "-" && self.pipeline.trim() == "-" {
            return Err(rollout::Error::validation_invalid_argument(
                "stdin",
                "Only one of --target and --pipeline can be read from stdin",
                None,
                None,
            ));
        }

        Ok(Definitions {
            targets: config::load_targets(&self.target)?,
            pipeline: config::load_pipeline(&self.pipeline)?,
            overrides: config::parse_overrides(&self.vars)?,
        })
    }
}

pub mod plan;
pub mod run;
pub mod validate;

/// Dispatch a command to its handler and map result to JSON.
macro_rules! dispatch {
    ($args:expr, $module:ident) => {
        crate::output::map_cmd_result_to_json($module::run($args))
    };
}

pub(crate) fn run_json(
    command: crate::Commands,
) -> (rollout::Result<serde_json::Value>, i32) {
    crate::tty::status("rollout is working...");

    match command {
        crate::Commands::Run(args) => dispatch!(args, run),
        crate::Commands::Plan(args) => dispatch!(args, plan),
        crate::Commands::Validate(args) => dispatch!(args, validate),
    }
}
