use clap::{Parser, Subcommand};

mod commands;
mod output;
mod tty;

use commands::{plan, run, validate};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "rollout")]
#[command(version = VERSION)]
#[command(about = "Run a deployment pipeline against remote targets, verify health, roll back on failure")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline against one or more targets
    Run(run::RunArgs),
    /// Render every command a run would execute, without connecting
    Plan(plan::PlanArgs),
    /// Check target and pipeline definitions without connecting
    Validate(validate::ValidateArgs),
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    let (json_result, exit_code) = commands::run_json(cli.command);

    if let Err(err) = output::print_json_result(json_result) {
        tty::status(&format!("Failed to write response: {}", err));
        return std::process::ExitCode::from(1);
    }

    std::process::ExitCode::from(exit_code_to_u8(exit_code))
}

fn exit_code_to_u8(code: i32) -> u8 {
    if code <= 0 {
        0
    } else if code >= 255 {
        255
    } else {
        code as u8
    }
}
