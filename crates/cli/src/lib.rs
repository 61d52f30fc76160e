pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "relaydesk",
    about = "Relaydesk operator CLI",
    long_about = "Apply migrations, inspect effective configuration and agent definitions, and run readiness checks.",
    after_help = "Examples:\n  relaydesk doctor --json\n  relaydesk config\n  relaydesk agents --dir config/agents"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Print the effective configuration with secrets redacted and value sources")]
    Config,
    #[command(about = "Load agent definitions and list them with their kind")]
    Agents {
        #[arg(long, help = "Agent definition directory (defaults to agents.config_dir)")]
        dir: Option<PathBuf>,
    },
    #[command(about = "Validate config, agent definitions, Slack readiness, and DB connectivity")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => commands::config::run(),
        Command::Agents { dir } => commands::agents::run(dir),
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
