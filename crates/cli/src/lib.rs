pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use crate::commands::session::SessionAction;

#[derive(Debug, Parser)]
#[command(
    name = "sprout",
    about = "Sprout agent operator CLI",
    long_about = "Inspect configuration, check readiness, apply migrations, dry-run intent \
                  classification and tool planning, and read persisted conversation sessions.",
    after_help = "Examples:\n  sprout doctor --json\n  sprout classify \"查询所有学生人数\"\n  sprout session inspect 3f2a"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, model provider settings, DB connectivity and session storage")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Classify a message with the rule-based intent classifier")]
    Classify { query: String },
    #[command(about = "Show the ordered tool plan a message would run")]
    Plan { query: String },
    #[command(about = "Read sessions persisted by the server")]
    Session {
        #[command(subcommand)]
        action: SessionCommand,
        #[arg(long, global = true, help = "Session directory (defaults to sessions.storage_dir)")]
        dir: Option<PathBuf>,
    },
}

#[derive(Debug, Subcommand)]
enum SessionCommand {
    #[command(about = "List stored session ids")]
    List,
    #[command(about = "Summarize rounds, status and quality score of one session")]
    Inspect { id: String },
    #[command(about = "Print the full session snapshot")]
    Export { id: String },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::Classify { query } => commands::classify::run(&query),
        Command::Plan { query } => commands::plan::run(&query),
        Command::Session { action, dir } => {
            let action = match action {
                SessionCommand::List => SessionAction::List,
                SessionCommand::Inspect { id } => SessionAction::Inspect(id),
                SessionCommand::Export { id } => SessionAction::Export(id),
            };
            commands::session::run(action, dir)
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
