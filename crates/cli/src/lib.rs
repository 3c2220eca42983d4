pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "concierge",
    about = "Concierge operator CLI",
    long_about = "Operate Concierge knowledge bases: migrations, config inspection, ingestion, retrieval checks and the human handoff queue.",
    after_help = "Examples:\n  concierge migrate\n  concierge ingest --tenant acme --file faq.json\n  concierge search --tenant acme --query \"return policy\"\n  concierge handoffs"
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
    #[command(about = "Extract, chunk and embed a JSON or text file into a knowledge base")]
    Ingest {
        #[arg(long, help = "Existing or new tenant id; a fresh id is minted when omitted")]
        tenant: Option<String>,
        #[arg(long, help = "Display name stored with a new tenant")]
        name: Option<String>,
        #[arg(long, help = "Path to a .json document or a plain text file")]
        file: PathBuf,
    },
    #[command(about = "Run a similarity query against a tenant knowledge base")]
    Search {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        query: String,
        #[arg(long, default_value_t = 5)]
        k: usize,
    },
    #[command(about = "List pending human handoff requests, oldest first")]
    Handoffs,
    #[command(about = "Resolve a pending handoff request")]
    Resolve {
        #[arg(long)]
        request: String,
        #[arg(long)]
        response: String,
        #[arg(long, help = "Also add the response to the tenant knowledge base")]
        update_kb: bool,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Ingest { tenant, name, file } => commands::ingest::run(tenant, name, &file),
        Command::Search { tenant, query, k } => commands::search::run(&tenant, &query, k),
        Command::Handoffs => commands::handoffs::list(),
        Command::Resolve { request, response, update_kb } => {
            commands::handoffs::resolve(&request, &response, update_kb)
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
