mod builtins;
mod commands;
mod output;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tracing_subscriber::EnvFilter;

use commands::run::RunArgs;
use commands::validate::ValidateArgs;

/// Validate flow graphs and run them over batches of input rows
#[derive(Parser, Debug)]
#[command(name = "flowexec", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check a flow file for syntax and graph errors
    Validate(ValidateArgs),
    /// Run a flow over a JSON-lines batch
    Run(RunArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::Validate(args) => commands::validate::execute(args),
        Command::Run(args) => commands::run::execute(args).await,
    }
}
