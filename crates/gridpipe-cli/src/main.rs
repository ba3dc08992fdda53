//! Operational binary for gridpipe pipelines.
//!
//! Validates configuration, inspects the code archive, and reads staged
//! tables through whichever backend the pipeline is configured for. Running
//! pipelines stays in library code; this binary never submits operations.

mod commands;
mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "gridpipe",
    version,
    about = "Operational tooling for gridpipe pipelines"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Path to the pipeline YAML file
    #[arg(long, default_value = "pipeline.yaml", global = true)]
    config: PathBuf,

    /// Path to the secrets file
    #[arg(long, default_value = "secrets.env", global = true)]
    secrets: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate pipeline configuration, secrets, and the upload manifest
    Check,
    /// Build the code archive locally and print its contents (no upload)
    Package,
    /// Count rows in a staged table
    Count {
        /// Table path, e.g. //data/events
        table: String,
    },
    /// Print the first rows of a staged table as JSON lines
    Show {
        /// Table path, e.g. //data/events
        table: String,
        /// Rows to print
        #[arg(short = 'n', long, default_value_t = 10)]
        limit: usize,
    },
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    logging::init(&cli.log_level);

    match cli.command {
        Commands::Check => commands::check::execute(&cli.config, &cli.secrets),
        Commands::Package => commands::package::execute(&cli.config),
        Commands::Count { table } => commands::count::execute(&cli.config, &cli.secrets, &table),
        Commands::Show { table, limit } => {
            commands::show::execute(&cli.config, &cli.secrets, &table, limit)
        }
    }
}
