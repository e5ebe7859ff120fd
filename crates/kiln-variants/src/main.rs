//! kiln-variants - build the engine variant matrix and inspect backend selection

mod cli;
mod commands;
mod error;

use clap::Parser;
use cli::{Cli, Commands};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

pub use error::CliError;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging; RUST_LOG wins over the verbosity flag
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run_command(cli) {
        eprintln!("{} {}", "✗".red(), e);
        std::process::exit(1);
    }
    Ok(())
}

fn run_command(cli: Cli) -> Result<(), CliError> {
    let config = commands::load_config(cli.config.as_deref(), cli.manifest.as_deref())?;

    match cli.command {
        Commands::List { json } => commands::list::run(&config, json),

        Commands::Build {
            variants,
            out,
            target_root,
            dry_run,
        } => {
            let options = commands::build::BuildOptions {
                variants,
                out: out.unwrap_or_else(|| config.variants.library_dir.clone()),
                target_root,
                dry_run,
            };
            commands::build::run(&config, &options)
        }

        Commands::Probe {
            size_class,
            file_type,
            json,
        } => commands::probe::run(&config, &size_class, &file_type, json),
    }
}
