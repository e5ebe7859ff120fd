//! CLI command definitions using clap

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Kiln variant matrix tool
#[derive(Parser)]
#[command(name = "kiln-variants")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Runtime configuration file path
    #[arg(short = 'c', long, global = true, env = "KILN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Variant manifest, overriding the configured or built-in one
    #[arg(short = 'm', long, global = true)]
    pub manifest: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Print the variant matrix
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Compile engine artifacts for the variant matrix
    Build {
        /// Variants to build (all when empty)
        variants: Vec<String>,

        /// Library directory to install artifacts into (defaults to variants.library_dir)
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Directory holding one cargo target directory per variant
        #[arg(long, default_value = "target/variants")]
        target_root: PathBuf,

        /// Print the cargo invocations without running them
        #[arg(long)]
        dry_run: bool,
    },

    /// Probe this host and show the dispatch plan for a model
    Probe {
        /// Model size class, e.g. 7B
        #[arg(short, long, default_value = "7B")]
        size_class: String,

        /// Model file type, e.g. Q4_0 or F16
        #[arg(short, long, default_value = "Q4_0")]
        file_type: String,

        /// Print JSON instead of a report
        #[arg(long)]
        json: bool,
    },
}
