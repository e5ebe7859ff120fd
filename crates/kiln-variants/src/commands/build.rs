//! `kiln-variants build` command implementation
//!
//! Every variant is an ordinary release build of `kiln-engine` with its own
//! feature set and compiler flags. Each gets a separate cargo target directory
//! so differently-flagged builds never share intermediate artifacts.

use crate::CliError;
use colored::Colorize;
use kiln_runtime::variant::artifact_file_name;
use kiln_runtime::{BackendVariant, RuntimeConfig};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

/// Package every variant is compiled from.
const ENGINE_PACKAGE: &str = "kiln-engine";

#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Variant ids to build; empty builds the whole matrix.
    pub variants: Vec<String>,
    /// Library directory artifacts are installed into.
    pub out: PathBuf,
    /// Root of the per-variant cargo target directories.
    pub target_root: PathBuf,
    pub dry_run: bool,
}

/// Execute the `kiln-variants build` command
pub fn run(config: &RuntimeConfig, options: &BuildOptions) -> Result<(), CliError> {
    let catalog = super::catalog(config)?;

    let selected: Vec<&BackendVariant> = if options.variants.is_empty() {
        catalog.variants().iter().collect()
    } else {
        options
            .variants
            .iter()
            .map(|id| catalog.require(id))
            .collect::<Result<_, _>>()?
    };

    let inherited = std::env::var("RUSTFLAGS").ok();
    for variant in selected {
        let mut cmd = cargo_command(variant, &options.target_root, inherited.as_deref());
        let destination = variant.location(&options.out);

        println!("{} Building variant {}...", "→".green(), variant.id.bold());
        if options.dry_run {
            println!("  {}", describe(&cmd));
            println!("  install: {}", destination.display());
            continue;
        }

        debug!(variant = %variant.id, command = %describe(&cmd), "running cargo");
        let status = cmd.status()?;
        if !status.success() {
            println!("{} Build of {} failed!", "✗".red(), variant.id);
            return Err(CliError::BuildFailed {
                variant: variant.id.clone(),
                status: status.to_string(),
            });
        }

        let built = built_artifact(variant, &options.target_root);
        install(&built, &destination)?;
        println!(
            "{} {} installed at {}",
            "✓".green(),
            variant.id,
            destination.display()
        );
    }

    Ok(())
}

/// The cargo invocation that compiles `variant`.
pub fn cargo_command(
    variant: &BackendVariant,
    target_root: &Path,
    inherited_rustflags: Option<&str>,
) -> Command {
    let cargo = std::env::var("CARGO").unwrap_or_else(|_| "cargo".to_string());
    let mut cmd = Command::new(cargo);
    cmd.args(["build", "--release", "--lib", "-p", ENGINE_PACKAGE]);
    if !variant.features.is_empty() {
        cmd.arg("--features").arg(variant.features.join(","));
    }
    cmd.env("CARGO_TARGET_DIR", target_dir(variant, target_root));
    if let Some(flags) = rustflags(variant, inherited_rustflags) {
        cmd.env("RUSTFLAGS", flags);
    }
    cmd
}

/// Compiler flags for `variant`, appended to any the caller already set.
pub fn rustflags(variant: &BackendVariant, inherited: Option<&str>) -> Option<String> {
    let own = variant.rustflags.join(" ");
    match inherited.map(str::trim).filter(|flags| !flags.is_empty()) {
        Some(inherited) if own.is_empty() => Some(inherited.to_string()),
        Some(inherited) => Some(format!("{inherited} {own}")),
        None if own.is_empty() => None,
        None => Some(own),
    }
}

pub fn target_dir(variant: &BackendVariant, target_root: &Path) -> PathBuf {
    target_root.join(&variant.id)
}

/// Where cargo leaves the artifact of `variant`.
pub fn built_artifact(variant: &BackendVariant, target_root: &Path) -> PathBuf {
    target_dir(variant, target_root)
        .join("release")
        .join(artifact_file_name())
}

fn install(built: &Path, destination: &Path) -> Result<(), CliError> {
    if !built.is_file() {
        return Err(CliError::MissingArtifact(built.to_path_buf()));
    }
    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(built, destination)?;
    Ok(())
}

fn describe(cmd: &Command) -> String {
    let mut parts: Vec<String> = cmd
        .get_envs()
        .filter_map(|(key, value)| {
            value.map(|v| format!("{}=\"{}\"", key.to_string_lossy(), v.to_string_lossy()))
        })
        .collect();
    parts.push(cmd.get_program().to_string_lossy().into_owned());
    parts.extend(cmd.get_args().map(|a| a.to_string_lossy().into_owned()));
    parts.join(" ")
}
