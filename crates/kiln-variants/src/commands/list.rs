//! `kiln-variants list` command implementation

use crate::CliError;
use colored::Colorize;
use kiln_runtime::{AcceleratorKind, RuntimeConfig};

/// Execute the `kiln-variants list` command
pub fn run(config: &RuntimeConfig, json: bool) -> Result<(), CliError> {
    let catalog = super::catalog(config)?;
    let library_dir = &config.variants.library_dir;

    if json {
        let rows: Vec<serde_json::Value> = catalog
            .variants()
            .iter()
            .map(|variant| {
                let location = variant.location(library_dir);
                serde_json::json!({
                    "variant": variant,
                    "location": location,
                    "built": location.is_file(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!(
        "{:<12} {:>5}  {:<8} {:<22} {}",
        "VARIANT".bold(),
        "RANK".bold(),
        "REQUIRES".bold(),
        "CPU FEATURES".bold(),
        "ARTIFACT".bold()
    );
    for variant in catalog.variants() {
        let location = variant.location(library_dir);
        let requires = match variant.requires {
            AcceleratorKind::None => "-".to_string(),
            kind => kind.to_string(),
        };
        let features = if variant.cpu_features.is_empty() {
            "-".to_string()
        } else {
            variant.cpu_features.join(",")
        };
        let status = if location.is_file() {
            "✓".green()
        } else {
            "✗".red()
        };
        let id = if variant.baseline {
            format!("{} *", variant.id)
        } else {
            variant.id.clone()
        };
        println!(
            "{:<12} {:>5}  {:<8} {:<22} {} {}",
            id,
            variant.rank,
            requires,
            features,
            status,
            location.display()
        );
    }
    println!();
    println!("{} baseline", "*".dimmed());

    Ok(())
}
