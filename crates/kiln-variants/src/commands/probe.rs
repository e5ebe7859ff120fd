//! `kiln-variants probe` command implementation

use crate::CliError;
use colored::Colorize;
use kiln_runtime::estimator::human_bytes;
use kiln_runtime::{
    Admission, Candidate, Dispatcher, HardwareInventory, ModelRequirement, RuntimeConfig,
};
use serde::Serialize;

/// One planned candidate and how admission control judged it
#[derive(Debug, Serialize)]
pub struct CandidateReport {
    pub variant: String,
    pub rank: i32,
    pub location: String,
    pub pool: String,
    pub built: bool,
    pub admitted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CandidateReport {
    fn new(candidate: &Candidate, admission: &Admission) -> Self {
        let reason = match admission {
            Admission::Fits => None,
            Admission::Rejected(rejected) => Some(rejected.reason.clone()),
        };
        Self {
            variant: candidate.variant.id.clone(),
            rank: candidate.variant.rank,
            location: candidate.location.display().to_string(),
            pool: candidate.pool.to_string(),
            built: candidate.location.is_file(),
            admitted: admission.fits(),
            reason,
        }
    }
}

#[derive(Debug, Serialize)]
struct ProbeReport<'a> {
    inventory: &'a HardwareInventory,
    requirement: &'a ModelRequirement,
    candidates: &'a [CandidateReport],
}

/// Execute the `kiln-variants probe` command
pub fn run(
    config: &RuntimeConfig,
    size_class: &str,
    file_type: &str,
    json: bool,
) -> Result<(), CliError> {
    let inventory = HardwareInventory::detect(&config.probe);
    let dispatcher = Dispatcher::new(super::catalog(config)?, config);
    let requirement = ModelRequirement::new(size_class, file_type);
    let candidates = plan_report(&dispatcher, &inventory, &requirement)?;

    if json {
        let report = ProbeReport {
            inventory: &inventory,
            requirement: &requirement,
            candidates: &candidates,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    print_inventory(&inventory);
    println!();

    let needs = if requirement.is_unconstrained() {
        "no known memory floor".to_string()
    } else {
        format!("needs {}", human_bytes(requirement.required_bytes))
    };
    println!(
        "{} {} {} ({})",
        "Dispatch plan for".bold(),
        requirement.size_class,
        requirement.file_type,
        needs
    );
    for (position, candidate) in candidates.iter().enumerate() {
        let mark = if candidate.admitted {
            "✓".green()
        } else {
            "✗".red()
        };
        println!(
            "  {}. {} {:<10} rank {:>4}  {}",
            position + 1,
            mark,
            candidate.variant,
            candidate.rank,
            candidate.pool
        );
        if let Some(reason) = &candidate.reason {
            println!("       {}", reason.dimmed());
        }
        if !candidate.built {
            println!(
                "       {} artifact missing: {}",
                "!".yellow(),
                candidate.location
            );
        }
    }

    match candidates.iter().find(|c| c.admitted && c.built) {
        Some(first) => println!("\n{} {} would be tried first", "→".green(), first.variant.bold()),
        None if candidates.iter().any(|c| c.admitted) => println!(
            "\n{} No admitted variant has a built artifact; run `kiln-variants build`",
            "✗".red()
        ),
        None => println!("\n{} The model would be rejected on this host", "✗".red()),
    }

    Ok(())
}

/// Candidates for `requirement` on `inventory`, in dispatch order.
pub fn plan_report(
    dispatcher: &Dispatcher,
    inventory: &HardwareInventory,
    requirement: &ModelRequirement,
) -> Result<Vec<CandidateReport>, CliError> {
    Ok(dispatcher
        .admit(inventory, requirement)?
        .iter()
        .map(|(candidate, admission)| CandidateReport::new(candidate, admission))
        .collect())
}

fn print_inventory(inventory: &HardwareInventory) {
    let cpu = inventory.cpu();
    let memory = inventory.system_memory();

    println!("{}", "Host".bold());
    println!("  CPU:      {} ({} logical cores)", cpu.brand, cpu.logical_cores);
    if !cpu.features.is_empty() {
        println!("  Features: {}", cpu.features.join(", "));
    }
    println!(
        "  Memory:   {} total, {} available",
        human_bytes(memory.total),
        human_bytes(memory.available)
    );

    println!("{}", "Accelerators".bold());
    if inventory.accelerators().is_empty() {
        println!("  {}", "none".dimmed());
    }
    for accelerator in inventory.accelerators() {
        println!(
            "  {} {}: {} free of {} (driver {})",
            "✓".green(),
            accelerator.kind,
            human_bytes(accelerator.free_memory),
            human_bytes(accelerator.total_memory),
            accelerator.driver_version
        );
    }
    for failure in inventory.failures() {
        println!("  {} {}", "✗".red(), failure.to_string().dimmed());
    }
}
