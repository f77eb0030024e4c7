//! Status command handler

use anyhow::Result;
use colored::*;
use conveyor_core::domain::run::RunStatus;
use conveyor_runner::{Config, StateDir};
use std::process::ExitCode;

use super::run::print_summary;

/// Print the stored report of a run
pub fn show_status(config: &Config, build: u64, json: bool) -> Result<ExitCode> {
    let state = StateDir::new(&config.state_dir);
    let report = state.read_report(build)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(ExitCode::SUCCESS);
    }

    let run = &report.run;
    let status = match run.status {
        RunStatus::Succeeded => "succeeded".green(),
        RunStatus::Failed => "failed".red(),
        RunStatus::Running => "running".yellow(),
        RunStatus::Pending => "pending".dimmed(),
    };

    println!("{}", "Run Details:".bold());
    println!("  Pipeline:   {}", run.pipeline.bold());
    println!("  Build:      #{}", run.build_number);
    println!("  Run ID:     {}", run.id.to_string().cyan());
    println!("  Status:     {}", status);
    if let Some(actor) = &run.triggered_by {
        println!("  Started by: {}", actor);
    }
    println!(
        "  Created:    {}",
        run.created_at.format("%Y-%m-%d %H:%M:%S")
    );
    if let Some(completed) = run.completed_at {
        println!("  Completed:  {}", completed.format("%Y-%m-%d %H:%M:%S"));
    }
    println!("  Parameters:");
    for (name, value) in run.parameters.iter() {
        println!("    {} = {}", name.cyan(), value);
    }

    print_summary(&report);

    Ok(ExitCode::SUCCESS)
}
