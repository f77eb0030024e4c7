//! Approve command handler
//!
//! Writes the decision file a waiting run polls for.

use anyhow::Result;
use colored::*;
use conveyor_runner::service::{ApprovalDecision, FileApprovalService};
use conveyor_runner::{Config, StateDir};
use std::process::ExitCode;

/// Record an approval decision for a gated stage
pub fn record_decision(
    config: &Config,
    build: u64,
    stage: &str,
    reject: bool,
    reason: Option<String>,
    by: Option<String>,
) -> Result<ExitCode> {
    let state = StateDir::new(&config.state_dir);
    if !state.run_dir(build).is_dir() {
        anyhow::bail!(
            "Build #{} not found in {}",
            build,
            config.state_dir.display()
        );
    }

    let service = FileApprovalService::new(state, config.approval_poll_interval);

    match service.pending_request(build, stage) {
        Some(request) => println!(
            "  Deploy {} to {}",
            request.image.bold(),
            request.environment.to_string().cyan()
        ),
        None => println!(
            "{}",
            format!("No pending approval request for stage '{}' yet", stage).yellow()
        ),
    }

    let decision = if reject {
        ApprovalDecision::Rejected { by, reason }
    } else {
        ApprovalDecision::Approved { by }
    };
    let path = service.record_decision(build, stage, &decision)?;

    let verb = if reject { "rejected" } else { "approved" };
    println!(
        "{}",
        format!("✓ Build #{} stage '{}' {}", build, stage, verb)
            .green()
            .bold()
    );
    println!("  Decision: {}", path.display().to_string().dimmed());

    Ok(ExitCode::SUCCESS)
}
