//! Params command handler

use anyhow::{Context, Result};
use colored::*;
use conveyor_core::domain::parameter::resolve_parameters;
use std::collections::HashMap;
use std::path::Path;
use std::process::ExitCode;

use super::load_definition;

/// Resolve parameters against a pipeline's inputs and print them
pub fn print_params(pipeline: Option<&Path>, params: Vec<(String, String)>) -> Result<ExitCode> {
    let definition = load_definition(pipeline)?;
    let raw: HashMap<String, String> = params.into_iter().collect();

    let resolved =
        resolve_parameters(&definition.inputs, &raw).context("Failed to resolve parameters")?;

    println!("{}", format!("Parameters for {}:", definition.name).bold());
    for (name, value) in resolved.iter() {
        let marker = if raw.contains_key(name) { "" } else { " (default)" };
        println!("  {} = {}{}", name.cyan(), value, marker.dimmed());
    }

    Ok(ExitCode::SUCCESS)
}
