//! Validate command handler

use anyhow::Result;
use colored::*;
use conveyor_core::domain::parameter::ParameterKind;
use conveyor_core::domain::pipeline::{Guard, PipelineDefinition};
use std::path::Path;
use std::process::ExitCode;

use super::load_definition;

/// Parse a pipeline and print its inputs and stages
pub fn validate_pipeline(pipeline: Option<&Path>) -> Result<ExitCode> {
    let definition = load_definition(pipeline)?;

    println!("{}", "✓ Pipeline is valid".green().bold());
    print_definition(&definition);

    Ok(ExitCode::SUCCESS)
}

fn print_definition(definition: &PipelineDefinition) {
    println!("  Name:   {}", definition.name.bold());
    if let Some(description) = &definition.description {
        println!("  Description: {}", description.dimmed());
    }

    if !definition.inputs.is_empty() {
        println!("  Inputs:");
        for input in &definition.inputs {
            let kind = match &input.kind {
                ParameterKind::String => "string".to_string(),
                ParameterKind::Boolean => "boolean".to_string(),
                ParameterKind::Choice { options } => format!("choice [{}]", options.join(", ")),
            };
            let default = input
                .default
                .as_ref()
                .map(|value| format!(" = {}", value))
                .unwrap_or_else(|| " (required)".to_string());
            println!(
                "    - {}: {}{} {}",
                input.name.cyan(),
                kind.dimmed(),
                default,
                input.description.as_deref().unwrap_or_default().dimmed()
            );
        }
    }

    println!("  Stages:");
    for (idx, stage) in definition.stages.iter().enumerate() {
        let guard = match &stage.guard {
            Guard::Always => String::new(),
            guard => format!(" when {}", guard),
        };
        println!(
            "    {}. {}{} ({} step(s))",
            idx + 1,
            stage.name.bold(),
            guard.dimmed(),
            stage.steps.len()
        );
    }

    let hooks = definition.post.success.len()
        + definition.post.failure.len()
        + definition.post.always.len();
    if hooks > 0 {
        println!("  Post:   {} hook step(s)", hooks);
    }
}
