//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod approve;
mod params;
mod run;
mod status;
mod validate;

use anyhow::{Context, Result};
use clap::Subcommand;
use conveyor_core::domain::pipeline::PipelineDefinition;
use conveyor_runner::Config;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run a pipeline
    Run {
        /// Lua pipeline definition (defaults to the built-in pipeline)
        #[arg(long)]
        pipeline: Option<PathBuf>,

        /// Parameters as KEY=value pairs (e.g., -p ENVIRONMENT=production)
        #[arg(short, long, value_parser = parse_key_val)]
        param: Vec<(String, String)>,

        /// Who triggered the run
        #[arg(long)]
        actor: Option<String>,
    },
    /// Parse a pipeline definition and print its stages and inputs
    Validate {
        #[arg(long)]
        pipeline: Option<PathBuf>,
    },
    /// Print the parameters a run would resolve to
    Params {
        #[arg(long)]
        pipeline: Option<PathBuf>,

        #[arg(short, long, value_parser = parse_key_val)]
        param: Vec<(String, String)>,
    },
    /// Approve (or reject) a deploy waiting at the approval gate
    Approve {
        /// Build number of the waiting run
        build: u64,

        /// Stage waiting for approval
        #[arg(long, default_value = "Deploy")]
        stage: String,

        /// Reject instead of approving
        #[arg(long)]
        reject: bool,

        /// Reason recorded with a rejection
        #[arg(long, requires = "reject")]
        reason: Option<String>,

        /// Approver name
        #[arg(long, env = "CONVEYOR_ACTOR")]
        by: Option<String>,
    },
    /// Show the stored report of a run
    Status {
        build: u64,

        /// Print the raw JSON report
        #[arg(long)]
        json: bool,
    },
}

/// Handle a CLI command
///
/// Returns the process exit code; a failed run is `ExitCode::FAILURE` even
/// though the command itself worked.
pub async fn handle_command(command: Commands, config: &Config) -> Result<ExitCode> {
    match command {
        Commands::Run {
            pipeline,
            param,
            actor,
        } => run::run_pipeline(config, pipeline.as_deref(), param, actor).await,
        Commands::Validate { pipeline } => validate::validate_pipeline(pipeline.as_deref()),
        Commands::Params { pipeline, param } => params::print_params(pipeline.as_deref(), param),
        Commands::Approve {
            build,
            stage,
            reject,
            reason,
            by,
        } => approve::record_decision(config, build, &stage, reject, reason, by),
        Commands::Status { build, json } => status::show_status(config, build, json),
    }
}

/// Parse a single key=value pair
fn parse_key_val(s: &str) -> Result<(String, String)> {
    let pos = s
        .find('=')
        .ok_or_else(|| anyhow::anyhow!("invalid KEY=value: no `=` found in `{}`", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

/// Loads a pipeline file, or the built-in pipeline when none is given
fn load_definition(path: Option<&Path>) -> Result<PipelineDefinition> {
    match path {
        Some(path) => {
            let source = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;
            conveyor_lua::parse_pipeline(&source)
                .with_context(|| format!("Failed to parse pipeline {}", path.display()))
        }
        None => conveyor_lua::parse_pipeline(conveyor_lua::BUILTIN_PIPELINE)
            .context("Failed to parse the built-in pipeline"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_val() {
        assert_eq!(
            parse_key_val("ENVIRONMENT=production").unwrap(),
            ("ENVIRONMENT".to_string(), "production".to_string())
        );
        assert_eq!(
            parse_key_val("NOTE=a=b").unwrap(),
            ("NOTE".to_string(), "a=b".to_string())
        );
        assert!(parse_key_val("DEPLOY").is_err());
    }

    #[test]
    fn test_load_builtin_definition() {
        let definition = load_definition(None).unwrap();
        assert_eq!(definition.stages.len(), 5);
    }

    #[test]
    fn test_load_missing_file() {
        let err = load_definition(Some(Path::new("/nonexistent/pipeline.lua"))).unwrap_err();
        assert!(err.to_string().contains("Failed to read pipeline file"));
    }
}
