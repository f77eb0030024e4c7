//! Conveyor CLI
//!
//! Runs pipelines locally, records approval decisions for gated deploys and
//! shows stored run reports.

mod commands;

use anyhow::Result;
use clap::Parser;
use colored::*;
use commands::{Commands, handle_command};
use conveyor_runner::Config;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "conveyor")]
#[command(about = "Conveyor sequential-stage CI/CD pipeline runner", long_about = None)]
struct Cli {
    /// Directory holding build numbers, run reports and approvals
    #[arg(long, env = "CONVEYOR_STATE_DIR", global = true)]
    state_dir: Option<PathBuf>,

    /// Base directory for run workspaces
    #[arg(long, env = "CONVEYOR_WORKSPACE_BASE", global = true)]
    workspace_base: Option<PathBuf>,

    /// Container CLI used for build, push and run steps
    #[arg(long, env = "CONVEYOR_CONTAINER_TOOL", global = true)]
    container_tool: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conveyor=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let result = match load_config(&cli) {
        Ok(config) => handle_command(cli.command, &config).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

/// Loads configuration from the environment, then applies command-line overrides
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::from_env()?;

    if let Some(state_dir) = &cli.state_dir {
        config.state_dir = state_dir.clone();
    }
    if let Some(workspace_base) = &cli.workspace_base {
        config.workspace_base = workspace_base.clone();
    }
    if let Some(container_tool) = &cli.container_tool {
        config.container_tool = container_tool.clone();
    }

    config.validate()?;
    info!(
        "Loaded configuration: state_dir={}, workspace_base={}",
        config.state_dir.display(),
        config.workspace_base.display()
    );

    Ok(config)
}
