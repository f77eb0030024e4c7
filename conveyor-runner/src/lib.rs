//! Conveyor runner
//!
//! Executes a parsed pipeline definition against a local workspace:
//! stage sequencing and guards, container steps through podman, scoped
//! credentials, the production approval gate, commit status reporting and
//! the end-of-run notification.

pub mod command;
pub mod config;
pub mod context;
pub mod executor;
pub mod podman;
pub mod service;
pub mod workspace;

#[cfg(test)]
pub(crate) mod testing;

pub use command::{CommandOutput, CommandRunner, CommandSpec, ProcessRunner};
pub use config::Config;
pub use context::RunContext;
pub use executor::PipelineExecutor;
pub use podman::ContainerTool;
pub use workspace::{StateDir, Workspace};
