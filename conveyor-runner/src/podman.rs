//! Container CLI invocations
//!
//! Builds the argument vectors for the container tool (`podman` by default,
//! `docker` works the same way):
//! - Building and tagging images
//! - Registry login/push/logout with the password on stdin
//! - Running a program inside an image with the workspace mounted

use conveyor_core::domain::credential::Secret;
use conveyor_core::{PipelineError, Result};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

use crate::command::{CommandRunner, CommandSpec};

/// Mount point of the run workspace inside containers
pub const CONTAINER_WORKSPACE: &str = "/workspace";

/// Container tool wrapper
#[derive(Debug, Clone)]
pub struct ContainerTool {
    binary: String,
}

impl ContainerTool {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Checks that the container tool is installed and working
    ///
    /// # Returns
    /// The tool's version string
    pub async fn check_available(&self, runner: &dyn CommandRunner) -> Result<String> {
        let output = runner
            .run(&CommandSpec::new(&self.binary, ["--version"]))
            .await?;

        if !output.success() {
            return Err(PipelineError::CommandFailed {
                command: format!("{} --version", self.binary),
                exit_code: output.exit_code,
            });
        }

        let version = output.stdout.trim().to_string();
        info!("{} is available: {}", self.binary, version);
        Ok(version)
    }

    /// `build -t <ref>... [-f <file>] <context>`
    pub fn build(&self, references: &[String], context: &Path, file: Option<&Path>) -> CommandSpec {
        let mut args = vec!["build".to_string()];
        for reference in references {
            args.push("-t".to_string());
            args.push(reference.clone());
        }
        if let Some(file) = file {
            args.push("-f".to_string());
            args.push(file.to_string_lossy().to_string());
        }
        args.push(context.to_string_lossy().to_string());

        CommandSpec::new(&self.binary, args)
    }

    /// `login --username <user> --password-stdin <registry>`
    pub fn login(&self, registry: &str, username: &str, password: &Secret) -> CommandSpec {
        CommandSpec::new(
            &self.binary,
            ["login", "--username", username, "--password-stdin", registry],
        )
        .stdin(password.clone())
    }

    pub fn push(&self, reference: &str) -> CommandSpec {
        CommandSpec::new(&self.binary, ["push", reference])
    }

    pub fn logout(&self, registry: &str) -> CommandSpec {
        CommandSpec::new(&self.binary, ["logout", registry])
    }

    /// `run --rm -v <workspace>:/workspace -w /workspace --env NAME... <image> <program> <args>`
    ///
    /// Variables are forwarded by name so their values never appear in argv;
    /// the returned spec carries the values in its environment.
    pub fn run(
        &self,
        image: &str,
        workspace: &Path,
        env: &BTreeMap<String, String>,
        program: &str,
        program_args: &[String],
    ) -> CommandSpec {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "-v".to_string(),
            format!("{}:{}", workspace.display(), CONTAINER_WORKSPACE),
            "-w".to_string(),
            CONTAINER_WORKSPACE.to_string(),
        ];
        for name in env.keys() {
            args.push("--env".to_string());
            args.push(name.clone());
        }
        args.push(image.to_string());
        args.push(program.to_string());
        args.extend(program_args.iter().cloned());

        CommandSpec::new(&self.binary, args).envs(env)
    }

    /// Registry host of an image reference, if it names one
    ///
    /// `registry.example.com/app` -> `registry.example.com`, `library/alpine` -> `None`
    pub fn registry_of(image: &str) -> Option<String> {
        let (first, rest) = image.split_once('/')?;
        if rest.is_empty() {
            return None;
        }
        if first.contains('.') || first.contains(':') || first == "localhost" {
            Some(first.to_string())
        } else {
            None
        }
    }
}

impl Default for ContainerTool {
    fn default() -> Self {
        Self::new("podman")
    }
}
