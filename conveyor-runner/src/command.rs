//! External command execution
//!
//! Every step ends up as a [`CommandSpec`]: a program, an argument vector and
//! an environment. Nothing is passed through a shell.

use async_trait::async_trait;
use conveyor_core::domain::credential::Secret;
use conveyor_core::{PipelineError, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// A fully templated command invocation
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    /// Credential variables, only set for the lifetime of one scoped command
    pub secret_env: BTreeMap<String, Secret>,
    /// Data written to the child's stdin (registry passwords, mail messages)
    pub stdin: Option<Secret>,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn envs(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn secret_env(mut self, env: BTreeMap<String, Secret>) -> Self {
        self.secret_env.extend(env);
        self
    }

    pub fn stdin(mut self, input: Secret) -> Self {
        self.stdin = Some(input);
        self
    }

    pub fn timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.timeout = timeout.into();
        self
    }

    /// `program arg1 arg2`, for logs and error messages
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs external commands
///
/// A non-zero exit is reported through [`CommandOutput::exit_code`], not as an
/// error; errors mean the command could not be run or did not finish.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;
}

/// Variables a child process inherits from the runner's own environment
pub const INHERITED_ENV: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LANG",
    "LC_ALL",
    "TMPDIR",
    "XDG_RUNTIME_DIR",
];

/// Runs commands as local child processes
///
/// Children start from an empty environment: only the variables named in
/// [`INHERITED_ENV`] are passed through, followed by the spec's `env` and
/// `secret_env`. Credentials the runner itself was started with never reach
/// a child outside a credential scope.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    inherited: Vec<String>,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::with_inherited(INHERITED_ENV.iter().copied())
    }

    pub fn with_inherited<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            inherited: names.into_iter().map(Into::into).collect(),
        }
    }

    fn inherited_env(&self) -> Vec<(String, std::ffi::OsString)> {
        self.inherited
            .iter()
            .filter_map(|name| std::env::var_os(name).map(|value| (name.clone(), value)))
            .collect()
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        debug!("Spawning {} ({} args)", spec.program, spec.args.len());

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .env_clear()
            .envs(self.inherited_env())
            .envs(&spec.env)
            .envs(
                spec.secret_env
                    .iter()
                    .map(|(key, secret)| (key, secret.expose())),
            )
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        let started = Instant::now();
        let mut child = command.spawn().map_err(|source| PipelineError::CommandSpawn {
            program: spec.program.clone(),
            source,
        })?;

        if let (Some(input), Some(mut stdin)) = (&spec.stdin, child.stdin.take()) {
            stdin.write_all(input.expose().as_bytes()).await?;
            stdin.shutdown().await?;
        }

        // Dropping the wait future on timeout drops the child, which kills it
        let output = match spec.timeout {
            Some(timeout) => tokio::time::timeout(timeout, child.wait_with_output())
                .await
                .map_err(|_| PipelineError::CommandTimedOut {
                    command: spec.display(),
                    timeout,
                })??,
            None => child.wait_with_output().await?,
        };

        let result = CommandOutput {
            // Killed by a signal
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration: started.elapsed(),
        };

        debug!(
            "{} exited with {} after {:?}",
            spec.program, result.exit_code, result.duration
        );

        Ok(result)
    }
}
