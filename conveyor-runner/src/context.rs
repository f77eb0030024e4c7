//! Execution context for a pipeline run
//!
//! Contains all per-run state the executor needs:
//! - Log buffer for the run log
//! - The run environment every step is templated against
//! - Workspace and artifact directories

use conveyor_core::domain::log::{LogEntry, LogLevel};
use conveyor_core::domain::parameter::ResolvedParameters;
use conveyor_core::domain::pipeline::PipelineDefinition;
use conveyor_core::domain::run::PipelineRun;
use conveyor_core::{PipelineError, Result, template};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Execution context shared across one pipeline run
pub struct RunContext {
    /// Log buffer with entries
    log_buffer: Mutex<Vec<LogEntry>>,

    /// Variables exported to every command
    env: BTreeMap<String, String>,

    workspace: PathBuf,

    artifacts_dir: PathBuf,
}

impl RunContext {
    /// Creates a new execution context
    ///
    /// The run environment is built from, in order:
    /// - resolved parameters
    /// - `BUILD_NUMBER`, `RUN_ID`, `WORKSPACE`, `PIPELINE_NAME`
    /// - `extra` (e.g. `GIT_URL`, `GIT_COMMIT`)
    /// - the pipeline's `environment` table, templated against the above
    ///
    /// # Errors
    /// - `InvalidDefinition` if a pipeline variable shadows one of the above
    /// - `UndefinedVariable` if a pipeline variable references an unknown name
    pub fn new(
        definition: &PipelineDefinition,
        run: &PipelineRun,
        workspace: PathBuf,
        artifacts_dir: PathBuf,
        extra: BTreeMap<String, String>,
    ) -> Result<Self> {
        let mut env = run.parameters.to_env();
        env.insert("BUILD_NUMBER".to_string(), run.build_number.to_string());
        env.insert("RUN_ID".to_string(), run.id.to_string());
        env.insert(
            "WORKSPACE".to_string(),
            workspace.to_string_lossy().to_string(),
        );
        env.insert("PIPELINE_NAME".to_string(), run.pipeline.clone());
        for (key, value) in extra {
            env.entry(key).or_insert(value);
        }

        let mut pipeline_env = BTreeMap::new();
        for (key, raw) in &definition.environment {
            if env.contains_key(key) {
                return Err(PipelineError::InvalidDefinition(format!(
                    "environment variable '{}' shadows a run variable",
                    key
                )));
            }
            pipeline_env.insert(key.clone(), template::expand(raw, &env)?);
        }
        env.extend(pipeline_env);

        Ok(Self {
            log_buffer: Mutex::new(Vec::new()),
            env,
            workspace,
            artifacts_dir,
        })
    }

    /// Checks the pipeline `environment` table before a build is claimed
    ///
    /// Fails exactly when [`RunContext::new`] would for the same inputs; the
    /// checks depend on variable names, not on the build number or paths.
    pub fn check_environment(
        definition: &PipelineDefinition,
        parameters: &ResolvedParameters,
        extra: &BTreeMap<String, String>,
    ) -> Result<()> {
        let run = PipelineRun::new(0, &definition.name, parameters.clone(), None);
        Self::new(
            definition,
            &run,
            PathBuf::new(),
            PathBuf::new(),
            extra.clone(),
        )
        .map(|_| ())
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn artifacts_dir(&self) -> &Path {
        &self.artifacts_dir
    }

    /// Expands `$NAME` / `${NAME}` against the run environment
    pub fn expand(&self, input: &str) -> Result<String> {
        template::expand(input, &self.env)
    }

    pub fn expand_all(&self, inputs: &[String]) -> Result<Vec<String>> {
        template::expand_all(inputs, &self.env)
    }

    /// Resolves a templated path relative to the workspace
    ///
    /// Absolute paths and `..` components are rejected with `InvalidDefinition`.
    pub fn workspace_path(&self, input: &str) -> Result<PathBuf> {
        let relative = self.expand(input)?;
        ensure_relative(&relative)?;
        Ok(self.workspace.join(relative))
    }

    /// Adds a log entry to the buffer
    pub fn add_log(&self, level: LogLevel, message: String) {
        let mut buffer = self.log_buffer.lock().unwrap_or_else(PoisonError::into_inner);
        buffer.push(LogEntry {
            timestamp: chrono::Utc::now(),
            level,
            message,
        });
    }

    pub fn log_debug(&self, message: String) {
        self.add_log(LogLevel::Debug, message);
    }

    pub fn log_info(&self, message: String) {
        self.add_log(LogLevel::Info, message);
    }

    pub fn log_warning(&self, message: String) {
        self.add_log(LogLevel::Warning, message);
    }

    pub fn log_error(&self, message: String) {
        self.add_log(LogLevel::Error, message);
    }

    /// Drains all log entries from the buffer
    pub fn drain_logs(&self) -> Vec<LogEntry> {
        let mut buffer = self.log_buffer.lock().unwrap_or_else(PoisonError::into_inner);
        buffer.drain(..).collect()
    }
}

/// Fails unless `path` is relative and never climbs out of its base
pub(crate) fn ensure_relative(path: &str) -> Result<()> {
    let escapes = Path::new(path).components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if escapes {
        return Err(PipelineError::InvalidDefinition(format!(
            "path '{}' must stay inside the workspace",
            path
        )));
    }
    Ok(())
}
