//! On-disk layout of runs
//!
//! ```text
//! <state>/next_build
//! <state>/runs/<build>/report.json
//! <state>/runs/<build>/run.log
//! <state>/runs/<build>/artifacts/...
//! <state>/runs/<build>/approvals/<stage>.json
//! <workspace_base>/<pipeline>-<build>/
//! ```

use anyhow::{Context, Result};
use conveyor_core::domain::log::LogEntry;
use conveyor_core::domain::run::RunReport;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

const COUNTER_FILE: &str = "next_build";
const REPORT_FILE: &str = "report.json";
const RUN_LOG_FILE: &str = "run.log";

/// Persistent state directory shared by all runs
#[derive(Debug, Clone)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, build_number: u64) -> PathBuf {
        self.root.join("runs").join(build_number.to_string())
    }

    pub fn artifacts_dir(&self, build_number: u64) -> PathBuf {
        self.run_dir(build_number).join("artifacts")
    }

    pub fn approvals_dir(&self, build_number: u64) -> PathBuf {
        self.run_dir(build_number).join("approvals")
    }

    /// Allocates the next build number and creates its run directory
    ///
    /// The run directory is created with `create_dir`, so two runners sharing
    /// a state directory can never claim the same number.
    pub fn claim_build_number(&self) -> Result<u64> {
        let runs = self.root.join("runs");
        std::fs::create_dir_all(&runs)
            .with_context(|| format!("Failed to create {}", runs.display()))?;

        let counter = self.root.join(COUNTER_FILE);
        let mut candidate = match std::fs::read_to_string(&counter) {
            Ok(contents) => contents
                .trim()
                .parse::<u64>()
                .with_context(|| format!("Corrupt build counter in {}", counter.display()))?,
            Err(e) if e.kind() == ErrorKind::NotFound => 1,
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", counter.display()));
            }
        };

        loop {
            match std::fs::create_dir(self.run_dir(candidate)) {
                Ok(()) => break,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => candidate += 1,
                Err(e) => return Err(e).context("Failed to create run directory"),
            }
        }

        write_atomic(&counter, (candidate + 1).to_string().as_bytes())?;
        debug!("Claimed build number {}", candidate);

        Ok(candidate)
    }

    pub fn write_report(&self, report: &RunReport) -> Result<PathBuf> {
        let path = self.run_dir(report.run.build_number).join(REPORT_FILE);
        let json = serde_json::to_vec_pretty(report).context("Failed to serialize run report")?;
        write_atomic(&path, &json)?;
        Ok(path)
    }

    pub fn read_report(&self, build_number: u64) -> Result<RunReport> {
        let path = self.run_dir(build_number).join(REPORT_FILE);
        let json = std::fs::read(&path)
            .with_context(|| format!("No report for build #{} at {}", build_number, path.display()))?;
        serde_json::from_slice(&json)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn write_run_log(&self, build_number: u64, entries: &[LogEntry]) -> Result<PathBuf> {
        let path = self.run_dir(build_number).join(RUN_LOG_FILE);
        let mut contents = String::new();
        for entry in entries {
            contents.push_str(&entry.to_string());
            contents.push('\n');
        }
        write_atomic(&path, contents.as_bytes())?;
        Ok(path)
    }
}

/// Writes `contents` to a sibling temp file and renames it over `path`
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let tmp = path.with_extension("tmp");
    let mut file = std::fs::File::create(&tmp)
        .with_context(|| format!("Failed to create {}", tmp.display()))?;
    file.write_all(contents)?;
    file.sync_all()?;
    std::fs::rename(&tmp, path).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Working directory of one run
#[derive(Debug, Clone)]
pub struct Workspace {
    path: PathBuf,
}

impl Workspace {
    /// Creates `<base>/<pipeline>-<build>`
    pub fn create(base: &Path, pipeline: &str, build_number: u64) -> Result<Self> {
        let name: String = pipeline
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let path = base.join(format!("{}-{}", name, build_number));
        std::fs::create_dir_all(&path)
            .with_context(|| format!("Failed to create workspace {}", path.display()))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
