//! Pipeline run domain types
//!
//! A [`PipelineRun`] is created at trigger time and mutated only by the stage
//! executor. Once failed, a run stays failed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::parameter::ResolvedParameters;

/// Overall run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// Per-stage state machine: `Pending -> Running -> {Succeeded, Failed, Skipped}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

/// One execution of a pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub build_number: u64,
    pub pipeline: String,
    pub parameters: ResolvedParameters,
    pub triggered_by: Option<String>,
    pub status: RunStatus,
    pub current_stage: Option<String>,
    /// Message of the first fatal failure
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    pub fn new(
        build_number: u64,
        pipeline: impl Into<String>,
        parameters: ResolvedParameters,
        triggered_by: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            build_number,
            pipeline: pipeline.into(),
            parameters,
            triggered_by,
            status: RunStatus::Pending,
            current_stage: None,
            failure: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn start(&mut self) {
        if self.status == RunStatus::Pending {
            self.status = RunStatus::Running;
            self.started_at = Some(Utc::now());
        }
    }

    pub fn enter_stage(&mut self, stage: &str) {
        self.current_stage = Some(stage.to_string());
    }

    /// Marks the run failed; only the first failure message is kept
    pub fn fail(&mut self, reason: impl Into<String>) {
        if self.failure.is_none() {
            self.failure = Some(reason.into());
        }
        self.status = RunStatus::Failed;
    }

    pub fn is_failed(&self) -> bool {
        self.status == RunStatus::Failed
    }

    /// Completes the run; a running run succeeds, a failed run stays failed
    pub fn finish(&mut self) {
        if self.status == RunStatus::Running || self.status == RunStatus::Pending {
            self.status = RunStatus::Succeeded;
        }
        self.current_stage = None;
        self.completed_at = Some(Utc::now());
    }
}

/// Outcome of one stage within a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageReport {
    pub name: String,
    pub state: StageState,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Exit code of the command that failed the stage
    #[serde(default)]
    pub exit_code: Option<i32>,
    pub skip_reason: Option<String>,
    #[serde(default)]
    pub hook_failures: Vec<String>,
}

impl StageReport {
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: StageState::Pending,
            started_at: None,
            completed_at: None,
            error: None,
            exit_code: None,
            skip_reason: None,
            hook_failures: Vec::new(),
        }
    }

    pub fn start(&mut self) {
        self.state = StageState::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn succeed(&mut self) {
        self.state = StageState::Succeeded;
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.state = StageState::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(Utc::now());
    }

    pub fn skip(&mut self, reason: impl Into<String>) {
        self.state = StageState::Skipped;
        self.skip_reason = Some(reason.into());
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

/// Everything recorded about a finished run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run: PipelineRun,
    pub stages: Vec<StageReport>,
    #[serde(default)]
    pub hook_failures: Vec<String>,
    /// Error from the end-of-run notification, if it could not be sent
    pub notification_error: Option<String>,
}

impl RunReport {
    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Names of stages whose body ran, in execution order
    pub fn executed_stages(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|s| matches!(s.state, StageState::Succeeded | StageState::Failed))
            .map(|s| s.name.as_str())
            .collect()
    }

    pub fn succeeded(&self) -> bool {
        self.run.status == RunStatus::Succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::parameter::{ParameterDefinition, resolve_parameters};
    use std::collections::HashMap;

    fn run() -> PipelineRun {
        let params =
            resolve_parameters(&ParameterDefinition::standard_set(), &HashMap::new()).unwrap();
        PipelineRun::new(7, "app", params, Some("alice".to_string()))
    }

    #[test]
    fn test_run_lifecycle_success() {
        let mut run = run();
        assert_eq!(run.status, RunStatus::Pending);
        run.start();
        assert_eq!(run.status, RunStatus::Running);
        run.enter_stage("Build");
        assert_eq!(run.current_stage.as_deref(), Some("Build"));
        run.finish();
        assert_eq!(run.status, RunStatus::Succeeded);
        assert!(run.completed_at.is_some());
        assert!(run.current_stage.is_none());
    }

    #[test]
    fn test_failure_is_permanent_and_first_wins() {
        let mut run = run();
        run.start();
        run.fail("Build failed");
        run.fail("Deploy failed");
        run.finish();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.failure.as_deref(), Some("Build failed"));
    }

    #[test]
    fn test_stage_report_transitions() {
        let mut report = StageReport::pending("Test");
        report.start();
        assert_eq!(report.state, StageState::Running);
        report.fail("exit 1");
        assert_eq!(report.state, StageState::Failed);
        assert!(report.duration_ms().is_some());

        let mut skipped = StageReport::pending("Deploy");
        skipped.skip("DEPLOY is false");
        assert_eq!(skipped.state, StageState::Skipped);
        assert!(skipped.duration_ms().is_none());
    }
}
