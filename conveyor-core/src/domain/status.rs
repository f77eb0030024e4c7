//! Status events emitted on stage transitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// State carried by a status event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusState {
    Running,
    Success,
    Failed,
}

impl fmt::Display for StatusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StatusState::Running => "running",
            StatusState::Success => "success",
            StatusState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// What a status event is about
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "name", rename_all = "lowercase")]
pub enum StatusTarget {
    Stage(String),
    Pipeline,
}

/// A stage or pipeline transition, delivered best-effort to status sinks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub run_id: Uuid,
    pub build_number: u64,
    pub target: StatusTarget,
    pub state: StatusState,
    pub description: String,
    pub timestamp: DateTime<Utc>,
}

impl StatusEvent {
    pub fn stage(
        run_id: Uuid,
        build_number: u64,
        stage: impl Into<String>,
        state: StatusState,
    ) -> Self {
        let stage = stage.into();
        let description = match state {
            StatusState::Running => format!("{} is running", stage),
            StatusState::Success => format!("{} succeeded", stage),
            StatusState::Failed => format!("{} failed", stage),
        };
        Self {
            run_id,
            build_number,
            target: StatusTarget::Stage(stage),
            state,
            description,
            timestamp: Utc::now(),
        }
    }

    pub fn pipeline(run_id: Uuid, build_number: u64, state: StatusState) -> Self {
        let description = match state {
            StatusState::Running => format!("Build #{} is running", build_number),
            StatusState::Success => format!("Build #{} succeeded", build_number),
            StatusState::Failed => format!("Build #{} failed", build_number),
        };
        Self {
            run_id,
            build_number,
            target: StatusTarget::Pipeline,
            state,
            description,
            timestamp: Utc::now(),
        }
    }

    /// Stage name, or `None` for the pipeline-level event
    pub fn stage_name(&self) -> Option<&str> {
        match &self.target {
            StatusTarget::Stage(name) => Some(name),
            StatusTarget::Pipeline => None,
        }
    }
}
