//! Approval gate
//!
//! Gated deploys suspend the run's own task until an external actor decides
//! or the gate's timeout elapses. The gate owns the timeout; approval
//! services only wait for a decision.

use async_trait::async_trait;
use conveyor_core::domain::deploy::DeployTarget;
use conveyor_core::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::workspace::{StateDir, write_atomic};

/// What is waiting for approval
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub run_id: Uuid,
    pub build_number: u64,
    pub stage: String,
    pub environment: DeployTarget,
    pub image: String,
}

/// Decision recorded by an approver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "lowercase")]
pub enum ApprovalDecision {
    Approved {
        by: Option<String>,
    },
    Rejected {
        by: Option<String>,
        reason: Option<String>,
    },
}

/// Result of waiting at the gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved { by: Option<String> },
    Rejected { by: Option<String>, reason: Option<String> },
    TimedOut,
}

impl From<ApprovalDecision> for ApprovalOutcome {
    fn from(decision: ApprovalDecision) -> Self {
        match decision {
            ApprovalDecision::Approved { by } => ApprovalOutcome::Approved { by },
            ApprovalDecision::Rejected { by, reason } => ApprovalOutcome::Rejected { by, reason },
        }
    }
}

/// Source of approval decisions
#[async_trait]
pub trait ApprovalService: Send + Sync {
    /// Announces that a decision is needed
    async fn request(&self, _request: &ApprovalRequest) -> Result<()> {
        Ok(())
    }

    /// Waits until a decision exists; may wait forever
    async fn wait_for_decision(&self, request: &ApprovalRequest) -> Result<ApprovalDecision>;
}

/// Bounded wait for an approval decision
#[derive(Clone)]
pub struct ApprovalGate {
    service: Arc<dyn ApprovalService>,
    timeout: Duration,
}

impl ApprovalGate {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60 * 60);

    pub fn new(service: Arc<dyn ApprovalService>) -> Self {
        Self {
            service,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Blocks the calling stage until approved, rejected or timed out
    pub async fn await_approval(&self, request: &ApprovalRequest) -> Result<ApprovalOutcome> {
        info!(
            "Build #{} stage '{}' waiting up to {:?} for approval to deploy {} to {}",
            request.build_number, request.stage, self.timeout, request.image, request.environment
        );

        self.service.request(request).await?;

        match tokio::time::timeout(self.timeout, self.service.wait_for_decision(request)).await {
            Ok(decision) => {
                let outcome = ApprovalOutcome::from(decision?);
                info!("Build #{} approval outcome: {:?}", request.build_number, outcome);
                Ok(outcome)
            }
            Err(_) => {
                warn!(
                    "Build #{} approval timed out after {:?}",
                    request.build_number, self.timeout
                );
                Ok(ApprovalOutcome::TimedOut)
            }
        }
    }
}

/// Approval decisions exchanged through files in the state directory
///
/// The gate writes `<run>/approvals/<stage>.request.json` and polls for
/// `<run>/approvals/<stage>.json`, which `conveyor approve` creates.
#[derive(Debug, Clone)]
pub struct FileApprovalService {
    state: StateDir,
    poll_interval: Duration,
}

impl FileApprovalService {
    pub fn new(state: StateDir, poll_interval: Duration) -> Self {
        Self {
            state,
            poll_interval,
        }
    }

    pub fn decision_path(&self, build_number: u64, stage: &str) -> PathBuf {
        self.state
            .approvals_dir(build_number)
            .join(format!("{}.json", slug(stage)))
    }

    fn request_path(&self, build_number: u64, stage: &str) -> PathBuf {
        self.state
            .approvals_dir(build_number)
            .join(format!("{}.request.json", slug(stage)))
    }

    /// Records a decision for a waiting stage
    pub fn record_decision(
        &self,
        build_number: u64,
        stage: &str,
        decision: &ApprovalDecision,
    ) -> anyhow::Result<PathBuf> {
        let path = self.decision_path(build_number, stage);
        let json = serde_json::to_vec_pretty(decision)?;
        write_atomic(&path, &json)?;
        Ok(path)
    }

    /// Reads the pending request of a stage, if one was announced
    pub fn pending_request(&self, build_number: u64, stage: &str) -> Option<ApprovalRequest> {
        let json = std::fs::read(self.request_path(build_number, stage)).ok()?;
        serde_json::from_slice(&json).ok()
    }
}

#[async_trait]
impl ApprovalService for FileApprovalService {
    async fn request(&self, request: &ApprovalRequest) -> Result<()> {
        let path = self.request_path(request.build_number, &request.stage);
        let json = serde_json::to_vec_pretty(request).map_err(invalid_data)?;
        write_atomic(&path, &json)
            .map_err(|e| PipelineError::Io(std::io::Error::other(e.to_string())))?;

        info!(
            "Approve with: conveyor approve {} --stage {}",
            request.build_number, request.stage
        );
        Ok(())
    }

    async fn wait_for_decision(&self, request: &ApprovalRequest) -> Result<ApprovalDecision> {
        let path = self.decision_path(request.build_number, &request.stage);

        loop {
            match tokio::fs::read(&path).await {
                Ok(json) => return serde_json::from_slice(&json).map_err(invalid_data),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    tokio::time::sleep(self.poll_interval).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn invalid_data(e: serde_json::Error) -> PipelineError {
    PipelineError::Io(std::io::Error::new(ErrorKind::InvalidData, e))
}

/// `Deploy to prod` -> `deploy-to-prod`
fn slug(stage: &str) -> String {
    stage
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(build_number: u64) -> ApprovalRequest {
        ApprovalRequest {
            run_id: Uuid::new_v4(),
            build_number,
            stage: "Deploy".to_string(),
            environment: DeployTarget::Production,
            image: "registry.local/app:7".to_string(),
        }
    }

    struct Never;

    #[async_trait]
    impl ApprovalService for Never {
        async fn wait_for_decision(&self, _request: &ApprovalRequest) -> Result<ApprovalDecision> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_times_out() {
        let gate = ApprovalGate::new(Arc::new(Never));
        assert_eq!(gate.timeout(), Duration::from_secs(3600));

        let outcome = gate.await_approval(&request(1)).await.unwrap();
        assert_eq!(outcome, ApprovalOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_file_service_reads_decision() {
        let dir = tempfile::tempdir().unwrap();
        let service = FileApprovalService::new(StateDir::new(dir.path()), Duration::from_millis(10));
        let request = request(3);

        service.request(&request).await.unwrap();
        assert_eq!(service.pending_request(3, "Deploy"), Some(request.clone()));

        service
            .record_decision(
                3,
                "Deploy",
                &ApprovalDecision::Rejected {
                    by: Some("lead".to_string()),
                    reason: Some("freeze".to_string()),
                },
            )
            .unwrap();

        let gate = ApprovalGate::new(Arc::new(service)).with_timeout(Duration::from_secs(5));
        let outcome = gate.await_approval(&request).await.unwrap();
        assert_eq!(
            outcome,
            ApprovalOutcome::Rejected {
                by: Some("lead".to_string()),
                reason: Some("freeze".to_string()),
            }
        );
    }

    #[tokio::test]
    async fn test_file_service_polls_until_decision() {
        let dir = tempfile::tempdir().unwrap();
        let service = FileApprovalService::new(StateDir::new(dir.path()), Duration::from_millis(10));
        let writer = service.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            writer
                .record_decision(5, "Deploy", &ApprovalDecision::Approved { by: None })
                .unwrap();
        });

        let decision = service.wait_for_decision(&request(5)).await.unwrap();
        assert_eq!(decision, ApprovalDecision::Approved { by: None });
        handle.await.unwrap();
    }

    #[test]
    fn test_decision_path_uses_slug() {
        let service = FileApprovalService::new(StateDir::new("/state"), Duration::from_secs(1));
        assert_eq!(
            service.decision_path(9, "Deploy to Prod"),
            PathBuf::from("/state/runs/9/approvals/deploy-to-prod.json")
        );
    }
}
