//! Status reporting
//!
//! The executor is the single producer of [`StatusEvent`]s for a run and awaits
//! each delivery before moving on, so sinks see events in execution order.
//! Delivery is best-effort: transient failures are retried, then logged and returned
//! as `StatusDeliveryFailed` for the run log, never propagated as a stage
//! failure.

use async_trait::async_trait;
use conveyor_client::{CommitState, CommitStatus, ScmClient};
use conveyor_core::domain::status::{StatusEvent, StatusState, StatusTarget};
use conveyor_core::{PipelineError, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::service::credentials::CredentialBroker;

/// Receiver of status events
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn deliver(&self, event: &StatusEvent) -> Result<()>;
}

/// Delivers events to a sink with bounded retries
#[derive(Clone)]
pub struct StatusReporter {
    sink: Arc<dyn StatusSink>,
    attempts: u32,
    backoff: Duration,
}

impl StatusReporter {
    const MAX_BACKOFF: Duration = Duration::from_secs(30);

    pub fn new(sink: Arc<dyn StatusSink>) -> Self {
        Self {
            sink,
            attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }

    pub fn with_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.backoff = backoff;
        self
    }

    /// Delivers `event`, retrying with exponential backoff
    ///
    /// Only retryable errors are retried. Returns `StatusDeliveryFailed` after
    /// the last attempt; callers log it and carry on.
    pub async fn report(&self, event: &StatusEvent) -> Result<()> {
        let mut delay = self.backoff;
        let mut attempt = 0;

        loop {
            attempt += 1;

            match self.sink.deliver(event).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= self.attempts || !e.is_retryable() => {
                    warn!(
                        "Giving up on status '{}' for build #{} after {} attempt(s): {}",
                        event.description, event.build_number, attempt, e
                    );
                    return Err(PipelineError::StatusDeliveryFailed {
                        message: format!("{}: {}", event.description, e),
                        retryable: e.is_retryable(),
                    });
                }
                Err(e) => {
                    warn!(
                        "Status delivery failed (attempt {}/{}): {}",
                        attempt, self.attempts, e
                    );
                    tokio::time::sleep(delay).await;

                    // Exponential backoff with cap
                    delay = (delay * 2).min(Self::MAX_BACKOFF);
                }
            }
        }
    }
}

/// Writes events to the tracing log
#[derive(Debug, Clone, Default)]
pub struct LogStatusSink;

#[async_trait]
impl StatusSink for LogStatusSink {
    async fn deliver(&self, event: &StatusEvent) -> Result<()> {
        info!(
            build = event.build_number,
            state = %event.state,
            "{}",
            event.description
        );
        Ok(())
    }
}

/// Delivers every event to several sinks
///
/// All sinks are attempted; the first error is returned. A retry re-delivers
/// to sinks that already succeeded, which is fine for at-least-once sinks.
#[derive(Clone, Default)]
pub struct FanOutSink {
    sinks: Vec<Arc<dyn StatusSink>>,
}

impl FanOutSink {
    pub fn new(sinks: Vec<Arc<dyn StatusSink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn StatusSink>) {
        self.sinks.push(sink);
    }
}

#[async_trait]
impl StatusSink for FanOutSink {
    async fn deliver(&self, event: &StatusEvent) -> Result<()> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.deliver(event).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Publishes events as commit statuses on the source-control host
pub struct CommitStatusSink {
    client: ScmClient,
    repository: String,
    sha: String,
    context_prefix: String,
    target_url: Option<String>,
    broker: CredentialBroker,
    token_credential: Option<String>,
}

impl CommitStatusSink {
    pub fn new(
        client: ScmClient,
        repository: impl Into<String>,
        sha: impl Into<String>,
        context_prefix: impl Into<String>,
        broker: CredentialBroker,
    ) -> Self {
        Self {
            client,
            repository: repository.into(),
            sha: sha.into(),
            context_prefix: context_prefix.into(),
            target_url: None,
            broker,
            token_credential: None,
        }
    }

    /// Secret-text credential holding the API token
    pub fn with_token_credential(mut self, name: impl Into<String>) -> Self {
        self.token_credential = Some(name.into());
        self
    }

    /// Link template; `{build}` is replaced by the build number
    pub fn with_target_url(mut self, url: impl Into<String>) -> Self {
        self.target_url = Some(url.into());
        self
    }

    /// Maps an event to the host's commit status body
    pub fn commit_status(&self, event: &StatusEvent) -> CommitStatus {
        let state = match event.state {
            StatusState::Running => CommitState::Pending,
            StatusState::Success => CommitState::Success,
            StatusState::Failed => CommitState::Failure,
        };

        let context = match &event.target {
            StatusTarget::Stage(stage) => format!("{}/{}", self.context_prefix, stage),
            StatusTarget::Pipeline => self.context_prefix.clone(),
        };

        let status = CommitStatus::new(state, context, event.description.clone());
        match &self.target_url {
            Some(url) => {
                status.with_target_url(url.replace("{build}", &event.build_number.to_string()))
            }
            None => status,
        }
    }

    async fn post(&self, status: &CommitStatus, token: Option<&str>) -> Result<()> {
        self.client
            .create_commit_status(&self.repository, &self.sha, status, token)
            .await
            .map(|_| ())
            .map_err(|e| PipelineError::StatusDeliveryFailed {
                message: e.to_string(),
                retryable: e.is_retryable(),
            })
    }
}

#[async_trait]
impl StatusSink for CommitStatusSink {
    async fn deliver(&self, event: &StatusEvent) -> Result<()> {
        let status = self.commit_status(event);

        match &self.token_credential {
            Some(name) => {
                self.broker
                    .with_credential(name, |credential| async move {
                        let token = credential.secret_text()?;
                        self.post(&status, Some(token.expose())).await
                    })
                    .await
            }
            None => self.post(&status, None).await,
        }
    }
}
