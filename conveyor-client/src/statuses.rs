//! Commit status endpoints

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ScmClient;
use crate::error::{ClientError, Result};

/// State accepted by the commit status API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitState {
    Pending,
    Success,
    Failure,
    Error,
}

/// Body of a commit status update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitStatus {
    pub state: CommitState,
    pub context: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_url: Option<String>,
}

impl CommitStatus {
    pub fn new(
        state: CommitState,
        context: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            state,
            context: context.into(),
            description: description.into(),
            target_url: None,
        }
    }

    pub fn with_target_url(mut self, url: impl Into<String>) -> Self {
        self.target_url = Some(url.into());
        self
    }
}

impl ScmClient {
    /// Create a commit status
    ///
    /// # Arguments
    /// * `repository` - Repository slug, `owner/repo`
    /// * `sha` - Commit the status is attached to
    /// * `status` - State, context and description
    /// * `token` - Bearer token, if the host requires authentication
    ///
    /// # Returns
    /// The status as echoed back by the host
    pub async fn create_commit_status(
        &self,
        repository: &str,
        sha: &str,
        status: &CommitStatus,
        token: Option<&str>,
    ) -> Result<serde_json::Value> {
        if repository.split('/').filter(|part| !part.is_empty()).count() != 2 {
            return Err(ClientError::InvalidRequest(format!(
                "repository '{}' is not of the form owner/repo",
                repository
            )));
        }
        if sha.is_empty() {
            return Err(ClientError::InvalidRequest(
                "commit sha cannot be empty".to_string(),
            ));
        }

        let url = format!("{}/repos/{}/statuses/{}", self.base_url, repository, sha);
        debug!("POST {} context={} state={:?}", url, status.context, status.state);

        let mut request = self.client.post(&url).json(status);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        self.handle_response(response).await
    }
}
