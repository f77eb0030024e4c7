//! Conveyor HTTP Client
//!
//! A small, typed HTTP client for the source-control host API. The runner uses
//! it to publish commit statuses for stage transitions.
//!
//! # Example
//!
//! ```no_run
//! use conveyor_client::{CommitState, CommitStatus, ScmClient};
//!
//! # async fn example() -> conveyor_client::Result<()> {
//! let client = ScmClient::new("https://api.github.com");
//!
//! let status = CommitStatus::new(CommitState::Pending, "conveyor/Build", "Build is running");
//! client
//!     .create_commit_status("acme/app", "3f2c1d0", &status, Some("token"))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
mod statuses;

pub use error::{ClientError, Result};
pub use statuses::{CommitState, CommitStatus};

use reqwest::Client;
use serde::de::DeserializeOwned;

/// HTTP client for the source-control host API
#[derive(Debug, Clone)]
pub struct ScmClient {
    /// Base URL of the API (e.g., "https://api.github.com")
    base_url: String,
    /// HTTP client instance
    client: Client,
}

impl ScmClient {
    /// Create a new client
    ///
    /// # Example
    /// ```
    /// use conveyor_client::ScmClient;
    ///
    /// let client = ScmClient::new("https://git.example.com/api/v1");
    /// ```
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    /// Create a new client with a custom HTTP client
    ///
    /// This allows you to configure timeouts, proxies, TLS settings, etc.
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Get the base URL of the API
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Handle an API response and deserialize JSON
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = ScmClient::new("https://api.github.com");
        assert_eq!(client.base_url(), "https://api.github.com");
    }

    #[test]
    fn test_client_trims_trailing_slash() {
        let client = ScmClient::new("https://git.example.com/api/v1/");
        assert_eq!(client.base_url(), "https://git.example.com/api/v1");
    }

    #[test]
    fn test_client_with_custom_client() {
        let client = ScmClient::with_client("http://localhost:3000", Client::new());
        assert_eq!(client.base_url(), "http://localhost:3000");
    }
}
