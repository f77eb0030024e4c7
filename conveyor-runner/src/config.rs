//! Runner configuration
//!
//! Defines where runs keep their workspaces and state, how long approvals may
//! block, how status delivery is retried, and the optional source-control and
//! mail integrations.

use std::path::PathBuf;
use std::time::Duration;

/// Commit-status integration settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScmConfig {
    /// API base URL (e.g., "https://api.github.com")
    pub api_url: String,

    /// Repository slug, `owner/repo`
    pub repository: String,

    /// Commit the statuses are attached to
    pub commit_sha: String,

    /// Status context prefix; stage statuses use `<prefix>/<stage>`
    pub context_prefix: String,

    /// Name of the secret-text credential holding the API token
    pub token_credential: Option<String>,

    /// Link attached to every status, `{build}` is replaced by the build number
    pub target_url: Option<String>,
}

/// Email notification settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailConfig {
    /// Path of a sendmail-compatible binary
    pub sendmail: String,

    /// Sender address
    pub from: String,
}

/// Runner configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Base directory for run workspaces
    pub workspace_base: PathBuf,

    /// Directory holding the build counter, reports and approval files
    pub state_dir: PathBuf,

    /// Container CLI (`podman` or `docker`)
    pub container_tool: String,

    /// How long a gated deploy waits for a decision
    pub approval_timeout: Duration,

    /// How often the file-based approval service checks for a decision
    pub approval_poll_interval: Duration,

    /// Delivery attempts per status event
    pub status_retry_attempts: u32,

    /// Initial delay between status delivery attempts
    pub status_retry_backoff: Duration,

    pub scm: Option<ScmConfig>,

    /// Repository cloned by the checkout stage
    pub git_url: Option<String>,

    /// Revision checked out by the checkout stage
    pub git_commit: Option<String>,

    pub mail: Option<MailConfig>,

    /// Addresses that always receive the end-of-run notification
    pub owners: Vec<String>,

    /// Who triggered the run
    pub triggered_by: Option<String>,

    /// How many recent commits are scanned for author addresses (0 disables)
    pub commit_author_limit: usize,
}

impl Config {
    /// Creates a configuration with defaults
    pub fn new(workspace_base: PathBuf, state_dir: PathBuf) -> Self {
        Self {
            workspace_base,
            state_dir,
            container_tool: "podman".to_string(),
            approval_timeout: Duration::from_secs(60 * 60),
            approval_poll_interval: Duration::from_secs(5),
            status_retry_attempts: 3,
            status_retry_backoff: Duration::from_millis(500),
            scm: None,
            git_url: None,
            git_commit: None,
            mail: None,
            owners: Vec::new(),
            triggered_by: None,
            commit_author_limit: 20,
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Environment variables (all optional):
    /// - CONVEYOR_WORKSPACE_BASE (default: `<tmp>/conveyor`)
    /// - CONVEYOR_STATE_DIR (default: `.conveyor`)
    /// - CONVEYOR_CONTAINER_TOOL (default: podman)
    /// - CONVEYOR_APPROVAL_TIMEOUT (seconds, default: 3600)
    /// - CONVEYOR_APPROVAL_POLL_INTERVAL (seconds, default: 5)
    /// - CONVEYOR_STATUS_RETRIES (default: 3)
    /// - CONVEYOR_STATUS_RETRY_BACKOFF_MS (default: 500)
    /// - CONVEYOR_SCM_API_URL, CONVEYOR_SCM_REPOSITORY, CONVEYOR_SCM_CONTEXT,
    ///   CONVEYOR_SCM_TOKEN_CREDENTIAL, CONVEYOR_SCM_TARGET_URL
    /// - CONVEYOR_GIT_URL / GIT_URL, CONVEYOR_GIT_COMMIT / GIT_COMMIT
    /// - CONVEYOR_SENDMAIL, CONVEYOR_MAIL_FROM
    /// - CONVEYOR_OWNERS (comma separated), CONVEYOR_ACTOR
    /// - CONVEYOR_COMMIT_AUTHOR_LIMIT (default: 20)
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Creates configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let secs = |key: &str| {
            var(key)
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs)
        };

        let defaults = Self::default();

        let workspace_base = var("CONVEYOR_WORKSPACE_BASE")
            .map(PathBuf::from)
            .unwrap_or(defaults.workspace_base);

        let state_dir = var("CONVEYOR_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.state_dir);

        let container_tool = var("CONVEYOR_CONTAINER_TOOL").unwrap_or(defaults.container_tool);

        let approval_timeout =
            secs("CONVEYOR_APPROVAL_TIMEOUT").unwrap_or(defaults.approval_timeout);

        let approval_poll_interval =
            secs("CONVEYOR_APPROVAL_POLL_INTERVAL").unwrap_or(defaults.approval_poll_interval);

        let status_retry_attempts = var("CONVEYOR_STATUS_RETRIES")
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(defaults.status_retry_attempts);

        let status_retry_backoff = var("CONVEYOR_STATUS_RETRY_BACKOFF_MS")
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.status_retry_backoff);

        let git_url = var("CONVEYOR_GIT_URL").or_else(|| var("GIT_URL"));
        let git_commit = var("CONVEYOR_GIT_COMMIT").or_else(|| var("GIT_COMMIT"));

        let scm = match var("CONVEYOR_SCM_API_URL") {
            Some(api_url) => {
                let repository = var("CONVEYOR_SCM_REPOSITORY").ok_or_else(|| {
                    anyhow::anyhow!("CONVEYOR_SCM_API_URL is set but CONVEYOR_SCM_REPOSITORY is not")
                })?;
                let commit_sha = git_commit.clone().ok_or_else(|| {
                    anyhow::anyhow!("CONVEYOR_SCM_API_URL is set but no commit SHA (GIT_COMMIT) is")
                })?;
                Some(ScmConfig {
                    api_url,
                    repository,
                    commit_sha,
                    context_prefix: var("CONVEYOR_SCM_CONTEXT")
                        .unwrap_or_else(|| "conveyor".to_string()),
                    token_credential: var("CONVEYOR_SCM_TOKEN_CREDENTIAL"),
                    target_url: var("CONVEYOR_SCM_TARGET_URL"),
                })
            }
            None => None,
        };

        let mail = var("CONVEYOR_SENDMAIL").map(|sendmail| MailConfig {
            sendmail,
            from: var("CONVEYOR_MAIL_FROM").unwrap_or_else(|| "conveyor@localhost".to_string()),
        });

        let owners = var("CONVEYOR_OWNERS")
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|owner| !owner.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let commit_author_limit = var("CONVEYOR_COMMIT_AUTHOR_LIMIT")
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(defaults.commit_author_limit);

        Ok(Self {
            workspace_base,
            state_dir,
            container_tool,
            approval_timeout,
            approval_poll_interval,
            status_retry_attempts,
            status_retry_backoff,
            scm,
            git_url,
            git_commit,
            mail,
            owners,
            triggered_by: var("CONVEYOR_ACTOR"),
            commit_author_limit,
        })
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.workspace_base.as_os_str().is_empty() {
            anyhow::bail!("workspace_base cannot be empty");
        }

        if self.state_dir.as_os_str().is_empty() {
            anyhow::bail!("state_dir cannot be empty");
        }

        if self.container_tool.trim().is_empty() {
            anyhow::bail!("container_tool cannot be empty");
        }

        if self.approval_timeout.is_zero() {
            anyhow::bail!("approval_timeout must be greater than 0");
        }

        if self.approval_poll_interval.is_zero() {
            anyhow::bail!("approval_poll_interval must be greater than 0");
        }

        if self.status_retry_attempts == 0 {
            anyhow::bail!("status_retry_attempts must be greater than 0");
        }

        if let Some(scm) = &self.scm {
            if !scm.api_url.starts_with("http://") && !scm.api_url.starts_with("https://") {
                anyhow::bail!("scm api_url must start with http:// or https://");
            }

            let parts: Vec<&str> = scm.repository.split('/').collect();
            if parts.len() != 2 || parts.iter().any(|part| part.is_empty()) {
                anyhow::bail!("scm repository must be of the form owner/repo");
            }

            if scm.commit_sha.trim().is_empty() {
                anyhow::bail!("scm commit_sha cannot be empty");
            }

            if scm.context_prefix.trim().is_empty() {
                anyhow::bail!("scm context_prefix cannot be empty");
            }
        }

        if let Some(mail) = &self.mail {
            if mail.sendmail.trim().is_empty() {
                anyhow::bail!("sendmail path cannot be empty");
            }
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(std::env::temp_dir().join("conveyor"), PathBuf::from(".conveyor"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.approval_timeout, Duration::from_secs(3600));
        assert_eq!(config.approval_poll_interval, Duration::from_secs(5));
        assert_eq!(config.status_retry_attempts, 3);
        assert_eq!(config.container_tool, "podman");
        assert!(config.scm.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("CONVEYOR_STATE_DIR", "/var/lib/conveyor"),
            ("CONVEYOR_CONTAINER_TOOL", "docker"),
            ("CONVEYOR_APPROVAL_TIMEOUT", "120"),
            ("CONVEYOR_OWNERS", "ops@example.com, lead@example.com,"),
            ("GIT_COMMIT", "abc123"),
            ("CONVEYOR_SCM_API_URL", "https://git.example.com/api/v1"),
            ("CONVEYOR_SCM_REPOSITORY", "acme/app"),
        ]))
        .unwrap();

        assert_eq!(config.state_dir, PathBuf::from("/var/lib/conveyor"));
        assert_eq!(config.container_tool, "docker");
        assert_eq!(config.approval_timeout, Duration::from_secs(120));
        assert_eq!(config.owners, vec!["ops@example.com", "lead@example.com"]);

        let scm = config.scm.as_ref().unwrap();
        assert_eq!(scm.commit_sha, "abc123");
        assert_eq!(scm.context_prefix, "conveyor");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_scm_requires_commit() {
        let result = Config::from_lookup(lookup(&[
            ("CONVEYOR_SCM_API_URL", "https://git.example.com"),
            ("CONVEYOR_SCM_REPOSITORY", "acme/app"),
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn test_unparseable_values_fall_back_to_defaults() {
        let config = Config::from_lookup(lookup(&[
            ("CONVEYOR_APPROVAL_TIMEOUT", "soon"),
            ("CONVEYOR_STATUS_RETRIES", "-1"),
        ]))
        .unwrap();
        assert_eq!(config.approval_timeout, Duration::from_secs(3600));
        assert_eq!(config.status_retry_attempts, 3);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.approval_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
        config.approval_timeout = Duration::from_secs(1);

        config.scm = Some(ScmConfig {
            api_url: "not-a-url".to_string(),
            repository: "acme/app".to_string(),
            commit_sha: "abc".to_string(),
            context_prefix: "conveyor".to_string(),
            token_credential: None,
            target_url: None,
        });
        assert!(config.validate().is_err());

        if let Some(scm) = config.scm.as_mut() {
            scm.api_url = "https://api.github.com".to_string();
            scm.repository = "acme".to_string();
        }
        assert!(config.validate().is_err());

        if let Some(scm) = config.scm.as_mut() {
            scm.repository = "acme/app".to_string();
        }
        assert!(config.validate().is_ok());
    }
}
