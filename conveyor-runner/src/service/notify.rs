//! End-of-run notifications

use async_trait::async_trait;
use conveyor_core::domain::credential::Secret;
use conveyor_core::domain::run::{PipelineRun, StageReport, StageState};
use conveyor_core::{PipelineError, Result};
use std::fmt::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::command::{CommandRunner, CommandSpec};

/// A message sent once per run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub subject: String,
    pub body: String,
    pub recipients: Vec<String>,
}

impl Notification {
    /// Summary of a finished run
    pub fn summary(run: &PipelineRun, stages: &[StageReport], recipients: Vec<String>) -> Self {
        let outcome = if run.is_failed() { "FAILED" } else { "SUCCEEDED" };
        let subject = format!("[conveyor] {} #{} {}", run.pipeline, run.build_number, outcome);

        let mut body = String::new();
        let _ = writeln!(body, "Pipeline: {}", run.pipeline);
        let _ = writeln!(body, "Build:    #{}", run.build_number);
        if let Some(actor) = &run.triggered_by {
            let _ = writeln!(body, "Started by: {}", actor);
        }
        let _ = writeln!(body);

        for param in run.parameters.iter() {
            let _ = writeln!(body, "  {} = {}", param.0, param.1);
        }
        let _ = writeln!(body);

        for stage in stages {
            let state = match stage.state {
                StageState::Pending => "pending",
                StageState::Running => "running",
                StageState::Succeeded => "succeeded",
                StageState::Failed => "FAILED",
                StageState::Skipped => "skipped",
            };
            let _ = write!(body, "  {:<12} {}", stage.name, state);
            if let Some(error) = &stage.error {
                let _ = write!(body, ": {}", error);
            }
            let _ = writeln!(body);
        }

        if let Some(failure) = &run.failure {
            let _ = writeln!(body);
            let _ = writeln!(body, "{}", failure);
        }

        Self {
            subject,
            body,
            recipients,
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<()>;
}

/// Writes notifications to the tracing log
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        info!(
            "{} (to: {})",
            notification.subject,
            notification.recipients.join(", ")
        );
        Ok(())
    }
}

/// Pipes an RFC 5322 message into a sendmail-compatible binary (`sendmail -t`)
pub struct MailNotifier {
    runner: Arc<dyn CommandRunner>,
    sendmail: String,
    from: String,
}

impl MailNotifier {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        sendmail: impl Into<String>,
        from: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            sendmail: sendmail.into(),
            from: from.into(),
        }
    }

    pub fn message(&self, notification: &Notification) -> String {
        format!(
            "From: {}\nTo: {}\nSubject: {}\n\n{}",
            self.from,
            notification.recipients.join(", "),
            notification.subject,
            notification.body
        )
    }
}

#[async_trait]
impl Notifier for MailNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        if notification.recipients.is_empty() {
            return Err(PipelineError::NotificationFailed(
                "no recipients resolved".to_string(),
            ));
        }

        let spec = CommandSpec::new(&self.sendmail, ["-t"])
            .stdin(Secret::new(self.message(notification)));

        let output = self
            .runner
            .run(&spec)
            .await
            .map_err(|e| PipelineError::NotificationFailed(e.to_string()))?;

        if !output.success() {
            return Err(PipelineError::NotificationFailed(format!(
                "{} exited with {}: {}",
                self.sendmail,
                output.exit_code,
                output.stderr.trim()
            )));
        }

        info!(
            "Sent '{}' to {} recipient(s)",
            notification.subject,
            notification.recipients.len()
        );
        Ok(())
    }
}

/// Who receives the end-of-run notification
///
/// Recent commit authors, then declared owners, then the triggering actor,
/// without duplicates.
#[derive(Debug, Clone, Default)]
pub struct RecipientPolicy {
    owners: Vec<String>,
    commit_author_limit: usize,
}

impl RecipientPolicy {
    pub fn new(owners: Vec<String>, commit_author_limit: usize) -> Self {
        Self {
            owners,
            commit_author_limit,
        }
    }

    pub async fn resolve(
        &self,
        runner: &dyn CommandRunner,
        workspace: &Path,
        actor: Option<&str>,
    ) -> Vec<String> {
        let mut candidates = self.commit_authors(runner, workspace).await;
        candidates.extend(self.owners.iter().cloned());
        candidates.extend(actor.map(str::to_string));

        let mut recipients: Vec<String> = Vec::new();
        for candidate in candidates {
            let candidate = candidate.trim();
            if candidate.is_empty()
                || recipients
                    .iter()
                    .any(|existing| existing.eq_ignore_ascii_case(candidate))
            {
                continue;
            }
            recipients.push(candidate.to_string());
        }
        recipients
    }

    /// Author addresses of recent commits; empty if the workspace is not a repository
    async fn commit_authors(&self, runner: &dyn CommandRunner, workspace: &Path) -> Vec<String> {
        if self.commit_author_limit == 0 {
            return Vec::new();
        }

        let spec = CommandSpec::new(
            "git",
            [
                "log".to_string(),
                "--format=%ae".to_string(),
                "-n".to_string(),
                self.commit_author_limit.to_string(),
            ],
        )
        .cwd(workspace);

        match runner.run(&spec).await {
            Ok(output) if output.success() => {
                output.stdout.lines().map(str::to_string).collect()
            }
            Ok(output) => {
                debug!("git log exited with {}, no commit authors", output.exit_code);
                Vec::new()
            }
            Err(e) => {
                debug!("Could not read commit authors: {}", e);
                Vec::new()
            }
        }
    }
}
