//! In-memory fakes for executor and service tests

use async_trait::async_trait;
use conveyor_core::domain::status::{StatusEvent, StatusTarget};
use conveyor_core::{PipelineError, Result};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::command::{CommandOutput, CommandRunner, CommandSpec};
use crate::service::{
    ApprovalDecision, ApprovalRequest, ApprovalService, Notification, Notifier, StatusSink,
};

/// Shared, ordered record of what happened across fakes
#[derive(Clone, Default)]
pub(crate) struct Timeline {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Timeline {
    pub(crate) fn push(&self, entry: String) {
        self.entries.lock().unwrap().push(entry);
    }

    pub(crate) fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }
}

pub(crate) struct FakeOutput {
    exit_code: i32,
    stdout: String,
}

impl FakeOutput {
    pub(crate) fn exit(exit_code: i32) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
        }
    }

    pub(crate) fn stdout(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
        }
    }
}

type Responder = Box<dyn Fn(&CommandSpec) -> Option<FakeOutput> + Send + Sync>;

/// Records every command; succeeds unless a responder says otherwise
#[derive(Default)]
pub(crate) struct RecordingRunner {
    calls: Mutex<Vec<CommandSpec>>,
    responders: Vec<Responder>,
    hanging: Vec<String>,
    timeline: Timeline,
}

impl RecordingRunner {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_timeline(mut self, timeline: Timeline) -> Self {
        self.timeline = timeline;
        self
    }

    pub(crate) fn respond_with<F>(mut self, responder: F) -> Self
    where
        F: Fn(&CommandSpec) -> Option<FakeOutput> + Send + Sync + 'static,
    {
        self.responders.push(Box::new(responder));
        self
    }

    /// Commands running `program` never finish
    pub(crate) fn hang_on(mut self, program: &str) -> Self {
        self.hanging.push(program.to_string());
        self
    }

    pub(crate) fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    /// `program arg...` of every recorded command
    pub(crate) fn commands(&self) -> Vec<String> {
        self.calls().iter().map(CommandSpec::display).collect()
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(spec.clone());
        self.timeline.push(format!("cmd {}", spec.display()));

        if self.hanging.contains(&spec.program) {
            std::future::pending::<()>().await;
        }

        let output = self
            .responders
            .iter()
            .find_map(|responder| responder(spec))
            .unwrap_or_else(|| FakeOutput::exit(0));

        Ok(CommandOutput {
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: String::new(),
            duration: Duration::from_millis(1),
        })
    }
}

/// Records delivered events; the first `fail_first` attempts fail
#[derive(Default)]
pub(crate) struct RecordingSink {
    events: Mutex<Vec<StatusEvent>>,
    attempts: AtomicU32,
    fail_first: u32,
    rejects: bool,
    timeline: Timeline,
}

impl RecordingSink {
    pub(crate) fn failing_first(fail_first: u32) -> Self {
        Self {
            fail_first,
            ..Default::default()
        }
    }

    /// Every delivery fails with a non-retryable error
    pub(crate) fn rejecting() -> Self {
        Self {
            rejects: true,
            ..Default::default()
        }
    }

    pub(crate) fn with_timeline(mut self, timeline: Timeline) -> Self {
        self.timeline = timeline;
        self
    }

    pub(crate) fn events(&self) -> Vec<StatusEvent> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StatusSink for RecordingSink {
    async fn deliver(&self, event: &StatusEvent) -> Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if self.rejects {
            return Err(PipelineError::StatusDeliveryFailed {
                message: "401 bad credentials".to_string(),
                retryable: false,
            });
        }
        if attempt <= self.fail_first {
            return Err(PipelineError::StatusDeliveryFailed {
                message: "sink unavailable".to_string(),
                retryable: true,
            });
        }

        let target = match &event.target {
            StatusTarget::Stage(stage) => stage.as_str(),
            StatusTarget::Pipeline => "pipeline",
        };
        self.timeline.push(format!("status {} {}", target, event.state));
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    fail: bool,
    timeline: Timeline,
}

impl RecordingNotifier {
    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub(crate) fn with_timeline(mut self, timeline: Timeline) -> Self {
        self.timeline = timeline;
        self
    }

    pub(crate) fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        self.timeline.push(format!("notify {}", notification.subject));
        self.sent.lock().unwrap().push(notification.clone());
        if self.fail {
            return Err(PipelineError::NotificationFailed("mail relay down".to_string()));
        }
        Ok(())
    }
}

/// How a scripted approver answers
#[derive(Clone)]
pub(crate) enum Script {
    Approve,
    Reject(&'static str),
    Never,
}

pub(crate) struct ScriptedApprovals {
    script: Script,
    requests: AtomicUsize,
}

impl ScriptedApprovals {
    pub(crate) fn new(script: Script) -> Self {
        Self {
            script,
            requests: AtomicUsize::new(0),
        }
    }

    pub(crate) fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ApprovalService for ScriptedApprovals {
    async fn wait_for_decision(&self, _request: &ApprovalRequest) -> Result<ApprovalDecision> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            Script::Approve => Ok(ApprovalDecision::Approved {
                by: Some("release-manager".to_string()),
            }),
            Script::Reject(reason) => Ok(ApprovalDecision::Rejected {
                by: Some("release-manager".to_string()),
                reason: Some(reason.to_string()),
            }),
            Script::Never => std::future::pending().await,
        }
    }
}
