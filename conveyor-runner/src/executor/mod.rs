//! Stage executor
//!
//! Drives one pipeline run:
//! - Evaluates each stage's guard against the resolved parameters
//! - Runs the stage body, stopping at the first failing step
//! - Runs outcome hooks (`success`/`failure`, then `always`)
//! - Emits a status event when a stage starts and when it ends
//! - After the last stage runs the pipeline hooks, sends the end-of-run
//!   notification and emits the pipeline status
//!
//! Once a stage fails, every later stage is skipped; pipeline hooks and the
//! notification still run.

mod steps;

use conveyor_core::domain::pipeline::{HookKind, PipelineDefinition, Stage, Step};
use conveyor_core::domain::run::{PipelineRun, RunReport, StageReport};
use conveyor_core::domain::status::{StatusEvent, StatusState};
use conveyor_core::{PipelineError, Result};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::command::CommandRunner;
use crate::context::RunContext;
use crate::podman::ContainerTool;
use crate::service::{
    ApprovalGate, CredentialBroker, Notification, Notifier, RecipientPolicy, StatusReporter,
};

/// Executes pipeline runs with injected collaborators
pub struct PipelineExecutor {
    runner: Arc<dyn CommandRunner>,
    broker: CredentialBroker,
    approvals: ApprovalGate,
    reporter: StatusReporter,
    notifier: Arc<dyn Notifier>,
    containers: ContainerTool,
    recipients: RecipientPolicy,
}

impl PipelineExecutor {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        broker: CredentialBroker,
        approvals: ApprovalGate,
        reporter: StatusReporter,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            runner,
            broker,
            approvals,
            reporter,
            notifier,
            containers: ContainerTool::default(),
            recipients: RecipientPolicy::default(),
        }
    }

    pub fn with_container_tool(mut self, containers: ContainerTool) -> Self {
        self.containers = containers;
        self
    }

    pub fn with_recipients(mut self, recipients: RecipientPolicy) -> Self {
        self.recipients = recipients;
        self
    }

    /// Executes `run` to completion
    ///
    /// Never returns early: failures are recorded on the run and its stage
    /// reports, and the returned report is always terminal.
    pub async fn execute(
        &self,
        definition: &PipelineDefinition,
        mut run: PipelineRun,
        context: &RunContext,
    ) -> RunReport {
        info!(
            "Starting build #{} of pipeline '{}'",
            run.build_number, definition.name
        );
        context.log_info(format!(
            "Starting pipeline: {} (build #{})",
            definition.name, run.build_number
        ));
        for (name, value) in run.parameters.iter() {
            context.log_info(format!("  {} = {}", name, value));
        }

        run.start();

        let mut stages: Vec<StageReport> = definition
            .stages
            .iter()
            .map(|stage| StageReport::pending(&stage.name))
            .collect();
        let total = definition.stages.len();

        for (idx, (stage, report)) in definition.stages.iter().zip(stages.iter_mut()).enumerate() {
            if run.is_failed() {
                report.skip("an earlier stage failed");
                continue;
            }

            if !stage.guard.evaluate(&run.parameters) {
                info!("Skipping stage '{}': condition not met", stage.name);
                context.log_info(format!("Skipping stage: {} (condition not met)", stage.name));
                report.skip("condition not met");
                continue;
            }

            info!("Executing stage {}/{}: {}", idx + 1, total, stage.name);
            self.run_stage(stage, report, &mut run, context).await;
        }

        let outcome = if run.is_failed() {
            HookKind::Failure
        } else {
            HookKind::Success
        };

        let mut hook_failures = Vec::new();
        self.run_hooks(
            "pipeline",
            definition.post.hook(outcome),
            &run,
            context,
            &mut hook_failures,
        )
        .await;

        let notification_error = self.send_notification(&run, &stages, context).await;

        self.run_hooks(
            "pipeline",
            definition.post.hook(HookKind::Always),
            &run,
            context,
            &mut hook_failures,
        )
        .await;

        run.finish();

        let state = if run.is_failed() {
            error!(
                "Build #{} failed: {}",
                run.build_number,
                run.failure.as_deref().unwrap_or("unknown error")
            );
            context.log_error(format!(
                "Pipeline failed: {}",
                run.failure.as_deref().unwrap_or("unknown error")
            ));
            StatusState::Failed
        } else {
            info!("Build #{} completed successfully", run.build_number);
            context.log_info("Pipeline completed successfully".to_string());
            StatusState::Success
        };

        self.emit(StatusEvent::pipeline(run.id, run.build_number, state), context)
            .await;

        RunReport {
            run,
            stages,
            hook_failures,
            notification_error,
        }
    }

    async fn run_stage(
        &self,
        stage: &Stage,
        report: &mut StageReport,
        run: &mut PipelineRun,
        context: &RunContext,
    ) {
        run.enter_stage(&stage.name);
        report.start();
        context.log_info(format!("Starting stage: {}", stage.name));

        self.emit(
            StatusEvent::stage(run.id, run.build_number, &stage.name, StatusState::Running),
            context,
        )
        .await;

        let result = match stage.timeout() {
            Some(timeout) => tokio::time::timeout(timeout, self.run_body(stage, run, context))
                .await
                .unwrap_or_else(|_| {
                    Err(PipelineError::StageTimedOut {
                        stage: stage.name.clone(),
                        timeout,
                    })
                }),
            None => self.run_body(stage, run, context).await,
        };

        let (outcome, state) = match result {
            Ok(()) => {
                report.succeed();
                context.log_info(format!("Stage '{}' completed", stage.name));
                (HookKind::Success, StatusState::Success)
            }
            Err(e) => {
                error!("Stage '{}' failed: {}", stage.name, e);
                context.log_error(format!("Stage '{}' failed: {}", stage.name, e));
                report.fail(e.to_string());
                report.exit_code = e.exit_code();
                run.fail(format!("Stage '{}' failed: {}", stage.name, e));
                (HookKind::Failure, StatusState::Failed)
            }
        };

        self.run_hooks(
            &stage.name,
            stage.post.hook(outcome),
            run,
            context,
            &mut report.hook_failures,
        )
        .await;
        self.run_hooks(
            &stage.name,
            stage.post.hook(HookKind::Always),
            run,
            context,
            &mut report.hook_failures,
        )
        .await;

        self.emit(
            StatusEvent::stage(run.id, run.build_number, &stage.name, state),
            context,
        )
        .await;
    }

    async fn run_body(&self, stage: &Stage, run: &PipelineRun, context: &RunContext) -> Result<()> {
        for step in &stage.steps {
            context.log_info(format!("[{}] {}", stage.name, step.label()));
            self.run_step(step, run, context).await?;
        }
        Ok(())
    }

    /// Runs every hook step; failures are recorded, never propagated
    async fn run_hooks(
        &self,
        owner: &str,
        steps: &[Step],
        run: &PipelineRun,
        context: &RunContext,
        failures: &mut Vec<String>,
    ) {
        for step in steps {
            if let Err(e) = self.run_step(step, run, context).await {
                let message = format!("{} post step '{}' failed: {}", owner, step.label(), e);
                warn!("{}", message);
                context.log_warning(message.clone());
                failures.push(message);
            }
        }
    }

    async fn emit(&self, event: StatusEvent, context: &RunContext) {
        if let Err(e) = self.reporter.report(&event).await {
            context.log_warning(e.to_string());
        }
    }

    async fn send_notification(
        &self,
        run: &PipelineRun,
        stages: &[StageReport],
        context: &RunContext,
    ) -> Option<String> {
        let recipients = self
            .recipients
            .resolve(
                self.runner.as_ref(),
                context.workspace(),
                run.triggered_by.as_deref(),
            )
            .await;

        let notification = Notification::summary(run, stages, recipients);
        match self.notifier.notify(&notification).await {
            Ok(()) => {
                context.log_info(format!("Notification sent: {}", notification.subject));
                None
            }
            Err(e) => {
                warn!("Failed to send notification: {}", e);
                context.log_warning(format!("Failed to send notification: {}", e));
                Some(e.to_string())
            }
        }
    }
}
