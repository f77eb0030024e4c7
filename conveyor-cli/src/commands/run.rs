//! Run command handler
//!
//! Wires the runner's services from configuration, executes one pipeline run
//! and persists its report and run log.

use anyhow::{Context, Result};
use colored::*;
use conveyor_client::ScmClient;
use conveyor_core::domain::parameter::resolve_parameters;
use conveyor_core::domain::pipeline::PipelineDefinition;
use conveyor_core::domain::run::{PipelineRun, RunReport, StageReport, StageState};
use conveyor_runner::service::{
    ApprovalGate, CommitStatusSink, CredentialBroker, EnvCredentialStore, FanOutSink,
    FileApprovalService, LogNotifier, LogStatusSink, MailNotifier, Notifier, RecipientPolicy,
    StatusReporter, StatusSink,
};
use conveyor_runner::{
    CommandRunner, Config, ContainerTool, PipelineExecutor, ProcessRunner, RunContext, StateDir,
    Workspace,
};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::load_definition;

/// Run a pipeline to completion
///
/// Definition and parameter errors are reported before a build number is
/// claimed. Once claimed, every build ends with a report on disk.
pub async fn run_pipeline(
    config: &Config,
    pipeline: Option<&Path>,
    params: Vec<(String, String)>,
    actor: Option<String>,
) -> Result<ExitCode> {
    let definition = load_definition(pipeline)?;

    let raw: HashMap<String, String> = params.into_iter().collect();
    let parameters =
        resolve_parameters(&definition.inputs, &raw).context("Failed to resolve parameters")?;

    let mut extra = BTreeMap::new();
    if let Some(url) = &config.git_url {
        extra.insert("GIT_URL".to_string(), url.clone());
    }
    if let Some(commit) = &config.git_commit {
        extra.insert("GIT_COMMIT".to_string(), commit.clone());
    }
    RunContext::check_environment(&definition, &parameters, &extra)
        .context("Failed to prepare the run environment")?;

    let state = StateDir::new(&config.state_dir);
    let executor = build_executor(config, &state).await?;

    let build_number = state.claim_build_number()?;
    let run = PipelineRun::new(
        build_number,
        &definition.name,
        parameters,
        actor.or_else(|| config.triggered_by.clone()),
    );

    let (report, logs) = match prepare_run(config, &state, &definition, &run, extra) {
        Ok(context) => {
            println!(
                "{} {} #{}",
                "▸ Running".cyan().bold(),
                definition.name.bold(),
                build_number
            );
            let report = executor.execute(&definition, run, &context).await;
            (report, context.drain_logs())
        }
        Err(e) => {
            error!("Build #{} could not start: {:#}", build_number, e);
            (setup_failure_report(&definition, run, &e), Vec::new())
        }
    };

    let report_path = state.write_report(&report)?;
    let log_path = state.write_run_log(build_number, &logs)?;
    info!("Report written to {}", report_path.display());

    print_summary(&report);
    println!("  Report:  {}", report_path.display().to_string().dimmed());
    println!("  Run log: {}", log_path.display().to_string().dimmed());

    Ok(if report.succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Creates the workspace and run context; the workspace is removed again if
/// the context cannot be built
fn prepare_run(
    config: &Config,
    state: &StateDir,
    definition: &PipelineDefinition,
    run: &PipelineRun,
    extra: BTreeMap<String, String>,
) -> Result<RunContext> {
    let workspace = Workspace::create(&config.workspace_base, &definition.name, run.build_number)?;

    RunContext::new(
        definition,
        run,
        workspace.path().to_path_buf(),
        state.artifacts_dir(run.build_number),
        extra,
    )
    .inspect_err(|_| {
        if let Err(e) = std::fs::remove_dir_all(workspace.path()) {
            warn!("Failed to remove workspace {}: {}", workspace.path().display(), e);
        }
    })
    .context("Failed to prepare the run environment")
}

/// Failed report for a claimed build whose stages never ran
fn setup_failure_report(
    definition: &PipelineDefinition,
    mut run: PipelineRun,
    error: &anyhow::Error,
) -> RunReport {
    run.start();
    run.fail(format!("Run setup failed: {:#}", error));
    run.finish();

    let stages = definition
        .stages
        .iter()
        .map(|stage| {
            let mut report = StageReport::pending(&stage.name);
            report.skip("run setup failed");
            report
        })
        .collect();

    RunReport {
        run,
        stages,
        hook_failures: Vec::new(),
        notification_error: None,
    }
}

/// Builds the executor and its collaborators from configuration
async fn build_executor(config: &Config, state: &StateDir) -> Result<PipelineExecutor> {
    let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner::new());

    let containers = ContainerTool::new(&config.container_tool);
    match containers.check_available(runner.as_ref()).await {
        Ok(version) => info!("Using {}", version),
        Err(e) => warn!("{} is not usable, container steps will fail: {}", config.container_tool, e),
    }

    let broker = CredentialBroker::new(Arc::new(EnvCredentialStore::new()));

    let mut sink = FanOutSink::new(vec![Arc::new(LogStatusSink)]);
    if let Some(scm) = &config.scm {
        info!(
            "Reporting commit statuses to {} for {}@{}",
            scm.api_url, scm.repository, scm.commit_sha
        );
        let mut commit_sink = CommitStatusSink::new(
            ScmClient::new(&scm.api_url),
            &scm.repository,
            &scm.commit_sha,
            &scm.context_prefix,
            broker.clone(),
        );
        if let Some(name) = &scm.token_credential {
            commit_sink = commit_sink.with_token_credential(name);
        }
        if let Some(url) = &scm.target_url {
            commit_sink = commit_sink.with_target_url(url);
        }
        sink.push(Arc::new(commit_sink));
    }
    let sink: Arc<dyn StatusSink> = Arc::new(sink);
    let reporter = StatusReporter::new(sink)
        .with_retry(config.status_retry_attempts, config.status_retry_backoff);

    let notifier: Arc<dyn Notifier> = match &config.mail {
        Some(mail) => Arc::new(MailNotifier::new(
            runner.clone(),
            &mail.sendmail,
            &mail.from,
        )),
        None => Arc::new(LogNotifier),
    };

    let approvals = ApprovalGate::new(Arc::new(FileApprovalService::new(
        state.clone(),
        config.approval_poll_interval,
    )))
    .with_timeout(config.approval_timeout);

    Ok(
        PipelineExecutor::new(runner, broker, approvals, reporter, notifier)
            .with_container_tool(containers)
            .with_recipients(RecipientPolicy::new(
                config.owners.clone(),
                config.commit_author_limit,
            )),
    )
}

/// Prints a colored per-stage summary of a finished run
pub fn print_summary(report: &RunReport) {
    let run = &report.run;
    println!();
    for stage in &report.stages {
        let (marker, state) = match stage.state {
            StageState::Succeeded => ("✓".green(), "succeeded".green()),
            StageState::Failed => ("✗".red(), "failed".red()),
            StageState::Skipped => ("-".dimmed(), "skipped".dimmed()),
            StageState::Running => ("…".yellow(), "running".yellow()),
            StageState::Pending => ("·".dimmed(), "pending".dimmed()),
        };
        let duration = stage
            .duration_ms()
            .map(|ms| format!(" ({} ms)", ms))
            .unwrap_or_default();
        println!("  {} {:<12} {}{}", marker, stage.name, state, duration.dimmed());
        if let Some(error) = &stage.error {
            println!("      {}", error.red());
        }
        if let Some(reason) = &stage.skip_reason {
            println!("      {}", reason.dimmed());
        }
        for failure in &stage.hook_failures {
            println!("      {}", failure.yellow());
        }
    }
    for failure in &report.hook_failures {
        println!("  {} {}", "!".yellow(), failure.yellow());
    }
    if let Some(error) = &report.notification_error {
        println!("  {} notification not sent: {}", "!".yellow(), error.yellow());
    }
    println!();

    if report.succeeded() {
        println!(
            "{}",
            format!("✓ Build #{} succeeded", run.build_number)
                .green()
                .bold()
        );
    } else {
        println!(
            "{}",
            format!("✗ Build #{} failed", run.build_number).red().bold()
        );
        if let Some(failure) = &run.failure {
            println!("  {}", failure);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::domain::run::RunStatus;

    fn config(dir: &Path) -> Config {
        let mut config = Config::new(dir.join("ws"), dir.join("state"));
        config.container_tool = "conveyor-missing-container-tool".to_string();
        config
    }

    fn write_pipeline(dir: &Path, environment: &str) -> std::path::PathBuf {
        let path = dir.join("pipeline.lua");
        let source = format!(
            r#"
            return {{
                name = "svc",
                environment = {{ {} }},
                stages = {{ {{ name = "Build", steps = {{ step.exec {{ cmd = "true" }} }} }} }},
            }}
            "#,
            environment
        );
        std::fs::write(&path, source).unwrap();
        path
    }

    #[tokio::test]
    async fn test_bad_environment_claims_no_build() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let pipeline = write_pipeline(dir.path(), r#"IMAGE = "app:${NO_SUCH_TAG}""#);

        let err = run_pipeline(&config, Some(&pipeline), Vec::new(), None)
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("undefined variable 'NO_SUCH_TAG'"));

        assert!(!config.workspace_base.exists());
        let state = StateDir::new(&config.state_dir);
        assert_eq!(state.claim_build_number().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_workspace_failure_still_writes_report() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        std::fs::write(&config.workspace_base, "not a directory").unwrap();
        let pipeline = write_pipeline(dir.path(), "");

        run_pipeline(&config, Some(&pipeline), Vec::new(), None)
            .await
            .unwrap();

        let report = StateDir::new(&config.state_dir).read_report(1).unwrap();
        assert_eq!(report.run.status, RunStatus::Failed);
        assert!(
            report
                .run
                .failure
                .as_deref()
                .unwrap()
                .starts_with("Run setup failed")
        );
        assert_eq!(report.stages[0].state, StageState::Skipped);
    }
}
