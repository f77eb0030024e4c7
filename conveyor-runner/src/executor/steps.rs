//! Step execution
//!
//! Every step is templated against the run environment first; a reference to
//! an undefined variable fails the step before anything runs.

use conveyor_core::domain::deploy::{DeployTarget, PreDeployGate};
use conveyor_core::domain::pipeline::{
    ArchiveStep, ContainerBuildStep, ContainerPushStep, ContainerRunStep, DeployStep, ExecStep,
    Step,
};
use conveyor_core::domain::run::PipelineRun;
use conveyor_core::{PipelineError, Result};
use std::io::ErrorKind;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::PipelineExecutor;
use crate::command::{CommandOutput, CommandSpec};
use crate::context::{RunContext, ensure_relative};
use crate::podman::{CONTAINER_WORKSPACE, ContainerTool};
use crate::service::{ApprovalOutcome, ApprovalRequest, Masker};

/// Registry used when neither the step nor the image names one
const DEFAULT_REGISTRY: &str = "docker.io";

impl PipelineExecutor {
    pub(super) async fn run_step(
        &self,
        step: &Step,
        run: &PipelineRun,
        context: &RunContext,
    ) -> Result<()> {
        match step {
            Step::Exec(exec) => self.exec(exec, context).await,
            Step::ContainerBuild(build) => self.container_build(build, context).await,
            Step::ContainerPush(push) => self.container_push(push, context).await,
            Step::ContainerRun(container) => self.container_run(container, context).await,
            Step::Deploy(deploy) => self.deploy(deploy, run, context).await,
            Step::Archive(archive) => archive_files(archive, context).await,
            Step::CleanWorkspace => clean_workspace(context).await,
        }
    }

    /// Runs a command, logging masked output; a non-zero exit is `CommandFailed`
    async fn run_checked(
        &self,
        spec: &CommandSpec,
        context: &RunContext,
        masker: &Masker,
    ) -> Result<CommandOutput> {
        let command = masker.mask(&spec.display());
        context.log_info(format!("$ {}", command));

        // Enforced here as well so every runner honors the limit
        let result = match spec.timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.runner.run(spec))
                .await
                .unwrap_or_else(|_| {
                    Err(PipelineError::CommandTimedOut {
                        command: command.clone(),
                        timeout,
                    })
                }),
            None => self.runner.run(spec).await,
        };
        let output = result.map_err(|e| match e {
            PipelineError::CommandTimedOut { timeout, .. } => PipelineError::CommandTimedOut {
                command: command.clone(),
                timeout,
            },
            other => other,
        })?;

        for line in output.stdout.lines() {
            context.log_info(masker.mask(line));
        }
        for line in output.stderr.lines() {
            context.log_warning(masker.mask(line));
        }

        if !output.success() {
            return Err(PipelineError::CommandFailed {
                command,
                exit_code: output.exit_code,
            });
        }

        Ok(output)
    }

    async fn exec(&self, step: &ExecStep, context: &RunContext) -> Result<()> {
        let mut env = context.env().clone();
        for (key, value) in &step.env {
            env.insert(key.clone(), context.expand(value)?);
        }

        let cwd = match &step.cwd {
            Some(cwd) => context.workspace_path(cwd)?,
            None => context.workspace().to_path_buf(),
        };

        let spec = CommandSpec::new(
            context.expand(&step.program)?,
            context.expand_all(&step.args)?,
        )
        .cwd(cwd)
        .envs(&env)
        .timeout(command_timeout(step.timeout_secs));

        match &step.credential {
            Some(binding) => {
                self.broker
                    .with_credential(binding.credential(), |credential| async move {
                        let spec = spec.secret_env(credential.bind(binding)?);
                        self.run_checked(&spec, context, &credential.masker())
                            .await
                            .map(|_| ())
                    })
                    .await
            }
            None => self
                .run_checked(&spec, context, &Masker::default())
                .await
                .map(|_| ()),
        }
    }

    async fn container_build(&self, step: &ContainerBuildStep, context: &RunContext) -> Result<()> {
        let image = context.expand(&step.image)?;
        let references: Vec<String> = context
            .expand_all(&step.tags)?
            .iter()
            .map(|tag| format!("{}:{}", image, tag))
            .collect();
        let build_context = context.workspace_path(&step.context)?;
        let file = step
            .file
            .as_deref()
            .map(|file| context.workspace_path(file))
            .transpose()?;

        let spec = self
            .containers
            .build(&references, &build_context, file.as_deref())
            .cwd(context.workspace())
            .envs(context.env())
            .timeout(command_timeout(step.timeout_secs));

        self.run_checked(&spec, context, &Masker::default())
            .await
            .map(|_| ())
    }

    /// Logs in with the registry credential, pushes every tag, then logs out
    async fn container_push(&self, step: &ContainerPushStep, context: &RunContext) -> Result<()> {
        let image = context.expand(&step.image)?;
        let tags = context.expand_all(&step.tags)?;
        let registry = match &step.registry {
            Some(registry) => context.expand(registry)?,
            None => ContainerTool::registry_of(&image)
                .unwrap_or_else(|| DEFAULT_REGISTRY.to_string()),
        };
        let timeout = command_timeout(step.timeout_secs);

        self.broker
            .with_credential(&step.credential, |credential| async move {
                let (username, password) = credential.username_password()?;
                let masker = credential.masker();

                let login = self
                    .containers
                    .login(&registry, username, password)
                    .timeout(timeout);
                self.run_checked(&login, context, &masker).await?;

                let mut result = Ok(());
                for tag in &tags {
                    let push = self
                        .containers
                        .push(&format!("{}:{}", image, tag))
                        .timeout(timeout);
                    if let Err(e) = self.run_checked(&push, context, &masker).await {
                        result = Err(e);
                        break;
                    }
                }

                let logout = self.containers.logout(&registry).timeout(timeout);
                if let Err(e) = self.run_checked(&logout, context, &masker).await {
                    warn!("Logout from {} failed: {}", registry, e);
                    context.log_warning(format!("Logout from {} failed: {}", registry, e));
                }

                result
            })
            .await
    }

    async fn container_run(&self, step: &ContainerRunStep, context: &RunContext) -> Result<()> {
        let image = context.expand(&step.image)?;
        let program = context.expand(&step.program)?;
        let args = context.expand_all(&step.args)?;

        let mut env = context.env().clone();
        env.insert("WORKSPACE".to_string(), CONTAINER_WORKSPACE.to_string());

        let spec = self
            .containers
            .run(&image, context.workspace(), &env, &program, &args)
            .cwd(context.workspace())
            .timeout(command_timeout(step.timeout_secs));

        self.run_checked(&spec, context, &Masker::default())
            .await
            .map(|_| ())
    }

    /// Invokes `script <environment> <image>`, behind the approval gate when
    /// the target requires it
    async fn deploy(&self, step: &DeployStep, run: &PipelineRun, context: &RunContext) -> Result<()> {
        let raw = run.parameters.get(&step.parameter).ok_or_else(|| {
            PipelineError::invalid_parameter(&step.parameter, "required by the deploy step")
        })?;
        let target: DeployTarget = raw.to_string().parse()?;
        let image = context.expand(&step.image)?;
        let script = context.expand(&step.script)?;
        let stage = run
            .current_stage
            .clone()
            .unwrap_or_else(|| "deploy".to_string());

        match target.pre_deploy_gate() {
            PreDeployGate::Direct => {
                debug!("{} deploys without approval", target);
            }
            PreDeployGate::RequiresApproval => {
                context.log_info(format!(
                    "Waiting for approval to deploy {} to {}",
                    image, target
                ));

                let request = ApprovalRequest {
                    run_id: run.id,
                    build_number: run.build_number,
                    stage: stage.clone(),
                    environment: target,
                    image: image.clone(),
                };

                match self.approvals.await_approval(&request).await? {
                    ApprovalOutcome::Approved { by } => {
                        context.log_info(format!(
                            "Deployment to {} approved by {}",
                            target,
                            by.as_deref().unwrap_or("unknown")
                        ));
                    }
                    ApprovalOutcome::Rejected { by, reason } => {
                        let by = by.as_deref().unwrap_or("unknown");
                        return Err(PipelineError::ApprovalRejected {
                            stage,
                            reason: match reason {
                                Some(reason) => format!("{} (by {})", reason, by),
                                None => format!("rejected by {}", by),
                            },
                        });
                    }
                    ApprovalOutcome::TimedOut => {
                        return Err(PipelineError::ApprovalTimedOut {
                            stage,
                            timeout: self.approvals.timeout(),
                        });
                    }
                }
            }
        }

        let spec = CommandSpec::new(script, [target.as_str().to_string(), image])
            .cwd(context.workspace())
            .envs(context.env())
            .timeout(command_timeout(step.timeout_secs));

        self.run_checked(&spec, context, &Masker::default())
            .await
            .map(|_| ())
    }
}

fn command_timeout(secs: Option<u64>) -> Option<Duration> {
    secs.map(Duration::from_secs)
}

/// Copies workspace files matching the pattern into the artifact directory,
/// keeping their relative paths
async fn archive_files(step: &ArchiveStep, context: &RunContext) -> Result<()> {
    let pattern = context.expand(&step.pattern)?;
    ensure_relative(&pattern)?;

    let workspace = context.workspace();
    let full = format!(
        "{}/{}",
        glob::Pattern::escape(&workspace.to_string_lossy()),
        pattern
    );
    let paths = glob::glob(&full).map_err(|e| {
        PipelineError::InvalidDefinition(format!("invalid archive pattern '{}': {}", pattern, e))
    })?;

    let mut archived = 0usize;
    for entry in paths {
        let path = match entry {
            Ok(path) => path,
            Err(e) => {
                context.log_warning(format!("Skipping unreadable path: {}", e));
                continue;
            }
        };
        if !path.is_file() {
            continue;
        }

        let relative = path.strip_prefix(workspace).unwrap_or(path.as_path());
        let destination = context.artifacts_dir().join(relative);
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&path, &destination).await?;
        archived += 1;
    }

    if archived == 0 && !step.allow_empty {
        return Err(PipelineError::NothingToArchive(pattern));
    }

    context.log_info(format!(
        "Archived {} file(s) matching '{}'",
        archived, pattern
    ));
    Ok(())
}

/// Removes the run workspace; removing it twice is not an error
async fn clean_workspace(context: &RunContext) -> Result<()> {
    let workspace = context.workspace();
    match tokio::fs::remove_dir_all(workspace).await {
        Ok(()) => {
            info!("Removed workspace {}", workspace.display());
            context.log_info(format!("Removed workspace {}", workspace.display()));
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            context.log_debug(format!("Workspace {} already removed", workspace.display()));
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
