//! Pipeline domain types
//!
//! A [`PipelineDefinition`] is a shared, immutable template: an ordered list of
//! stages, each with a guard, a body of steps and outcome-indexed post hooks.
//! Runs never modify it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::domain::credential::CredentialBinding;
use crate::domain::parameter::{ParameterDefinition, ResolvedParameters};
use crate::error::{PipelineError, Result};

/// Pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    pub description: Option<String>,
    pub inputs: Vec<ParameterDefinition>,
    /// Extra variables exported to every step, templated against parameters
    pub environment: BTreeMap<String, String>,
    pub stages: Vec<Stage>,
    pub post: PostHooks,
}

impl PipelineDefinition {
    /// Checks structural invariants that the parser can not express in types
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(PipelineError::InvalidDefinition(
                "pipeline name cannot be empty".to_string(),
            ));
        }

        if self.stages.is_empty() {
            return Err(PipelineError::InvalidDefinition(
                "pipeline must have at least one stage".to_string(),
            ));
        }

        for (idx, stage) in self.stages.iter().enumerate() {
            if stage.name.trim().is_empty() {
                return Err(PipelineError::InvalidDefinition(format!(
                    "stage {} has an empty name",
                    idx + 1
                )));
            }
            if self.stages[..idx].iter().any(|s| s.name == stage.name) {
                return Err(PipelineError::InvalidDefinition(format!(
                    "duplicate stage name '{}'",
                    stage.name
                )));
            }
            if stage.timeout_secs == Some(0) {
                return Err(PipelineError::InvalidDefinition(format!(
                    "stage '{}' timeout must be greater than zero",
                    stage.name
                )));
            }

            let hooks = stage
                .post
                .success
                .iter()
                .chain(&stage.post.failure)
                .chain(&stage.post.always);
            for step in stage.steps.iter().chain(hooks) {
                if step.timeout() == Some(Duration::ZERO) {
                    return Err(PipelineError::InvalidDefinition(format!(
                        "step '{}' in stage '{}' has a zero timeout",
                        step.label(),
                        stage.name
                    )));
                }
            }
        }

        for input in &self.inputs {
            input.validate()?;
        }

        Ok(())
    }

    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == name)
    }
}

/// A named, ordered unit of pipeline work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub guard: Guard,
    pub timeout_secs: Option<u64>,
    pub steps: Vec<Step>,
    pub post: PostHooks,
}

impl Stage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            guard: Guard::Always,
            timeout_secs: None,
            steps: Vec::new(),
            post: PostHooks::default(),
        }
    }

    pub fn when(mut self, guard: Guard) -> Self {
        self.guard = guard;
        self
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn on(mut self, hook: HookKind, step: Step) -> Self {
        self.post.hook_mut(hook).push(step);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Predicate deciding whether a stage runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Guard {
    Always,
    /// The named parameter is true
    Param { name: String },
    /// The named parameter renders to exactly `value`
    Equals { name: String, value: String },
    Not { guard: Box<Guard> },
    All { guards: Vec<Guard> },
    Any { guards: Vec<Guard> },
}

impl Guard {
    pub fn param(name: impl Into<String>) -> Self {
        Guard::Param { name: name.into() }
    }

    pub fn equals(name: impl Into<String>, value: impl Into<String>) -> Self {
        Guard::Equals {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn negate(guard: Guard) -> Self {
        Guard::Not {
            guard: Box::new(guard),
        }
    }

    /// Evaluates the guard; a missing parameter never matches
    pub fn evaluate(&self, parameters: &ResolvedParameters) -> bool {
        match self {
            Guard::Always => true,
            Guard::Param { name } => parameters.flag(name),
            Guard::Equals { name, value } => parameters
                .get(name)
                .is_some_and(|actual| actual.to_string() == *value),
            Guard::Not { guard } => !guard.evaluate(parameters),
            Guard::All { guards } => guards.iter().all(|g| g.evaluate(parameters)),
            Guard::Any { guards } => guards.iter().any(|g| g.evaluate(parameters)),
        }
    }
}

impl fmt::Display for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |f: &mut fmt::Formatter<'_>, guards: &[Guard], op: &str| {
            write!(f, "(")?;
            for (idx, guard) in guards.iter().enumerate() {
                if idx > 0 {
                    write!(f, " {} ", op)?;
                }
                write!(f, "{}", guard)?;
            }
            write!(f, ")")
        };

        match self {
            Guard::Always => write!(f, "always"),
            Guard::Param { name } => write!(f, "{}", name),
            Guard::Equals { name, value } => write!(f, "{} == {}", name, value),
            Guard::Not { guard } => write!(f, "not {}", guard),
            Guard::All { guards } => join(f, guards, "and"),
            Guard::Any { guards } => join(f, guards, "or"),
        }
    }
}

/// Outcome a post hook is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookKind {
    Success,
    Failure,
    Always,
}

/// Outcome-indexed table of follow-up steps
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostHooks {
    #[serde(default)]
    pub success: Vec<Step>,
    #[serde(default)]
    pub failure: Vec<Step>,
    #[serde(default)]
    pub always: Vec<Step>,
}

impl PostHooks {
    pub fn hook(&self, kind: HookKind) -> &[Step] {
        match kind {
            HookKind::Success => &self.success,
            HookKind::Failure => &self.failure,
            HookKind::Always => &self.always,
        }
    }

    pub fn hook_mut(&mut self, kind: HookKind) -> &mut Vec<Step> {
        match kind {
            HookKind::Success => &mut self.success,
            HookKind::Failure => &mut self.failure,
            HookKind::Always => &mut self.always,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.success.is_empty() && self.failure.is_empty() && self.always.is_empty()
    }
}

/// A single unit of work inside a stage body or hook
///
/// Every string field supports `${NAME}` templating against the run
/// environment. Arguments are always passed as vectors, never through a shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Step {
    Exec(ExecStep),
    ContainerBuild(ContainerBuildStep),
    ContainerPush(ContainerPushStep),
    ContainerRun(ContainerRunStep),
    Deploy(DeployStep),
    Archive(ArchiveStep),
    CleanWorkspace,
}

impl Step {
    pub fn exec(program: impl Into<String>, args: &[&str]) -> Self {
        Step::Exec(ExecStep {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            cwd: None,
            env: BTreeMap::new(),
            credential: None,
            timeout_secs: None,
        })
    }

    /// Limit on each external command the step runs
    pub fn timeout(&self) -> Option<Duration> {
        let secs = match self {
            Step::Exec(exec) => exec.timeout_secs,
            Step::ContainerBuild(build) => build.timeout_secs,
            Step::ContainerPush(push) => push.timeout_secs,
            Step::ContainerRun(run) => run.timeout_secs,
            Step::Deploy(deploy) => deploy.timeout_secs,
            Step::Archive(_) | Step::CleanWorkspace => None,
        };
        secs.map(Duration::from_secs)
    }

    /// Short label for logs
    pub fn label(&self) -> String {
        match self {
            Step::Exec(exec) => format!("exec {}", exec.program),
            Step::ContainerBuild(build) => format!("container build {}", build.image),
            Step::ContainerPush(push) => format!("container push {}", push.image),
            Step::ContainerRun(run) => format!("container run {} {}", run.image, run.program),
            Step::Deploy(deploy) => format!("deploy {}", deploy.script),
            Step::Archive(archive) => format!("archive {}", archive.pattern),
            Step::CleanWorkspace => "clean workspace".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecStep {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory relative to the workspace
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub credential: Option<CredentialBinding>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerBuildStep {
    pub image: String,
    pub tags: Vec<String>,
    /// Build context relative to the workspace
    pub context: String,
    pub file: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerPushStep {
    pub image: String,
    pub tags: Vec<String>,
    /// Username/password credential used to log into the registry
    pub credential: String,
    /// Registry host; derived from the image reference when absent
    pub registry: Option<String>,
    /// Applies to the login and to every push
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRunStep {
    pub image: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployStep {
    /// Deployment script, invoked as `script <environment> <image>`
    pub script: String,
    pub image: String,
    /// Parameter holding the target environment
    pub parameter: String,
    /// Applies to the script only, not to the approval wait
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveStep {
    /// Glob relative to the workspace
    pub pattern: String,
    pub allow_empty: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::parameter::resolve_parameters;
    use std::collections::HashMap;

    fn params(pairs: &[(&str, &str)]) -> ResolvedParameters {
        let raw: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        resolve_parameters(&ParameterDefinition::standard_set(), &raw).unwrap()
    }

    fn definition(stages: Vec<Stage>) -> PipelineDefinition {
        PipelineDefinition {
            name: "app".to_string(),
            description: None,
            inputs: ParameterDefinition::standard_set(),
            environment: BTreeMap::new(),
            stages,
            post: PostHooks::default(),
        }
    }

    #[test]
    fn test_guard_display() {
        let guard = Guard::All {
            guards: vec![
                Guard::param("DEPLOY"),
                Guard::negate(Guard::equals("ENVIRONMENT", "development")),
            ],
        };
        assert_eq!(guard.to_string(), "(DEPLOY and not ENVIRONMENT == development)");
    }

    #[test]
    fn test_param_guard() {
        let guard = Guard::param("RUN_TESTS");
        assert!(guard.evaluate(&params(&[])));
        assert!(!guard.evaluate(&params(&[("RUN_TESTS", "false")])));
        assert!(!Guard::param("UNKNOWN").evaluate(&params(&[])));
    }

    #[test]
    fn test_equals_and_composite_guards() {
        let prod = Guard::equals("ENVIRONMENT", "production");
        assert!(!prod.evaluate(&params(&[])));
        assert!(prod.evaluate(&params(&[("ENVIRONMENT", "production")])));

        let deploy_outside_prod = Guard::All {
            guards: vec![Guard::param("DEPLOY"), Guard::negate(prod.clone())],
        };
        assert!(deploy_outside_prod.evaluate(&params(&[])));
        assert!(!deploy_outside_prod.evaluate(&params(&[("ENVIRONMENT", "production")])));

        let either = Guard::Any {
            guards: vec![prod, Guard::param("RUN_TESTS")],
        };
        assert!(either.evaluate(&params(&[])));
        assert!(!either.evaluate(&params(&[("RUN_TESTS", "false")])));
    }

    #[test]
    fn test_stage_builder_post_hooks() {
        let stage = Stage::new("Test")
            .when(Guard::param("RUN_TESTS"))
            .step(Step::exec("./run_tests.sh", &[]))
            .on(HookKind::Always, Step::CleanWorkspace);
        assert_eq!(stage.steps.len(), 1);
        assert_eq!(stage.post.hook(HookKind::Always), &[Step::CleanWorkspace]);
        assert!(stage.post.hook(HookKind::Failure).is_empty());
    }

    #[test]
    fn test_validate_rejects_duplicate_stage_names() {
        let def = definition(vec![Stage::new("Build"), Stage::new("Build")]);
        assert!(def.validate().unwrap_err().to_string().contains("duplicate"));
    }

    #[test]
    fn test_validate_rejects_empty_pipeline() {
        let def = definition(vec![]);
        assert!(def.validate().is_err());
        assert!(definition(vec![Stage::new("Build")]).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_timeouts() {
        let mut stage = Stage::new("Deploy");
        stage.timeout_secs = Some(0);
        let err = definition(vec![stage]).validate().unwrap_err();
        assert!(matches!(err, PipelineError::InvalidDefinition(_)));
        assert!(err.to_string().contains("greater than zero"));

        let step = Step::Exec(ExecStep {
            program: "make".to_string(),
            args: vec![],
            cwd: None,
            env: BTreeMap::new(),
            credential: None,
            timeout_secs: Some(0),
        });
        let err = definition(vec![Stage::new("Build").on(HookKind::Always, step)])
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("zero timeout"));
    }

    #[test]
    fn test_step_timeout() {
        let mut step = ExecStep {
            program: "make".to_string(),
            args: vec![],
            cwd: None,
            env: BTreeMap::new(),
            credential: None,
            timeout_secs: None,
        };
        assert_eq!(Step::Exec(step.clone()).timeout(), None);
        step.timeout_secs = Some(90);
        assert_eq!(Step::Exec(step).timeout(), Some(Duration::from_secs(90)));
        assert_eq!(Step::CleanWorkspace.timeout(), None);
    }

    #[test]
    fn test_step_serializes_with_kind_tag() {
        let json = serde_json::to_value(Step::exec("make", &["build"])).unwrap();
        assert_eq!(json["kind"], "exec");
        assert_eq!(json["program"], "make");
        let clean = serde_json::to_value(Step::CleanWorkspace).unwrap();
        assert_eq!(clean["kind"], "clean_workspace");
    }
}
