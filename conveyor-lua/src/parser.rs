//! Pipeline definition parser
//!
//! Evaluates a Lua pipeline file in the sandbox and converts the returned
//! table into an immutable [`PipelineDefinition`]. Guards and steps are data,
//! not Lua functions, so the parsed definition outlives the Lua state.

use anyhow::{Context, Result};
use conveyor_core::domain::credential::CredentialBinding;
use conveyor_core::domain::parameter::{ParameterDefinition, ParameterKind, ParameterValue};
use conveyor_core::domain::pipeline::{
    ArchiveStep, ContainerBuildStep, ContainerPushStep, ContainerRunStep, DeployStep, ExecStep,
    Guard, PipelineDefinition, PostHooks, Stage, Step,
};
use mlua::{Table, Value};
use std::collections::BTreeMap;

use crate::sandbox::create_sandbox;

/// Parse a pipeline definition from Lua source code
///
/// # Errors
/// Returns an error if:
/// - The Lua source is invalid or does not return a table
/// - Required fields are missing (name, stages, step fields)
/// - Field types are incorrect
/// - The resulting definition violates structural invariants
///
/// # Example
/// ```no_run
/// use conveyor_lua::parse_pipeline;
///
/// let source = r#"
///     return pipeline.define {
///         name = "app",
///         inputs = {
///             RUN_TESTS = { type = "boolean", default = true },
///         },
///         stages = {
///             { name = "Build", steps = { step.exec { cmd = "make" } } },
///             {
///                 name = "Test",
///                 when = when.param("RUN_TESTS"),
///                 steps = { step.exec { cmd = "make", args = { "test" } } },
///             },
///         },
///     }
/// "#;
///
/// let definition = parse_pipeline(source)?;
/// assert_eq!(definition.stages.len(), 2);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn parse_pipeline(source: &str) -> Result<PipelineDefinition> {
    let lua = create_sandbox().context("Failed to create definition sandbox")?;

    let pipeline: Table = lua
        .load(source)
        .set_name("pipeline")
        .eval()
        .context("Failed to evaluate pipeline definition")?;

    let name: String = pipeline
        .get("name")
        .context("Pipeline must have a 'name' field")?;

    let description: Option<String> = pipeline
        .get("description")
        .context("Field 'description' must be a string")?;

    let inputs = parse_inputs(&pipeline)?;
    let environment = parse_environment(&pipeline)?;
    let stages = parse_stages(&pipeline)?;
    let post = parse_post(&pipeline.get::<Value>("post")?, "pipeline")?;

    let definition = PipelineDefinition {
        name,
        description,
        inputs,
        environment,
        stages,
        post,
    };

    definition.validate()?;

    Ok(definition)
}

/// Parse the 'inputs' field into parameter definitions, sorted by name
fn parse_inputs(pipeline: &Table) -> Result<Vec<ParameterDefinition>> {
    let inputs_value: Value = pipeline.get("inputs")?;

    let table = match inputs_value {
        Value::Nil => return Ok(Vec::new()),
        Value::Table(table) => table,
        _ => anyhow::bail!("Field 'inputs' must be a table of input definitions"),
    };

    let mut inputs = Vec::new();

    for pair in table.pairs::<String, Table>() {
        let (key, input_table) = pair.context("Failed to read input entry")?;

        let input_type: String = input_table
            .get("type")
            .with_context(|| format!("Input '{}' must have a 'type' field", key))?;

        let kind = match input_type.as_str() {
            "string" => ParameterKind::String,
            "boolean" => ParameterKind::Boolean,
            "choice" => {
                let options: Vec<String> = input_table
                    .get::<Option<Vec<String>>>("options")
                    .with_context(|| format!("Input '{}' options must be an array", key))?
                    .with_context(|| format!("Choice input '{}' must list 'options'", key))?;
                ParameterKind::Choice { options }
            }
            other => anyhow::bail!("Input '{}' has unknown type '{}'", key, other),
        };

        let description: Option<String> = input_table.get("description")?;

        let default = match input_table.get::<Value>("default")? {
            Value::Nil => None,
            Value::Boolean(b) => Some(ParameterValue::Boolean(b)),
            other => Some(ParameterValue::String(scalar_to_string(&other).with_context(
                || format!("Input '{}' has invalid default value type", key),
            )?)),
        };

        inputs.push(ParameterDefinition {
            name: key,
            kind,
            description,
            default,
        });
    }

    inputs.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(inputs)
}

/// Parse the 'environment' field
fn parse_environment(pipeline: &Table) -> Result<BTreeMap<String, String>> {
    let value: Value = pipeline.get("environment")?;

    match value {
        Value::Nil => Ok(BTreeMap::new()),
        Value::Table(table) => {
            let mut environment = BTreeMap::new();
            for pair in table.pairs::<String, Value>() {
                let (key, value) = pair.context("Failed to read environment entry")?;
                let value = scalar_to_string(&value)
                    .with_context(|| format!("Environment entry '{}' must be a scalar", key))?;
                environment.insert(key, value);
            }
            Ok(environment)
        }
        _ => anyhow::bail!("Field 'environment' must be a table of strings"),
    }
}

/// Parse the 'stages' field
fn parse_stages(pipeline: &Table) -> Result<Vec<Stage>> {
    let stages_table: Table = pipeline
        .get("stages")
        .context("Pipeline must have a 'stages' field")?;

    let mut stages = Vec::new();

    for pair in stages_table.sequence_values::<Table>() {
        let stage_table = pair.context("Failed to read stage entry")?;

        let name: String = stage_table
            .get("name")
            .context("Stage must have a 'name' field")?;

        let guard = parse_guard(stage_table.get::<Value>("when")?)
            .with_context(|| format!("Stage '{}' has an invalid 'when' guard", name))?;

        let timeout_secs: Option<u64> = stage_table
            .get("timeout")
            .with_context(|| format!("Stage '{}' timeout must be a number of seconds", name))?;

        let steps_table: Table = stage_table
            .get("steps")
            .with_context(|| format!("Stage '{}' must have a 'steps' list", name))?;
        let steps = parse_steps(&steps_table, &name)?;

        let post = parse_post(&stage_table.get::<Value>("post")?, &name)?;

        stages.push(Stage {
            name,
            guard,
            timeout_secs,
            steps,
            post,
        });
    }

    if stages.is_empty() {
        anyhow::bail!("Pipeline must have at least one stage");
    }

    Ok(stages)
}

/// Parse a guard from a 'when' value
fn parse_guard(value: Value) -> Result<Guard> {
    match value {
        Value::Nil | Value::Boolean(true) => Ok(Guard::Always),
        Value::Boolean(false) => Ok(Guard::negate(Guard::Always)),
        Value::Table(table) => parse_guard_table(&table),
        _ => anyhow::bail!("guard must be a table or boolean"),
    }
}

fn parse_guard_table(table: &Table) -> Result<Guard> {
    if let Some(inner) = table.get::<Option<Table>>("not")? {
        return Ok(Guard::negate(parse_guard_table(&inner)?));
    }

    for combinator in ["all", "any"] {
        if let Some(list) = table.get::<Option<Table>>(combinator)? {
            let mut guards = Vec::new();
            for inner in list.sequence_values::<Table>() {
                guards.push(parse_guard_table(&inner?)?);
            }
            return Ok(if combinator == "all" {
                Guard::All { guards }
            } else {
                Guard::Any { guards }
            });
        }
    }

    if let Some(name) = table.get::<Option<String>>("param")? {
        return match table.get::<Value>("equals")? {
            Value::Nil => Ok(Guard::param(name)),
            value => Ok(Guard::equals(name, scalar_to_string(&value)?)),
        };
    }

    anyhow::bail!("guard must use one of 'param', 'not', 'all' or 'any'")
}

/// Parse the post table of a stage or the pipeline
fn parse_post(value: &Value, owner: &str) -> Result<PostHooks> {
    let table = match value {
        Value::Nil => return Ok(PostHooks::default()),
        Value::Table(table) => table,
        _ => anyhow::bail!("'{}' post must be a table", owner),
    };

    let mut post = PostHooks::default();
    for (hook, slot) in [
        ("success", &mut post.success),
        ("failure", &mut post.failure),
        ("always", &mut post.always),
    ] {
        if let Some(steps) = table.get::<Option<Table>>(hook)? {
            *slot = parse_steps(&steps, &format!("{} post {}", owner, hook))?;
        }
    }

    Ok(post)
}

fn parse_steps(steps_table: &Table, owner: &str) -> Result<Vec<Step>> {
    let mut steps = Vec::new();
    for (idx, pair) in steps_table.sequence_values::<Table>().enumerate() {
        let step_table = pair.with_context(|| format!("'{}' step {} must be a table", owner, idx + 1))?;
        let step = parse_step(&step_table)
            .with_context(|| format!("Invalid step {} in '{}'", idx + 1, owner))?;
        steps.push(step);
    }
    Ok(steps)
}

/// Parse a single step table according to its 'kind'
fn parse_step(table: &Table) -> Result<Step> {
    let kind: String = table
        .get("kind")
        .context("Step must have a 'kind' field")?;

    let step = match kind.as_str() {
        "exec" => Step::Exec(ExecStep {
            program: table.get("cmd").context("exec step requires 'cmd'")?,
            args: table.get::<Option<Vec<String>>>("args")?.unwrap_or_default(),
            cwd: table.get("cwd")?,
            env: table
                .get::<Option<BTreeMap<String, String>>>("env")?
                .unwrap_or_default(),
            credential: match table.get::<Option<Table>>("credential")? {
                Some(binding) => Some(parse_credential_binding(&binding)?),
                None => None,
            },
            timeout_secs: step_timeout(table)?,
        }),
        "container_build" => Step::ContainerBuild(ContainerBuildStep {
            image: table.get("image").context("container_build step requires 'image'")?,
            tags: tags(table)?,
            context: table
                .get::<Option<String>>("context")?
                .unwrap_or_else(|| ".".to_string()),
            file: table.get("file")?,
            timeout_secs: step_timeout(table)?,
        }),
        "container_push" => Step::ContainerPush(ContainerPushStep {
            image: table.get("image").context("container_push step requires 'image'")?,
            tags: tags(table)?,
            credential: table
                .get("credential")
                .context("container_push step requires a registry 'credential'")?,
            registry: table.get("registry")?,
            timeout_secs: step_timeout(table)?,
        }),
        "container_run" => Step::ContainerRun(ContainerRunStep {
            image: table.get("image").context("container_run step requires 'image'")?,
            program: table.get("cmd").context("container_run step requires 'cmd'")?,
            args: table.get::<Option<Vec<String>>>("args")?.unwrap_or_default(),
            timeout_secs: step_timeout(table)?,
        }),
        "deploy" => Step::Deploy(DeployStep {
            script: table.get("script").context("deploy step requires 'script'")?,
            image: table.get("image").context("deploy step requires 'image'")?,
            parameter: table
                .get::<Option<String>>("parameter")?
                .unwrap_or_else(|| "ENVIRONMENT".to_string()),
            timeout_secs: step_timeout(table)?,
        }),
        "archive" => Step::Archive(ArchiveStep {
            pattern: table.get("pattern").context("archive step requires 'pattern'")?,
            allow_empty: table.get::<Option<bool>>("allow_empty")?.unwrap_or(false),
        }),
        "clean_workspace" => Step::CleanWorkspace,
        other => anyhow::bail!("Unknown step kind '{}'", other),
    };

    Ok(step)
}

/// Optional per-command `timeout`, in seconds
fn step_timeout(table: &Table) -> Result<Option<u64>> {
    table
        .get("timeout")
        .context("Step timeout must be a number of seconds")
}

/// Parse `{ id = ..., username = ..., password = ... }` or `{ id = ..., variable = ... }`
fn parse_credential_binding(table: &Table) -> Result<CredentialBinding> {
    let credential: String = table
        .get("id")
        .context("Credential binding requires an 'id'")?;

    if let Some(variable) = table.get::<Option<String>>("variable")? {
        return Ok(CredentialBinding::SecretText {
            credential,
            variable,
        });
    }

    let username_variable: Option<String> = table.get("username")?;
    let password_variable: Option<String> = table.get("password")?;

    match (username_variable, password_variable) {
        (Some(username_variable), Some(password_variable)) => {
            Ok(CredentialBinding::UsernamePassword {
                credential,
                username_variable,
                password_variable,
            })
        }
        _ => anyhow::bail!(
            "Credential binding '{}' needs 'variable' or both 'username' and 'password'",
            credential
        ),
    }
}

fn tags(table: &Table) -> Result<Vec<String>> {
    Ok(table
        .get::<Option<Vec<String>>>("tags")?
        .unwrap_or_else(|| vec!["latest".to_string()]))
}

/// Convert a scalar Lua value to its string form
fn scalar_to_string(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.to_str()?.to_string()),
        Value::Integer(i) => Ok(i.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Boolean(b) => Ok(b.to_string()),
        _ => Err(anyhow::anyhow!("expected a string, number or boolean")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::domain::pipeline::HookKind;

    #[test]
    fn test_parse_minimal_pipeline() {
        let source = r#"
            return {
                name = "Minimal",
                stages = {
                    { name = "stage1", steps = { step.exec { cmd = "true" } } }
                }
            }
        "#;

        let definition = parse_pipeline(source).unwrap();
        assert_eq!(definition.name, "Minimal");
        assert_eq!(definition.description, None);
        assert!(definition.inputs.is_empty());
        assert_eq!(definition.stages.len(), 1);
        assert_eq!(definition.stages[0].guard, Guard::Always);
        assert!(definition.post.is_empty());
    }

    #[test]
    fn test_parse_inputs_sorted_with_defaults() {
        let source = r#"
            return {
                name = "Inputs",
                inputs = {
                    RUN_TESTS = { type = "boolean", default = true },
                    ENVIRONMENT = {
                        type = "choice",
                        options = { "development", "staging", "production" },
                        default = "staging",
                    },
                    RETRIES = { type = "string", default = 3 },
                },
                stages = { { name = "a", steps = {} } },
            }
        "#;

        let definition = parse_pipeline(source).unwrap();
        let names: Vec<&str> = definition.inputs.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["ENVIRONMENT", "RETRIES", "RUN_TESTS"]);
        assert_eq!(
            definition.inputs[1].default,
            Some(ParameterValue::String("3".to_string()))
        );
        assert_eq!(
            definition.inputs[2].default,
            Some(ParameterValue::Boolean(true))
        );
    }

    #[test]
    fn test_parse_choice_default_outside_options() {
        let source = r#"
            return {
                name = "Bad",
                inputs = { ENVIRONMENT = { type = "choice", options = { "staging" }, default = "qa" } },
                stages = { { name = "a", steps = {} } },
            }
        "#;

        assert!(parse_pipeline(source).is_err());
    }

    #[test]
    fn test_parse_guards() {
        let source = r#"
            return {
                name = "Guards",
                stages = {
                    { name = "t", when = when.param("RUN_TESTS"), steps = {} },
                    { name = "p", when = { param = "ENVIRONMENT", equals = "production" }, steps = {} },
                    { name = "n", when = when.negate(when.param("DEPLOY")), steps = {} },
                    { name = "a", when = when.all { when.param("A"), when.param("B") }, steps = {} },
                },
            }
        "#;

        let definition = parse_pipeline(source).unwrap();
        assert_eq!(definition.stages[0].guard, Guard::param("RUN_TESTS"));
        assert_eq!(
            definition.stages[1].guard,
            Guard::equals("ENVIRONMENT", "production")
        );
        assert_eq!(
            definition.stages[2].guard,
            Guard::negate(Guard::param("DEPLOY"))
        );
        assert_eq!(
            definition.stages[3].guard,
            Guard::All {
                guards: vec![Guard::param("A"), Guard::param("B")]
            }
        );
    }

    #[test]
    fn test_parse_steps_and_post() {
        let source = r#"
            return {
                name = "Steps",
                stages = {
                    {
                        name = "Publish",
                        timeout = 600,
                        steps = {
                            step.container_push {
                                image = "${IMAGE_NAME}",
                                tags = { "${BUILD_NUMBER}", "latest" },
                                credential = "registry",
                            },
                            step.exec {
                                cmd = "curl",
                                args = { "-H", "Authorization: Bearer $TOKEN" },
                                credential = { id = "api-token", variable = "TOKEN" },
                            },
                        },
                        post = {
                            failure = { step.exec { cmd = "echo", args = { "publish failed" } } },
                        },
                    },
                },
                post = { always = { step.clean_workspace() } },
            }
        "#;

        let definition = parse_pipeline(source).unwrap();
        let stage = &definition.stages[0];
        assert_eq!(stage.timeout_secs, Some(600));
        assert_eq!(stage.steps.len(), 2);

        match &stage.steps[0] {
            Step::ContainerPush(push) => {
                assert_eq!(push.tags, vec!["${BUILD_NUMBER}", "latest"]);
                assert_eq!(push.credential, "registry");
                assert!(push.registry.is_none());
            }
            other => panic!("unexpected step {:?}", other),
        }

        match &stage.steps[1] {
            Step::Exec(exec) => assert_eq!(
                exec.credential,
                Some(CredentialBinding::SecretText {
                    credential: "api-token".to_string(),
                    variable: "TOKEN".to_string(),
                })
            ),
            other => panic!("unexpected step {:?}", other),
        }

        assert_eq!(stage.post.hook(HookKind::Failure).len(), 1);
        assert_eq!(
            definition.post.hook(HookKind::Always),
            &[Step::CleanWorkspace]
        );
    }

    #[test]
    fn test_parse_step_timeouts() {
        let source = r#"
            return {
                name = "Timeouts",
                stages = {
                    {
                        name = "Deploy",
                        steps = {
                            step.exec { cmd = "make", timeout = 120 },
                            step.deploy { script = "./deploy.sh", image = "app:1", timeout = 900 },
                            step.container_run { image = "app:1", cmd = "./run_tests.sh" },
                        },
                    },
                },
            }
        "#;

        let definition = parse_pipeline(source).unwrap();
        let timeouts: Vec<Option<u64>> = definition.stages[0]
            .steps
            .iter()
            .map(|step| step.timeout().map(|t| t.as_secs()))
            .collect();
        assert_eq!(timeouts, vec![Some(120), Some(900), None]);
    }

    #[test]
    fn test_parse_rejects_zero_timeouts() {
        let stage_zero = r#"
            return {
                name = "ZeroStage",
                stages = { { name = "Deploy", timeout = 0, steps = {} } },
            }
        "#;
        let err = parse_pipeline(stage_zero).unwrap_err();
        assert!(
            err.to_string()
                .contains("stage 'Deploy' timeout must be greater than zero")
        );

        let step_zero = r#"
            return {
                name = "ZeroStep",
                stages = { { name = "Build", steps = { step.exec { cmd = "make", timeout = 0 } } } },
            }
        "#;
        let err = parse_pipeline(step_zero).unwrap_err();
        assert!(err.to_string().contains("zero timeout"));
    }

    #[test]
    fn test_parse_unknown_step_kind() {
        let source = r#"
            return {
                name = "Bad",
                stages = { { name = "a", steps = { { kind = "teleport" } } } },
            }
        "#;

        let err = parse_pipeline(source).unwrap_err();
        assert!(format!("{:#}", err).contains("teleport"));
    }

    #[test]
    fn test_parse_pipeline_missing_name() {
        let source = r#"
            return { stages = { { name = "a", steps = {} } } }
        "#;

        let result = parse_pipeline(source);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("name"));
    }

    #[test]
    fn test_parse_pipeline_empty_stages() {
        let source = r#"
            return { name = "Empty", stages = {} }
        "#;

        let result = parse_pipeline(source);
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("at least one stage")
        );
    }

    #[test]
    fn test_parse_invalid_lua() {
        assert!(parse_pipeline("this is not valid lua!!!").is_err());
        assert!(parse_pipeline(r#"return "not a table""#).is_err());
    }

    #[test]
    fn test_definition_cannot_reach_os() {
        let source = r#"
            os.execute("touch /tmp/pwned")
            return { name = "x", stages = { { name = "a", steps = {} } } }
        "#;

        assert!(parse_pipeline(source).is_err());
    }
}
