//! Runtime parameters
//!
//! Pipelines declare their parameters (name, type, default). At trigger time
//! the raw `KEY=value` strings supplied by the caller are merged with those
//! defaults into an immutable [`ResolvedParameters`] set.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::error::{PipelineError, Result};

/// Type of a declared parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ParameterKind {
    String,
    Boolean,
    Choice { options: Vec<String> },
}

/// A resolved parameter value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Boolean(bool),
    String(String),
}

impl ParameterValue {
    /// Truthiness used by stage guards
    pub fn is_true(&self) -> bool {
        match self {
            ParameterValue::Boolean(b) => *b,
            ParameterValue::String(s) => parse_bool(s).unwrap_or(false),
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Boolean(b) => write!(f, "{}", b),
            ParameterValue::String(s) => f.write_str(s),
        }
    }
}

/// A parameter declared by a pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterDefinition {
    pub name: String,
    #[serde(flatten)]
    pub kind: ParameterKind,
    pub description: Option<String>,
    pub default: Option<ParameterValue>,
}

impl ParameterDefinition {
    pub fn string(name: impl Into<String>, default: Option<&str>) -> Self {
        Self {
            name: name.into(),
            kind: ParameterKind::String,
            description: None,
            default: default.map(|d| ParameterValue::String(d.to_string())),
        }
    }

    pub fn boolean(name: impl Into<String>, default: Option<bool>) -> Self {
        Self {
            name: name.into(),
            kind: ParameterKind::Boolean,
            description: None,
            default: default.map(ParameterValue::Boolean),
        }
    }

    pub fn choice(name: impl Into<String>, options: &[&str], default: Option<&str>) -> Self {
        Self {
            name: name.into(),
            kind: ParameterKind::Choice {
                options: options.iter().map(|o| o.to_string()).collect(),
            },
            description: None,
            default: default.map(|d| ParameterValue::String(d.to_string())),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// The deployment parameter set: ENVIRONMENT, RUN_TESTS, DEPLOY
    pub fn standard_set() -> Vec<ParameterDefinition> {
        vec![
            ParameterDefinition::choice(
                "ENVIRONMENT",
                &["development", "staging", "production"],
                Some("staging"),
            )
            .with_description("Target environment"),
            ParameterDefinition::boolean("RUN_TESTS", Some(true))
                .with_description("Run the test suite"),
            ParameterDefinition::boolean("DEPLOY", Some(true))
                .with_description("Deploy after publishing"),
        ]
    }

    /// Converts a raw string into a value of this parameter's type
    pub fn coerce(&self, raw: &str) -> Result<ParameterValue> {
        match &self.kind {
            ParameterKind::String => Ok(ParameterValue::String(raw.to_string())),
            ParameterKind::Boolean => parse_bool(raw).map(ParameterValue::Boolean).ok_or_else(|| {
                PipelineError::invalid_parameter(
                    &self.name,
                    format!("'{}' is not a boolean", raw),
                )
            }),
            ParameterKind::Choice { options } => {
                if options.iter().any(|option| option == raw) {
                    Ok(ParameterValue::String(raw.to_string()))
                } else {
                    Err(PipelineError::invalid_parameter(
                        &self.name,
                        format!("'{}' is not one of [{}]", raw, options.join(", ")),
                    ))
                }
            }
        }
    }

    /// Checks that the declaration itself is consistent
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(PipelineError::InvalidDefinition(
                "parameter name cannot be empty".to_string(),
            ));
        }

        if let ParameterKind::Choice { options } = &self.kind {
            if options.is_empty() {
                return Err(PipelineError::InvalidDefinition(format!(
                    "choice parameter '{}' declares no options",
                    self.name
                )));
            }
        }

        match &self.default {
            None => Ok(()),
            Some(ParameterValue::Boolean(_)) if self.kind == ParameterKind::Boolean => Ok(()),
            Some(ParameterValue::Boolean(b)) => Err(PipelineError::InvalidDefinition(format!(
                "parameter '{}' has boolean default {} but is not boolean",
                self.name, b
            ))),
            Some(ParameterValue::String(s)) => self.coerce(s).map(|_| ()).map_err(|e| {
                PipelineError::InvalidDefinition(format!("default of {}", e))
            }),
        }
    }
}

/// Fully resolved, read-only parameter set for one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResolvedParameters {
    values: BTreeMap<String, ParameterValue>,
}

impl ResolvedParameters {
    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.values.get(name)
    }

    /// Whether the named parameter is present and true
    pub fn flag(&self, name: &str) -> bool {
        self.get(name).is_some_and(ParameterValue::is_true)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParameterValue)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// String view used to export parameters as environment variables
    pub fn to_env(&self) -> BTreeMap<String, String> {
        self.values
            .iter()
            .map(|(name, value)| (name.clone(), value.to_string()))
            .collect()
    }
}

/// Merges raw parameters with the declared defaults
///
/// # Errors
/// Returns [`PipelineError::InvalidParameter`] if:
/// - A supplied name is not declared by the pipeline
/// - A supplied value does not fit the declared type or enumeration
/// - A parameter without default is not supplied
pub fn resolve_parameters(
    definitions: &[ParameterDefinition],
    raw: &HashMap<String, String>,
) -> Result<ResolvedParameters> {
    if let Some(unknown) = raw
        .keys()
        .find(|name| !definitions.iter().any(|d| &d.name == *name))
    {
        return Err(PipelineError::invalid_parameter(
            unknown.as_str(),
            "not declared by the pipeline",
        ));
    }

    let mut values = BTreeMap::new();

    for definition in definitions {
        let value = match (raw.get(&definition.name), &definition.default) {
            (Some(supplied), _) => definition.coerce(supplied.trim())?,
            (None, Some(default)) => default.clone(),
            (None, None) => {
                return Err(PipelineError::invalid_parameter(
                    &definition.name,
                    "required but not supplied",
                ));
            }
        };
        values.insert(definition.name.clone(), value);
    }

    Ok(ResolvedParameters { values })
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => Some(true),
        "false" | "no" | "0" | "off" => Some(false),
        _ => None,
    }
}
