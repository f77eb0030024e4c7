//! Variable templating for step arguments
//!
//! Steps reference run variables as `$NAME` or `${NAME}`. Expansion is applied
//! to each argument on its own and never goes through a shell, so a value can
//! not smuggle extra arguments into a command.

use std::collections::BTreeMap;

use crate::error::{PipelineError, Result};

struct Undefined;

/// Expand `$NAME` / `${NAME}` references in `input` against `vars`
///
/// Fails with [`PipelineError::UndefinedVariable`] when a referenced name is
/// not present.
pub fn expand(input: &str, vars: &BTreeMap<String, String>) -> Result<String> {
    shellexpand::env_with_context(input, |name: &str| -> std::result::Result<Option<&String>, Undefined> {
        vars.get(name).map(Some).ok_or(Undefined)
    })
    .map(|expanded| expanded.into_owned())
    .map_err(|e| PipelineError::UndefinedVariable(e.var_name))
}

/// Expand every element of `inputs`
pub fn expand_all(inputs: &[String], vars: &BTreeMap<String, String>) -> Result<Vec<String>> {
    inputs.iter().map(|input| expand(input, vars)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        vars.insert("IMAGE_NAME".to_string(), "registry.local/app".to_string());
        vars.insert("BUILD_NUMBER".to_string(), "42".to_string());
        vars.insert("ENVIRONMENT".to_string(), "staging; rm -rf /".to_string());
        vars
    }

    #[test]
    fn test_expand_braced_and_bare() {
        let out = expand("${IMAGE_NAME}:$BUILD_NUMBER", &vars()).unwrap();
        assert_eq!(out, "registry.local/app:42");
    }

    #[test]
    fn test_expand_plain_text_untouched() {
        assert_eq!(expand("./deploy.sh", &vars()).unwrap(), "./deploy.sh");
    }

    #[test]
    fn test_expand_undefined_variable() {
        let err = expand("${MISSING}", &vars()).unwrap_err();
        assert!(matches!(err, PipelineError::UndefinedVariable(ref name) if name == "MISSING"));
    }

    #[test]
    fn test_expanded_value_stays_one_argument() {
        let args = expand_all(&["${ENVIRONMENT}".to_string()], &vars()).unwrap();
        assert_eq!(args, vec!["staging; rm -rf /".to_string()]);
    }
}
