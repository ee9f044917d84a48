//! YAML configuration loader with environment variable expansion
//!
//! String values of the form `${ENV_VAR:default}` are expanded before the
//! document is deserialized, so timeouts and limits can be injected by the
//! deployment environment without editing the file.

use crate::OrchestratorError;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_yaml::Value as YamlValue;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

fn env_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\$\{([^:}]+)(?::([^}]*))?\}").ok())
        .as_ref()
}

/// Load a YAML file and expand `${VAR:default}` references in string values
pub fn load_yaml_file<P: AsRef<Path>>(path: P) -> Result<YamlValue, OrchestratorError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|e| {
        OrchestratorError::Config(format!("Failed to read YAML file {:?}: {}", path, e))
    })?;

    let mut value: YamlValue = serde_yaml::from_str(&content).map_err(|e| {
        OrchestratorError::Config(format!("Failed to parse YAML file {:?}: {}", path, e))
    })?;

    expand_variables(&mut value, &|name| std::env::var(name).ok());
    Ok(value)
}

/// Load and deserialize a YAML file into a specific type
pub fn load_yaml_config<T: DeserializeOwned, P: AsRef<Path>>(
    path: P,
) -> Result<T, OrchestratorError> {
    let yaml = load_yaml_file(path)?;
    serde_yaml::from_value(yaml).map_err(|e| {
        OrchestratorError::Config(format!("Failed to deserialize configuration: {}", e))
    })
}

/// Expand variables recursively. Scalars that become numeric after expansion
/// are re-typed so `timeout_ms: ${TIMEOUT:5000}` deserializes into a `u64`.
fn expand_variables(value: &mut YamlValue, lookup: &dyn Fn(&str) -> Option<String>) {
    match value {
        YamlValue::String(s) => {
            if let Some(expanded) = expand_env_in_string(s, lookup) {
                *value = match serde_yaml::from_str::<YamlValue>(&expanded) {
                    Ok(scalar @ (YamlValue::Number(_) | YamlValue::Bool(_))) => scalar,
                    _ => YamlValue::String(expanded),
                };
            }
        }
        YamlValue::Mapping(map) => {
            for (_, v) in map.iter_mut() {
                expand_variables(v, lookup);
            }
        }
        YamlValue::Sequence(seq) => {
            for item in seq.iter_mut() {
                expand_variables(item, lookup);
            }
        }
        _ => {}
    }
}

/// Expand `${ENV_VAR:default_value}` references; `None` when nothing to expand
fn expand_env_in_string(s: &str, lookup: &dyn Fn(&str) -> Option<String>) -> Option<String> {
    if !s.contains("${") {
        return None;
    }

    let expanded = env_pattern()?.replace_all(s, |caps: &regex::Captures<'_>| {
        let default_value = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        lookup(&caps[1]).unwrap_or_else(|| default_value.to_string())
    });

    Some(expanded.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn lookup(name: &str) -> Option<String> {
        match name {
            "TASK_TIMEOUT" => Some("4500".to_string()),
            "TASK_MODE" => Some("fallback".to_string()),
            _ => None,
        }
    }

    #[test]
    fn test_expand_env_in_string() {
        let result = expand_env_in_string("policy=${TASK_MODE}", &lookup);
        assert_eq!(result, Some("policy=fallback".to_string()));
    }

    #[test]
    fn test_expand_env_with_default() {
        let result = expand_env_in_string("${MISSING_VAR:reject}", &lookup);
        assert_eq!(result, Some("reject".to_string()));
        assert_eq!(expand_env_in_string("plain", &lookup), None);
    }

    #[test]
    fn test_expanded_numbers_are_retyped() {
        let mut yaml: YamlValue =
            serde_yaml::from_str("timeout: \"${TASK_TIMEOUT:1000}\"\nname: \"${TASK_MODE}\"")
                .unwrap();
        expand_variables(&mut yaml, &lookup);

        assert_eq!(yaml["timeout"].as_u64(), Some(4500));
        assert_eq!(yaml["name"].as_str(), Some("fallback"));
    }

    #[test]
    fn test_load_yaml_file() -> Result<(), Box<dyn std::error::Error>> {
        let mut temp_file = NamedTempFile::new()?;
        write!(
            temp_file,
            r#"
retention_secs: 60
interactive_tools: ["ask_followup_question"]
"#
        )?;

        let yaml = load_yaml_file(temp_file.path())?;
        assert_eq!(yaml["retention_secs"].as_u64(), Some(60));
        assert_eq!(yaml["interactive_tools"][0].as_str(), Some("ask_followup_question"));
        Ok(())
    }

    #[test]
    fn test_load_missing_file_is_config_error() {
        let err = load_yaml_file("/definitely/not/here.yaml").unwrap_err();
        assert!(matches!(err, OrchestratorError::Config(_)));
    }
}
