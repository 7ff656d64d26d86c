//! Template variables: merging and `${...}` interpolation.

use super::secrets::Redactor;
use crate::errors::ConfigurationError;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::LazyLock;
use uuid::Uuid;

static PLACEHOLDER: LazyLock<Result<Regex, regex::Error>> = LazyLock::new(|| {
    Regex::new(r"\$\{\s*(var|build)\.([A-Za-z_][A-Za-z0-9_\-]*)\s*\}")
});

fn placeholder() -> Result<&'static Regex, ConfigurationError> {
    PLACEHOLDER
        .as_ref()
        .map_err(|e| ConfigurationError::new(format!("placeholder pattern: {e}")))
}

/// The merged set of variable values for one build.
///
/// A `null` value marks a required variable nobody has set yet.
#[derive(Debug, Clone, Default)]
pub struct VariableSet {
    values: BTreeMap<String, Value>,
    declared: BTreeSet<String>,
    sensitive: BTreeSet<String>,
}

impl VariableSet {
    /// Starts from the template's `variables` block.
    #[must_use]
    pub fn from_template(defaults: &Map<String, Value>, sensitive: &[String]) -> Self {
        Self {
            values: defaults
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            declared: defaults.keys().cloned().collect(),
            sensitive: sensitive.iter().cloned().collect(),
        }
    }

    /// Merges a JSON object of values over the current ones.
    ///
    /// All keys of a `sensitive` object become sensitive.
    pub fn merge_object(&mut self, object: Map<String, Value>, sensitive: bool) {
        for (key, value) in object {
            if sensitive {
                self.sensitive.insert(key.clone());
            }
            self.values.insert(key, value);
        }
    }

    /// Reads a JSON object from `path` and merges it.
    pub fn merge_file(&mut self, path: &Path, sensitive: bool) -> Result<(), ConfigurationError> {
        let field = path.display().to_string();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ConfigurationError::new(format!("cannot read variable file: {e}")).with_field(&field)
        })?;
        let value: Value = serde_json::from_str(&raw).map_err(|e| {
            ConfigurationError::new(format!("variable file is not valid JSON: {e}"))
                .with_field(&field)
        })?;
        match value {
            Value::Object(map) => {
                self.merge_object(map, sensitive);
                Ok(())
            }
            _ => Err(ConfigurationError::new("variable file must hold a JSON object")
                .with_field(field)),
        }
    }

    /// Sets one declared variable from a `KEY=VALUE` assignment.
    pub fn set_assignment(&mut self, assignment: &str) -> Result<(), ConfigurationError> {
        let (key, value) = assignment.split_once('=').ok_or_else(|| {
            ConfigurationError::new(format!("expected KEY=VALUE, got '{assignment}'"))
                .with_field("--var")
        })?;
        let key = key.trim();
        if !self.declared.contains(key) {
            return Err(
                ConfigurationError::new(format!("variable '{key}' is not declared by the template"))
                    .with_field("--var"),
            );
        }
        self.values.insert(key.to_string(), Value::String(value.to_string()));
        Ok(())
    }

    /// Returns the value of a variable.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name).filter(|v| !v.is_null())
    }

    /// Names of required variables that are still unset.
    #[must_use]
    pub fn missing(&self) -> Vec<&str> {
        self.values
            .iter()
            .filter(|(_, v)| v.is_null())
            .map(|(k, _)| k.as_str())
            .collect()
    }

    /// Fails with the first missing required variable.
    pub fn ensure_complete(&self) -> Result<(), ConfigurationError> {
        match self.missing().first() {
            Some(name) => Err(ConfigurationError::new(format!(
                "required variable '{name}' is not set"
            ))
            .with_field(format!("variables.{name}"))),
            None => Ok(()),
        }
    }

    /// Builds the redactor over all sensitive values.
    #[must_use]
    pub fn redactor(&self) -> Redactor {
        Redactor::new(
            self.sensitive
                .iter()
                .filter_map(|name| self.get(name))
                .map(scalar_text),
        )
    }

    /// Replaces every `${var.NAME}` and `${build.id}` inside `value`.
    ///
    /// A string that is exactly one variable reference takes the variable's
    /// JSON value, so `"cpus": "${var.cpus}"` can become a number.
    pub fn interpolate(&self, value: Value, build_id: Uuid) -> Result<Value, ConfigurationError> {
        match value {
            Value::String(s) => self.interpolate_str(&s, build_id),
            Value::Array(items) => items
                .into_iter()
                .map(|v| self.interpolate(v, build_id))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => map
                .into_iter()
                .map(|(k, v)| Ok((k, self.interpolate(v, build_id)?)))
                .collect::<Result<Map<_, _>, ConfigurationError>>()
                .map(Value::Object),
            other => Ok(other),
        }
    }

    fn interpolate_str(&self, input: &str, build_id: Uuid) -> Result<Value, ConfigurationError> {
        let re = placeholder()?;

        if let Some(caps) = re.captures(input) {
            if caps.get(0).is_some_and(|m| m.as_str() == input) && &caps[1] == "var" {
                return self.lookup(&caps[2]).cloned();
            }
        }

        let mut out = String::with_capacity(input.len());
        let mut last = 0;
        for caps in re.captures_iter(input) {
            let Some(whole) = caps.get(0) else { continue };
            out.push_str(&input[last..whole.start()]);
            match &caps[1] {
                "build" => out.push_str(&Self::build_field(&caps[2], build_id)?),
                _ => out.push_str(&scalar_text(self.lookup(&caps[2])?)),
            }
            last = whole.end();
        }
        out.push_str(&input[last..]);
        Ok(Value::String(out))
    }

    fn lookup(&self, name: &str) -> Result<&Value, ConfigurationError> {
        match self.values.get(name) {
            Some(Value::Null) => Err(ConfigurationError::new(format!(
                "required variable '{name}' is not set"
            ))
            .with_field(format!("variables.{name}"))),
            Some(value) => Ok(value),
            None => Err(ConfigurationError::new(format!(
                "reference to unknown variable '{name}'"
            ))
            .with_field(format!("variables.{name}"))),
        }
    }

    fn build_field(name: &str, build_id: Uuid) -> Result<String, ConfigurationError> {
        match name {
            "id" => Ok(build_id.to_string()),
            other => Err(ConfigurationError::new(format!(
                "unknown build field '{other}' (only build.id is available)"
            ))),
        }
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
