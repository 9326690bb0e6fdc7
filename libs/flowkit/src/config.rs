use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// A single module declaration in the workflow document.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub type_tag: String,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default, rename = "dependsOn")]
    pub depends_on: Vec<String>,
    /// Conditional routing table: label → module name.
    #[serde(default)]
    pub branches: BTreeMap<String, String>,
}

/// The top-level workflow configuration document.
///
/// `workflows`, `triggers` and `pipelines` bodies stay as raw JSON here;
/// each is interpreted by the handler, trigger builder or pipeline engine
/// that claims it.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowConfig {
    #[serde(default)]
    pub modules: Vec<ModuleConfig>,
    #[serde(default)]
    pub workflows: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub triggers: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub pipelines: BTreeMap<String, serde_json::Value>,
}

impl WorkflowConfig {
    /// Parse a YAML (or JSON — YAML is a superset) document.
    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let value: serde_yaml::Value = serde_yaml::from_str(raw)
            .map_err(|e| ConfigError::new("<document>", e.to_string()))?;
        let json = serde_json::to_value(value)
            .map_err(|e| ConfigError::new("<document>", e.to_string()))?;
        let cfg: WorkflowConfig = serde_json::from_value(normalize_numbers(&json))
            .map_err(|e| ConfigError::new("<document>", e.to_string()))?;
        cfg.validate_names()?;
        Ok(cfg)
    }

    /// Load from a file; the returned base directory anchors relative paths
    /// inside the document.
    pub fn from_file(path: impl AsRef<Path>) -> Result<(Self, PathBuf), ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::new(path.display().to_string(), e.to_string()))?;
        let cfg = Self::from_yaml_str(&raw)?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok((cfg, base_dir))
    }

    fn validate_names(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for m in &self.modules {
            if m.name.trim().is_empty() {
                return Err(ConfigError::new("modules", "module with empty name"));
            }
            if !seen.insert(m.name.as_str()) {
                return Err(ConfigError::new(
                    format!("modules.{}", m.name),
                    "duplicate module name",
                ));
            }
        }
        Ok(())
    }
}

/// Source of `$NAME` / `${NAME}` substitutions. The default implementation
/// reads the process environment; a secrets provider can be layered in by
/// the application.
pub trait SecretsSource: Send + Sync {
    fn get(&self, name: &str) -> Option<String>;
}

struct ProcessEnv;

impl SecretsSource for ProcessEnv {
    fn get(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

fn var_pattern() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
            .unwrap()
    })
}

/// Expand `$NAME` and `${NAME}` in a scalar string. A reference to an
/// unknown variable is a configuration error naming the path.
pub fn expand_env_str(
    raw: &str,
    path: &str,
    source: &dyn SecretsSource,
) -> Result<String, ConfigError> {
    let mut missing: Option<String> = None;
    let expanded = var_pattern().replace_all(raw, |caps: &regex::Captures<'_>| {
        let name = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str())
            .unwrap_or_default();
        match source.get(name) {
            Some(v) => v,
            None => {
                missing.get_or_insert_with(|| name.to_string());
                String::new()
            }
        }
    });
    if let Some(name) = missing {
        return Err(ConfigError::new(
            path,
            format!("environment variable '{name}' not found"),
        ));
    }
    Ok(expanded.into_owned())
}

/// Recursively expand every string scalar in a JSON tree against the
/// process environment.
pub fn expand_env_value(
    value: &serde_json::Value,
    path: &str,
) -> Result<serde_json::Value, ConfigError> {
    expand_env_value_with(value, path, &ProcessEnv)
}

pub fn expand_env_value_with(
    value: &serde_json::Value,
    path: &str,
    source: &dyn SecretsSource,
) -> Result<serde_json::Value, ConfigError> {
    use serde_json::Value;
    Ok(match value {
        Value::String(s) => Value::String(expand_env_str(s, path, source)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .enumerate()
                .map(|(i, v)| expand_env_value_with(v, &format!("{path}[{i}]"), source))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(
                    k.clone(),
                    expand_env_value_with(v, &format!("{path}.{k}"), source)?,
                );
            }
            Value::Object(out)
        }
        other => other.clone(),
    })
}

/// Normalize YAML numeric ambiguity: any float with a zero fractional
/// part becomes an integer, so a declared-integer field accepts `7.0` and
/// a declared-float field still accepts both representations (integers
/// deserialize into floats). Applied to the whole document at load and to
/// module config sections before typed deserialization.
pub fn normalize_numbers(value: &serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match value {
        Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                if n.as_i64().is_none()
                    && n.as_u64().is_none()
                    && f.fract() == 0.0
                    && f >= i64::MIN as f64
                    && f <= i64::MAX as f64
                {
                    return Value::Number((f as i64).into());
                }
            }
            value.clone()
        }
        Value::Array(items) => Value::Array(items.iter().map(normalize_numbers).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), normalize_numbers(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Coerce a declared-integer field, accepting either YAML representation.
/// `7` and `7.0` both parse; `7.5` is a configuration error with the path.
pub fn as_int(value: &serde_json::Value, path: &str) -> Result<i64, ConfigError> {
    if let Some(i) = value.as_i64() {
        return Ok(i);
    }
    if let Some(f) = value.as_f64() {
        if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
            return Ok(f as i64);
        }
        return Err(ConfigError::new(
            path,
            format!("expected an integer, got {f}"),
        ));
    }
    Err(ConfigError::new(
        path,
        format!("expected an integer, got {value}"),
    ))
}

/// Coerce a declared-float field, accepting either YAML representation.
pub fn as_float(value: &serde_json::Value, path: &str) -> Result<f64, ConfigError> {
    value.as_f64().ok_or_else(|| {
        ConfigError::new(path, format!("expected a number, got {value}"))
    })
}
