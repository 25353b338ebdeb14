//! Typed run configuration.

use crate::error::{ConfigError, ConfigResult};
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Every option a run accepts
pub const KNOWN_OPTIONS: [&str; 11] = [
    "final_vars",
    "inputs",
    "config",
    "executor",
    "retry",
    "cache",
    "additional_modules",
    "reload",
    "log_level",
    "on_success",
    "on_failure",
];

static DOTTED_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)*$")
        .unwrap_or_else(|_| panic!("static regex DOTTED_ID failed to compile"))
});

/// Execution backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    /// One node at a time, inline
    #[default]
    Synchronous,
    /// Bounded pool of blocking threads
    ThreadPool,
    /// Bounded pool of isolated workers; values cross a serialization boundary
    ProcessPool,
    /// Ray cluster
    Ray,
    /// Dask cluster
    Dask,
}

impl ExecutorKind {
    /// Configuration name of the backend
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Synchronous => "synchronous",
            Self::ThreadPool => "threadpool",
            Self::ProcessPool => "processpool",
            Self::Ray => "ray",
            Self::Dask => "dask",
        }
    }

    /// Whether the backend submits to a remote scheduler
    #[must_use]
    pub const fn is_distributed(self) -> bool {
        matches!(self, Self::Ray | Self::Dask)
    }

    /// Whether values cross a serialization boundary
    #[must_use]
    pub const fn serializes(self) -> bool {
        matches!(self, Self::ProcessPool | Self::Ray | Self::Dask)
    }
}

impl FromStr for ExecutorKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "synchronous" | "sync" | "local" => Ok(Self::Synchronous),
            "threadpool" => Ok(Self::ThreadPool),
            "processpool" => Ok(Self::ProcessPool),
            "ray" => Ok(Self::Ray),
            "dask" => Ok(Self::Dask),
            other => Err(ConfigError::UnsupportedExecutor(other.to_string())),
        }
    }
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Executor selection plus its options
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Backend
    #[serde(rename = "type")]
    pub kind: ExecutorKind,
    /// Pool size; defaults to available parallelism
    pub max_workers: Option<usize>,
    /// CPU hint per distributed submission
    pub num_cpus: Option<f64>,
}

impl ExecutorConfig {
    fn from_value(value: Value) -> ConfigResult<Self> {
        let fields = match value {
            Value::String(kind) => {
                return Ok(Self {
                    kind: kind.parse()?,
                    ..Self::default()
                });
            }
            Value::Object(fields) => fields,
            other => return Err(ConfigError::invalid("executor", expected("object", &other))),
        };

        let mut config = Self::default();
        for (field, value) in fields {
            match field.as_str() {
                "type" => {
                    let kind = value
                        .as_str()
                        .ok_or_else(|| ConfigError::invalid("executor.type", expected("string", &value)))?;
                    config.kind = kind.parse()?;
                }
                "max_workers" => {
                    if value.is_null() {
                        continue;
                    }
                    let n = value.as_u64().ok_or_else(|| {
                        ConfigError::invalid("executor.max_workers", expected("integer", &value))
                    })?;
                    if n == 0 {
                        return Err(ConfigError::invalid("executor.max_workers", "must be at least 1"));
                    }
                    config.max_workers = Some(n as usize);
                }
                "num_cpus" => {
                    if value.is_null() {
                        continue;
                    }
                    let n = value.as_f64().ok_or_else(|| {
                        ConfigError::invalid("executor.num_cpus", expected("number", &value))
                    })?;
                    if n <= 0.0 {
                        return Err(ConfigError::invalid("executor.num_cpus", "must be positive"));
                    }
                    config.num_cpus = Some(n);
                }
                other => return Err(ConfigError::UnknownOption(format!("executor.{}", other))),
            }
        }
        Ok(config)
    }
}

/// Retry settings for every node of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Retries after the first attempt
    #[serde(default)]
    pub max_retries: u32,
    /// Base delay between attempts, seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay: f64,
    /// Relative jitter applied to each delay, in `[0, 1)`
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
    /// Error classifiers that trigger a retry
    #[serde(default = "default_retry_exceptions")]
    pub retry_exceptions: Vec<String>,
}

fn default_retry_delay() -> f64 {
    1.0
}

fn default_jitter_factor() -> f64 {
    0.1
}

fn default_retry_exceptions() -> Vec<String> {
    vec!["Exception".to_string()]
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            retry_delay: default_retry_delay(),
            jitter_factor: default_jitter_factor(),
            retry_exceptions: default_retry_exceptions(),
        }
    }
}

impl RetryConfig {
    fn from_value(value: Value) -> ConfigResult<Self> {
        if let Value::Object(fields) = &value {
            for field in fields.keys() {
                if !["max_retries", "retry_delay", "jitter_factor", "retry_exceptions"]
                    .contains(&field.as_str())
                {
                    return Err(ConfigError::UnknownOption(format!("retry.{}", field)));
                }
            }
        }
        let config: Self =
            serde_json::from_value(value).map_err(|e| ConfigError::invalid("retry", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns error if the delay is not positive or jitter is outside `[0, 1)`
    pub fn validate(&self) -> ConfigResult<()> {
        if !(self.retry_delay.is_finite() && self.retry_delay > 0.0) {
            return Err(ConfigError::invalid("retry.retry_delay", "must be positive"));
        }
        if !(0.0..1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::invalid("retry.jitter_factor", "must be in [0, 1)"));
        }
        Ok(())
    }
}

/// Output reuse policy
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Every node recomputes
    #[default]
    Disabled,
    /// Reuse cached values except for the listed nodes and their descendants
    Enabled {
        /// Nodes forced to recompute
        recompute: Vec<String>,
    },
}

impl CachePolicy {
    /// Whether reuse is on
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled { .. })
    }

    /// Nodes forced to recompute
    #[must_use]
    pub fn recompute(&self) -> &[String] {
        match self {
            Self::Enabled { recompute } => recompute,
            Self::Disabled => &[],
        }
    }

    fn from_value(value: Value) -> ConfigResult<Self> {
        match value {
            Value::Null | Value::Bool(false) => Ok(Self::Disabled),
            Value::Bool(true) => Ok(Self::Enabled { recompute: Vec::new() }),
            Value::Object(fields) => {
                let mut recompute = Vec::new();
                let mut enabled = true;
                for (field, value) in fields {
                    match field.as_str() {
                        "recompute" => recompute = string_list("cache.recompute", value)?,
                        "enabled" => {
                            enabled = value.as_bool().ok_or_else(|| {
                                ConfigError::invalid("cache.enabled", expected("bool", &value))
                            })?;
                        }
                        other => return Err(ConfigError::UnknownOption(format!("cache.{}", other))),
                    }
                }
                Ok(if enabled { Self::Enabled { recompute } } else { Self::Disabled })
            }
            other => Err(ConfigError::invalid("cache", expected("bool or object", &other))),
        }
    }
}

/// A lifecycle callback reference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackSpec {
    /// Dotted identifier, e.g. `hooks.notify`
    pub function: String,
    /// Fixed positional arguments
    #[serde(default)]
    pub args: Vec<Value>,
    /// Fixed keyword arguments
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl CallbackSpec {
    /// Reference a callback with no extra arguments
    #[must_use]
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    fn from_value(option: &str, value: Value) -> ConfigResult<Option<Self>> {
        let spec = match value {
            Value::Null => return Ok(None),
            Value::String(function) => Self::new(function),
            value @ Value::Object(_) => serde_json::from_value(value)
                .map_err(|e| ConfigError::invalid(option, e.to_string()))?,
            Value::Array(mut parts) if !parts.is_empty() => {
                // [function, args, kwargs]
                let function = parts.remove(0);
                let function = function
                    .as_str()
                    .ok_or_else(|| ConfigError::invalid(option, expected("string", &function)))?
                    .to_string();
                let mut spec = Self::new(function);
                let mut rest = parts.into_iter();
                match rest.next() {
                    Some(Value::Array(args)) => spec.args = args,
                    Some(Value::Null) | None => {}
                    Some(other) => return Err(ConfigError::invalid(option, expected("array", &other))),
                }
                match rest.next() {
                    Some(Value::Object(kwargs)) => spec.kwargs = kwargs,
                    Some(Value::Null) | None => {}
                    Some(other) => return Err(ConfigError::invalid(option, expected("object", &other))),
                }
                spec
            }
            other => return Err(ConfigError::invalid(option, expected("string or object", &other))),
        };
        if !DOTTED_ID.is_match(&spec.function) {
            return Err(ConfigError::invalid(
                option,
                format!("'{}' is not a dotted identifier", spec.function),
            ));
        }
        Ok(Some(spec))
    }
}

/// Validated configuration for one run
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    /// Requested outputs, in order, without duplicates
    pub final_vars: Vec<String>,
    /// Literal values that replace node computation
    pub inputs: IndexMap<String, Value>,
    /// Map consulted by conditional node selection
    pub config: Map<String, Value>,
    /// Execution backend
    pub executor: ExecutorConfig,
    /// Retry policy
    pub retry: RetryConfig,
    /// Output reuse policy
    pub cache: CachePolicy,
    /// Extra node modules, lowest precedence first
    pub additional_modules: Vec<String>,
    /// Rebuild the graph even if cached
    pub reload: bool,
    /// Log level for the run
    pub log_level: Option<tracing::Level>,
    /// Success callback
    pub on_success: Option<CallbackSpec>,
    /// Failure callback
    pub on_failure: Option<CallbackSpec>,
}

impl RunConfig {
    /// Validate resolved options
    ///
    /// # Errors
    ///
    /// Returns error on unknown options, missing `final_vars` or invalid values
    pub fn from_values(values: IndexMap<String, Value>) -> ConfigResult<Self> {
        if let Some(unknown) = values.keys().find(|k| !KNOWN_OPTIONS.contains(&k.as_str())) {
            return Err(ConfigError::UnknownOption(unknown.clone()));
        }

        let mut values = values;
        let mut take = |key: &str| values.shift_remove(key).unwrap_or(Value::Null);

        let final_vars = string_list("final_vars", take("final_vars"))?;
        let mut seen = std::collections::HashSet::new();
        let final_vars: Vec<String> =
            final_vars.into_iter().filter(|v| seen.insert(v.clone())).collect();
        if final_vars.is_empty() {
            return Err(ConfigError::invalid("final_vars", "at least one output is required"));
        }

        let inputs = object("inputs", take("inputs"))?.into_iter().collect();
        let config = object("config", take("config"))?;

        let executor = match take("executor") {
            Value::Null => ExecutorConfig::default(),
            value => ExecutorConfig::from_value(value)?,
        };
        let retry = match take("retry") {
            Value::Null => RetryConfig::default(),
            value => RetryConfig::from_value(value)?,
        };
        let cache = CachePolicy::from_value(take("cache"))?;
        let additional_modules = string_list("additional_modules", take("additional_modules"))?;

        let reload = match take("reload") {
            Value::Null => false,
            Value::Bool(b) => b,
            other => return Err(ConfigError::invalid("reload", expected("bool", &other))),
        };

        let log_level = match take("log_level") {
            Value::Null => None,
            Value::String(level) => Some(parse_level(&level)?),
            other => return Err(ConfigError::invalid("log_level", expected("string", &other))),
        };

        let on_success = CallbackSpec::from_value("on_success", take("on_success"))?;
        let on_failure = CallbackSpec::from_value("on_failure", take("on_failure"))?;

        Ok(Self {
            final_vars,
            inputs,
            config,
            executor,
            retry,
            cache,
            additional_modules,
            reload,
            log_level,
            on_success,
            on_failure,
        })
    }
}

/// Parse a level name case-insensitively, accepting `WARNING` and `CRITICAL`
fn parse_level(name: &str) -> ConfigResult<tracing::Level> {
    let normalized = match name.to_ascii_uppercase().as_str() {
        "WARNING" => "WARN".to_string(),
        "CRITICAL" | "FATAL" => "ERROR".to_string(),
        other => other.to_string(),
    };
    tracing::Level::from_str(&normalized)
        .map_err(|_| ConfigError::invalid("log_level", format!("unknown level '{}'", name)))
}

fn string_list(option: &str, value: Value) -> ConfigResult<Vec<String>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::String(s) => Ok(vec![s]),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                other => Err(ConfigError::invalid(option, expected("string", &other))),
            })
            .collect(),
        other => Err(ConfigError::invalid(option, expected("list of strings", &other))),
    }
}

fn object(option: &str, value: Value) -> ConfigResult<Map<String, Value>> {
    match value {
        Value::Null => Ok(Map::new()),
        Value::Object(map) => Ok(map),
        other => Err(ConfigError::invalid(option, expected("object", &other))),
    }
}

fn expected(what: &str, got: &Value) -> String {
    let kind = match got {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    };
    format!("expected {}, got {}", what, kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{ConfigLayer, LayerScope, merge};
    use crate::overrides::RunOverrides;
    use serde_json::json;

    fn values(v: Value) -> IndexMap<String, Value> {
        match v {
            Value::Object(map) => map.into_iter().collect(),
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_minimal_run_config_defaults() {
        let run = RunConfig::from_values(values(json!({"final_vars": ["summary"]}))).unwrap();
        assert_eq!(run.final_vars, vec!["summary"]);
        assert_eq!(run.executor.kind, ExecutorKind::Synchronous);
        assert_eq!(run.retry, RetryConfig::default());
        assert_eq!(run.cache, CachePolicy::Disabled);
        assert!(!run.reload);
        assert!(run.on_success.is_none());
    }

    #[test]
    fn test_final_vars_required() {
        let err = RunConfig::from_values(values(json!({"final_vars": []}))).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { option, .. } if option == "final_vars"));
    }

    #[test]
    fn test_final_vars_deduplicated_in_order() {
        let run =
            RunConfig::from_values(values(json!({"final_vars": ["b", "a", "b"]}))).unwrap();
        assert_eq!(run.final_vars, vec!["b", "a"]);
    }

    #[test]
    fn test_unknown_option_rejected() {
        let err = RunConfig::from_values(values(json!({"final_vars": ["x"], "retires": 3})))
            .unwrap_err();
        assert_eq!(err, ConfigError::UnknownOption("retires".to_string()));

        let err = RunConfig::from_values(values(
            json!({"final_vars": ["x"], "executor": {"type": "threadpool", "workers": 3}}),
        ))
        .unwrap_err();
        assert_eq!(err, ConfigError::UnknownOption("executor.workers".to_string()));
    }

    #[test]
    fn test_jitter_out_of_range() {
        let err = RunConfig::from_values(values(
            json!({"final_vars": ["x"], "retry": {"jitter_factor": 1.0}}),
        ))
        .unwrap_err();
        assert!(
            matches!(err, ConfigError::InvalidValue { option, .. } if option == "retry.jitter_factor")
        );
    }

    #[test]
    fn test_non_positive_delay() {
        let err = RunConfig::from_values(values(
            json!({"final_vars": ["x"], "retry": {"retry_delay": 0}}),
        ))
        .unwrap_err();
        assert!(
            matches!(err, ConfigError::InvalidValue { option, .. } if option == "retry.retry_delay")
        );
    }

    #[test]
    fn test_unknown_executor() {
        let err = RunConfig::from_values(values(
            json!({"final_vars": ["x"], "executor": "spark"}),
        ))
        .unwrap_err();
        assert_eq!(err, ConfigError::UnsupportedExecutor("spark".to_string()));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let err = RunConfig::from_values(values(
            json!({"final_vars": ["x"], "executor": {"type": "threadpool", "max_workers": 0}}),
        ))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_cache_forms() {
        assert_eq!(CachePolicy::from_value(json!(false)).unwrap(), CachePolicy::Disabled);
        assert_eq!(
            CachePolicy::from_value(json!(true)).unwrap(),
            CachePolicy::Enabled { recompute: vec![] }
        );
        assert_eq!(
            CachePolicy::from_value(json!({"recompute": ["expensive_node"]})).unwrap(),
            CachePolicy::Enabled {
                recompute: vec!["expensive_node".to_string()]
            }
        );
    }

    #[test]
    fn test_callback_forms() {
        let spec = CallbackSpec::from_value("on_success", json!("hooks.notify"))
            .unwrap()
            .unwrap();
        assert_eq!(spec.function, "hooks.notify");

        let spec = CallbackSpec::from_value(
            "on_failure",
            json!(["hooks.page", ["ops"], {"severity": "high"}]),
        )
        .unwrap()
        .unwrap();
        assert_eq!(spec.args, vec![json!("ops")]);
        assert_eq!(spec.kwargs.get("severity"), Some(&json!("high")));

        assert!(CallbackSpec::from_value("on_success", json!("not a path")).is_err());
    }

    #[test]
    fn test_log_level_parsed() {
        let run = RunConfig::from_values(values(
            json!({"final_vars": ["x"], "log_level": "debug"}),
        ))
        .unwrap();
        assert_eq!(run.log_level, Some(tracing::Level::DEBUG));

        assert!(
            RunConfig::from_values(values(json!({"final_vars": ["x"], "log_level": "loud"})))
                .is_err()
        );
    }

    #[test]
    fn test_log_level_accepts_python_style_names() {
        let cases = [
            ("DEBUG", tracing::Level::DEBUG),
            ("INFO", tracing::Level::INFO),
            ("WARNING", tracing::Level::WARN),
            ("warning", tracing::Level::WARN),
            ("ERROR", tracing::Level::ERROR),
            ("CRITICAL", tracing::Level::ERROR),
        ];
        for (name, level) in cases {
            let effective = merge([RunOverrides {
                final_vars: Some(vec!["x".into()]),
                log_level: Some(name.into()),
                ..RunOverrides::default()
            }
            .into_layer()]);
            let run = effective.into_run_config().unwrap();
            assert_eq!(run.log_level, Some(level), "{}", name);
        }
    }

    #[test]
    fn test_merged_executor_scenario() {
        let effective = merge([
            ConfigLayer::new(LayerScope::Project)
                .with("executor", json!({"type": "synchronous"})),
            ConfigLayer::new(LayerScope::Pipeline)
                .with("final_vars", json!(["summary"]))
                .with("executor", json!({"type": "threadpool", "max_workers": 4})),
            ConfigLayer::new(LayerScope::Runtime),
        ]);
        let run = effective.into_run_config().unwrap();
        assert_eq!(
            run.executor,
            ExecutorConfig {
                kind: ExecutorKind::ThreadPool,
                max_workers: Some(4),
                num_cpus: None,
            }
        );
    }
}
