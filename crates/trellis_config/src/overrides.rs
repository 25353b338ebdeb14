//! Keyword overrides for a single run call.

use crate::layer::{ConfigLayer, LayerScope};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Options passed directly to a run call.
///
/// Each field is optional; only supplied fields end up in the keyword
/// layer. The flat executor and retry fields are overlaid onto the
/// structured `executor` / `retry` objects.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOverrides {
    /// Requested outputs
    pub final_vars: Option<Vec<String>>,
    /// Literal inputs
    pub inputs: Option<Map<String, Value>>,
    /// Conditional-selection map
    pub config: Option<Map<String, Value>>,
    /// Structured executor object or type name
    pub executor: Option<Value>,
    /// `executor.type`
    pub executor_type: Option<String>,
    /// `executor.max_workers`
    pub max_workers: Option<usize>,
    /// `executor.num_cpus`
    pub num_cpus: Option<f64>,
    /// Structured retry object
    pub retry: Option<Value>,
    /// `retry.max_retries`
    pub max_retries: Option<u32>,
    /// `retry.retry_delay`
    pub retry_delay: Option<f64>,
    /// `retry.jitter_factor`
    pub jitter_factor: Option<f64>,
    /// `retry.retry_exceptions`
    pub retry_exceptions: Option<Vec<String>>,
    /// Cache policy
    pub cache: Option<Value>,
    /// Extra node modules
    pub additional_modules: Option<Vec<String>>,
    /// Rebuild the graph
    pub reload: Option<bool>,
    /// Log level
    pub log_level: Option<String>,
    /// Success callback
    pub on_success: Option<Value>,
    /// Failure callback
    pub on_failure: Option<Value>,
}

impl RunOverrides {
    /// Overrides requesting the given outputs
    #[must_use]
    pub fn outputs<I, S>(final_vars: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            final_vars: Some(final_vars.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    /// Lower to a keyword-scope layer
    #[must_use]
    pub fn into_layer(self) -> ConfigLayer {
        let mut layer = ConfigLayer::new(LayerScope::Keyword);
        let mut put = |key: &str, value: Option<Value>| {
            if let Some(value) = value {
                layer.values.insert(key.to_string(), value);
            }
        };

        put("final_vars", self.final_vars.map(Value::from));
        put("inputs", self.inputs.map(Value::Object));
        put("config", self.config.map(Value::Object));

        let executor = overlay(
            self.executor,
            [
                ("type", self.executor_type.map(Value::from)),
                ("max_workers", self.max_workers.map(Value::from)),
                ("num_cpus", self.num_cpus.map(Value::from)),
            ],
        );
        put("executor", executor);

        let retry = overlay(
            self.retry,
            [
                ("max_retries", self.max_retries.map(Value::from)),
                ("retry_delay", self.retry_delay.map(Value::from)),
                ("jitter_factor", self.jitter_factor.map(Value::from)),
                ("retry_exceptions", self.retry_exceptions.map(Value::from)),
            ],
        );
        put("retry", retry);

        put("cache", self.cache);
        put("additional_modules", self.additional_modules.map(Value::from));
        put("reload", self.reload.map(Value::from));
        put("log_level", self.log_level.map(Value::from));
        put("on_success", self.on_success);
        put("on_failure", self.on_failure);

        layer
    }
}

/// Apply flat fields on top of a structured object, if anything was given
fn overlay<const N: usize>(base: Option<Value>, fields: [(&str, Option<Value>); N]) -> Option<Value> {
    let supplied: Vec<(&str, Value)> = fields
        .into_iter()
        .filter_map(|(k, v)| v.map(|v| (k, v)))
        .collect();

    let mut object = match base {
        None if supplied.is_empty() => return None,
        None => Map::new(),
        Some(Value::Object(map)) => map,
        Some(Value::String(kind)) => {
            let mut map = Map::new();
            map.insert("type".to_string(), Value::String(kind));
            map
        }
        // Leave malformed values for validation to report
        Some(other) if supplied.is_empty() => return Some(other),
        Some(_) => Map::new(),
    };
    for (k, v) in supplied {
        object.insert(k.to_string(), v);
    }
    Some(Value::Object(object))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::merge;
    use serde_json::json;

    #[test]
    fn test_only_supplied_fields_lowered() {
        let layer = RunOverrides {
            max_workers: Some(8),
            ..RunOverrides::default()
        }
        .into_layer();
        assert_eq!(layer.scope, LayerScope::Keyword);
        assert_eq!(layer.values.len(), 1);
        assert_eq!(layer.values.get("executor"), Some(&json!({"max_workers": 8})));
    }

    #[test]
    fn test_flat_fields_beat_structured_override() {
        let layer = RunOverrides {
            retry: Some(json!({"max_retries": 1, "retry_delay": 0.5})),
            max_retries: Some(4),
            ..RunOverrides::default()
        }
        .into_layer();
        assert_eq!(
            layer.values.get("retry"),
            Some(&json!({"max_retries": 4, "retry_delay": 0.5}))
        );
    }

    #[test]
    fn test_keyword_precedence_chain() {
        let pipeline = ConfigLayer::new(LayerScope::Pipeline)
            .with("final_vars", json!(["summary"]))
            .with("retry", json!({"max_retries": 1, "retry_delay": 2.0, "jitter_factor": 0.2}));
        let runtime = ConfigLayer::new(LayerScope::Runtime)
            .with("retry", json!({"retry_delay": 0.25}));
        let keyword = RunOverrides {
            jitter_factor: Some(0.0),
            ..RunOverrides::default()
        }
        .into_layer();

        let run = merge([pipeline, runtime, keyword]).into_run_config().unwrap();
        assert_eq!(run.retry.max_retries, 1);
        assert_eq!(run.retry.retry_delay, 0.25);
        assert_eq!(run.retry.jitter_factor, 0.0);
    }

    #[test]
    fn test_outputs_constructor() {
        let layer = RunOverrides::outputs(["a", "b"]).into_layer();
        assert_eq!(layer.values.get("final_vars"), Some(&json!(["a", "b"])));
    }
}
