//! Configuration layers and precedence merge.
//!
//! Layers are merged shallowly per top-level key: a later layer replaces
//! the earlier value wholesale. The structured keys `executor`, `retry`
//! and `cache` are the exception when they come from the runtime or
//! keyword scope as objects; their fields are then overlaid onto the
//! object resolved so far.

use crate::error::ConfigResult;
use crate::run::RunConfig;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Top-level keys holding structured sub-objects
pub const STRUCTURED_KEYS: [&str; 3] = ["executor", "retry", "cache"];

/// Where a layer comes from, ordered by ascending precedence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerScope {
    /// Project defaults
    Project,
    /// The pipeline document's `run:` section
    Pipeline,
    /// A run configuration object supplied by the caller
    Runtime,
    /// Direct keyword overrides
    Keyword,
}

impl LayerScope {
    /// Whether structured objects from this scope overlay instead of replace
    #[must_use]
    pub const fn overlays(self) -> bool {
        matches!(self, Self::Runtime | Self::Keyword)
    }
}

impl fmt::Display for LayerScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Project => "project",
            Self::Pipeline => "pipeline",
            Self::Runtime => "runtime",
            Self::Keyword => "keyword",
        };
        f.write_str(name)
    }
}

/// One configuration source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigLayer {
    /// Source scope
    pub scope: LayerScope,
    /// Option name to value, in document order
    pub values: IndexMap<String, Value>,
}

impl ConfigLayer {
    /// Create an empty layer
    #[must_use]
    pub fn new(scope: LayerScope) -> Self {
        Self {
            scope,
            values: IndexMap::new(),
        }
    }

    /// Create a layer from an existing map
    #[must_use]
    pub fn from_map(scope: LayerScope, map: serde_json::Map<String, Value>) -> Self {
        Self {
            scope,
            values: map.into_iter().collect(),
        }
    }

    /// Set an option, builder style
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Whether the layer sets nothing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Result of merging every layer for one run request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EffectiveConfig {
    values: IndexMap<String, Value>,
}

impl EffectiveConfig {
    /// Look up a resolved option
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// All resolved options
    #[must_use]
    pub fn values(&self) -> &IndexMap<String, Value> {
        &self.values
    }

    /// Re-wrap as a layer, e.g. to merge it again
    #[must_use]
    pub fn to_layer(&self, scope: LayerScope) -> ConfigLayer {
        ConfigLayer {
            scope,
            values: self.values.clone(),
        }
    }

    /// As a JSON object
    #[must_use]
    pub fn to_json(&self) -> Value {
        Value::Object(self.values.clone().into_iter().collect())
    }

    /// Validate into a typed run configuration
    ///
    /// # Errors
    ///
    /// Returns error on unknown options or invalid values
    pub fn into_run_config(self) -> ConfigResult<RunConfig> {
        RunConfig::from_values(self.values)
    }
}

/// Merge layers by precedence.
///
/// Layers are stably sorted by scope, so two layers of the same scope
/// apply in the order given.
pub fn merge(layers: impl IntoIterator<Item = ConfigLayer>) -> EffectiveConfig {
    let mut layers: Vec<ConfigLayer> = layers.into_iter().collect();
    layers.sort_by_key(|layer| layer.scope);

    let mut values: IndexMap<String, Value> = IndexMap::new();
    for layer in layers {
        tracing::trace!(scope = %layer.scope, keys = layer.values.len(), "Merging config layer");
        for (key, value) in layer.values {
            let value = normalize(&key, value);
            let overlay = layer.scope.overlays() && STRUCTURED_KEYS.contains(&key.as_str());
            if let (true, Value::Object(fields)) = (overlay, &value) {
                if let Some(Value::Object(prior)) = values.get_mut(&key) {
                    for (field, v) in fields {
                        prior.insert(field.clone(), v.clone());
                    }
                    continue;
                }
            }
            values.insert(key, value);
        }
    }

    EffectiveConfig { values }
}

/// `executor: threadpool` is shorthand for `executor: {type: threadpool}`
fn normalize(key: &str, value: Value) -> Value {
    match (key, value) {
        ("executor", Value::String(kind)) => {
            let mut obj = serde_json::Map::new();
            obj.insert("type".to_string(), Value::String(kind));
            Value::Object(obj)
        }
        (_, value) => value,
    }
}
