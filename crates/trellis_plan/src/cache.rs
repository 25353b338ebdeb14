//! Graph cache keyed by (module set, config, params).

use crate::dag::NodeGraph;
use crate::error::GraphError;
use crate::module::NodeModule;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use trellis_core::{Fingerprint, Fingerprinter};

/// Identity of a built graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GraphKey(Fingerprint);

impl GraphKey {
    /// Fingerprint module names and revisions in composition order, plus
    /// the config and params maps
    #[must_use]
    pub fn compute(
        modules: &[Arc<NodeModule>],
        config: &Map<String, Value>,
        params: &Map<String, Value>,
    ) -> Self {
        let mut fp = Fingerprinter::new("trellis.graph");
        for module in modules {
            fp.update_str(&module.name)
                .update_bytes(&module.revision.to_le_bytes());
        }
        fp.update_json(&Value::Object(config.clone()))
            .update_json(&Value::Object(params.clone()));
        Self(fp.finish())
    }

    /// Underlying fingerprint
    #[must_use]
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.0
    }
}

impl fmt::Display for GraphKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.short())
    }
}

/// Built graphs shared across runs
#[derive(Debug, Default)]
pub struct GraphCache {
    graphs: RwLock<HashMap<GraphKey, Arc<NodeGraph>>>,
}

impl GraphCache {
    /// Create an empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached graph for this identity, building it on a miss
    /// or when `reload` is set.
    ///
    /// Runs already holding the previous `Arc` keep using it.
    ///
    /// # Errors
    ///
    /// Returns the build error; a failed build leaves the cache untouched
    pub fn get_or_build(
        &self,
        modules: &[Arc<NodeModule>],
        config: &Map<String, Value>,
        params: &Map<String, Value>,
        reload: bool,
    ) -> Result<Arc<NodeGraph>, GraphError> {
        let key = GraphKey::compute(modules, config, params);

        if reload {
            self.invalidate(&key);
        } else if let Some(graph) = self.read().get(&key) {
            tracing::debug!(graph = %key, "Reusing cached graph");
            return Ok(Arc::clone(graph));
        }

        let graph = Arc::new(NodeGraph::build(modules, config, params)?);
        self.write().insert(key, Arc::clone(&graph));
        Ok(graph)
    }

    /// Drop one entry
    pub fn invalidate(&self, key: &GraphKey) -> bool {
        self.write().remove(key).is_some()
    }

    /// Drop everything
    pub fn clear(&self) {
        self.write().clear();
    }

    /// Number of cached graphs
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether nothing is cached
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<GraphKey, Arc<NodeGraph>>> {
        self.graphs.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<GraphKey, Arc<NodeGraph>>> {
        self.graphs.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeDef;
    use serde_json::json;
    use trellis_core::NodeValue;

    fn modules(revision: u64) -> Vec<Arc<NodeModule>> {
        vec![Arc::new(
            NodeModule::new("m")
                .revision(revision)
                .node(NodeDef::new("a", ["x"], |_| Ok(NodeValue::null())))
                .node(NodeDef::new("b", ["a"], |_| Ok(NodeValue::null()))),
        )]
    }

    fn config(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => Map::new(),
        }
    }

    #[test]
    fn test_reuse_without_reload() {
        let cache = GraphCache::new();
        let m = modules(0);
        let first = cache.get_or_build(&m, &Map::new(), &Map::new(), false).unwrap();
        let second = cache.get_or_build(&m, &Map::new(), &Map::new(), false).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_reload_rebuilds_and_keeps_old_snapshot() {
        let cache = GraphCache::new();
        let m = modules(0);
        let first = cache.get_or_build(&m, &Map::new(), &Map::new(), false).unwrap();
        let rebuilt = cache.get_or_build(&m, &Map::new(), &Map::new(), true).unwrap();
        assert!(!Arc::ptr_eq(&first, &rebuilt));
        assert_eq!(first.structure(), rebuilt.structure());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_key_tracks_config_and_revision() {
        let a = GraphKey::compute(&modules(0), &config(json!({"env": "dev"})), &Map::new());
        let b = GraphKey::compute(&modules(0), &config(json!({"env": "prod"})), &Map::new());
        let c = GraphKey::compute(&modules(1), &config(json!({"env": "dev"})), &Map::new());
        assert_ne!(a, b);
        assert_ne!(a, c);
    }
}
