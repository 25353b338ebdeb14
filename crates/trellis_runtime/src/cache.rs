//! Shared result cache.
//!
//! One cell per (identity, node). Concurrent runs asking for the same
//! uncached cell coalesce onto a single computation; a failed
//! computation leaves the cell empty.

use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OnceCell;
use trellis_core::{Fingerprint, Fingerprinter, NodeValue};
use trellis_plan::GraphKey;

/// A cache cell for one node under one identity
pub type CacheSlot = Arc<OnceCell<NodeValue>>;

type Cells = HashMap<(Fingerprint, String), CacheSlot>;

/// Node results reusable across runs
#[derive(Debug, Default)]
pub struct ResultCache {
    cells: Mutex<Cells>,
}

impl ResultCache {
    /// Create an empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Identity of a run's results: graph identity plus literal inputs
    #[must_use]
    pub fn identity(graph: &GraphKey, literals: &IndexMap<String, NodeValue>) -> Fingerprint {
        let mut fp = Fingerprinter::new("trellis.results");
        fp.update_fingerprint(graph.fingerprint());
        let mut names: Vec<&String> = literals.keys().collect();
        names.sort();
        for name in names {
            fp.update_str(name);
            if let Some(value) = literals.get(name) {
                value.fingerprint_into(&mut fp);
            }
        }
        fp.finish()
    }

    /// The cell for a node, created empty if absent
    #[must_use]
    pub fn slot(&self, identity: &Fingerprint, node: &str) -> CacheSlot {
        let mut cells = self.lock();
        Arc::clone(
            cells
                .entry((*identity, node.to_string()))
                .or_insert_with(|| Arc::new(OnceCell::new())),
        )
    }

    /// Replace the cell for a node with an empty one, forcing recomputation.
    ///
    /// Holders of the old cell are unaffected.
    #[must_use]
    pub fn fresh_slot(&self, identity: &Fingerprint, node: &str) -> CacheSlot {
        let slot: CacheSlot = Arc::new(OnceCell::new());
        self.lock()
            .insert((*identity, node.to_string()), Arc::clone(&slot));
        slot
    }

    /// A completed value, if any
    #[must_use]
    pub fn peek(&self, identity: &Fingerprint, node: &str) -> Option<NodeValue> {
        self.lock()
            .get(&(*identity, node.to_string()))
            .and_then(|cell| cell.get().cloned())
    }

    /// Number of completed values
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().values().filter(|cell| cell.initialized()).count()
    }

    /// Whether no value is cached
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, Cells> {
        self.cells.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn id() -> Fingerprint {
        Fingerprint::compute(b"run")
    }

    #[tokio::test]
    async fn test_concurrent_requests_coalesce() {
        let cache = Arc::new(ResultCache::new());
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                let slot = cache.slot(&id(), "expensive_node");
                slot.get_or_init(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    NodeValue::from(42i64)
                })
                .await
                .clone()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), NodeValue::from(42i64));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_fresh_slot_forces_recompute() {
        let cache = ResultCache::new();
        let _ = cache.slot(&id(), "n").get_or_init(|| async { NodeValue::from(1i64) }).await;
        assert_eq!(cache.peek(&id(), "n"), Some(NodeValue::from(1i64)));

        let slot = cache.fresh_slot(&id(), "n");
        assert_eq!(cache.peek(&id(), "n"), None);
        let _ = slot.get_or_init(|| async { NodeValue::from(2i64) }).await;
        assert_eq!(cache.peek(&id(), "n"), Some(NodeValue::from(2i64)));
    }

    #[tokio::test]
    async fn test_failed_init_leaves_cell_empty() {
        let cache = ResultCache::new();
        let slot = cache.slot(&id(), "n");
        let res: Result<&NodeValue, &str> = slot.get_or_try_init(|| async { Err("boom") }).await;
        assert!(res.is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_identity_tracks_literals() {
        let graph = trellis_plan::GraphKey::compute(&[], &Default::default(), &Default::default());
        let mut a = IndexMap::new();
        a.insert("date".to_string(), NodeValue::from("2024-01-01"));
        let mut b = IndexMap::new();
        b.insert("date".to_string(), NodeValue::from("2024-01-02"));
        assert_ne!(ResultCache::identity(&graph, &a), ResultCache::identity(&graph, &b));
        assert_eq!(ResultCache::identity(&graph, &a), ResultCache::identity(&graph, &a.clone()));
    }
}
