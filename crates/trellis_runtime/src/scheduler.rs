//! Ready-set tracking for plan execution.
//!
//! The scheduler is deterministic:
//! - Ready nodes are released in plan order (BTreeSet keyed by plan index)
//! - A node becomes ready once every scheduled dependency has completed
//! - Dependents of a failed node never become ready

use indexmap::{IndexMap, IndexSet};
use std::collections::BTreeSet;

/// Scheduler error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    /// Node registered twice
    DuplicateNode {
        /// Node name
        name: String,
    },
    /// Node depends on itself
    SelfDependency {
        /// Node name
        name: String,
    },
    /// Node is not being tracked
    UnknownNode {
        /// Node name
        name: String,
    },
}

impl std::fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateNode { name } => write!(f, "Node already scheduled: {}", name),
            Self::SelfDependency { name } => write!(f, "Node depends on itself: {}", name),
            Self::UnknownNode { name } => write!(f, "Node not scheduled: {}", name),
        }
    }
}

impl std::error::Error for ScheduleError {}

/// Deterministic ready-set scheduler
#[derive(Debug, Default)]
pub struct Scheduler {
    /// Plan index of every tracked node
    priority: IndexMap<String, usize>,
    /// Nodes ready to dispatch
    ready: BTreeSet<(usize, String)>,
    /// Dispatched, not yet finished
    running: BTreeSet<String>,
    completed: BTreeSet<String>,
    failed: BTreeSet<String>,
    /// node -> scheduled nodes it waits on
    dependencies: IndexMap<String, IndexSet<String>>,
    /// node -> scheduled nodes waiting on it
    dependents: IndexMap<String, IndexSet<String>>,
}

impl Scheduler {
    /// Create an empty scheduler
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a node.
    ///
    /// `deps` lists only dependencies that are themselves scheduled; values
    /// already available (literals, reused results) are not dependencies.
    ///
    /// # Errors
    ///
    /// Returns error if the node is already tracked or depends on itself
    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        priority: usize,
        deps: IndexSet<String>,
    ) -> Result<(), ScheduleError> {
        let name = name.into();
        if self.priority.contains_key(&name) {
            return Err(ScheduleError::DuplicateNode { name });
        }
        if deps.contains(&name) {
            return Err(ScheduleError::SelfDependency { name });
        }

        for dep in &deps {
            self.dependents
                .entry(dep.clone())
                .or_default()
                .insert(name.clone());
        }
        self.priority.insert(name.clone(), priority);
        self.dependencies.insert(name.clone(), deps);

        if self.is_ready(&name) {
            self.ready.insert((priority, name));
        }
        Ok(())
    }

    /// Release every ready node, in plan order
    pub fn take_ready(&mut self) -> Vec<String> {
        let batch: Vec<String> = std::mem::take(&mut self.ready)
            .into_iter()
            .map(|(_, name)| name)
            .collect();
        self.running.extend(batch.iter().cloned());
        batch
    }

    /// Record a successful node and release dependents that became ready
    ///
    /// # Errors
    ///
    /// Returns error if the node is not tracked
    pub fn mark_complete(&mut self, name: &str) -> Result<(), ScheduleError> {
        self.finish(name)?;
        self.completed.insert(name.to_string());

        let dependents: Vec<String> = self
            .dependents
            .get(name)
            .map(|d| d.iter().cloned().collect())
            .unwrap_or_default();
        for dependent in dependents {
            if self.is_ready(&dependent) && !self.is_settled(&dependent) {
                if let Some(&p) = self.priority.get(&dependent) {
                    self.ready.insert((p, dependent));
                }
            }
        }
        Ok(())
    }

    /// Record a failed node; its dependents stay blocked
    ///
    /// # Errors
    ///
    /// Returns error if the node is not tracked
    pub fn mark_failed(&mut self, name: &str) -> Result<(), ScheduleError> {
        self.finish(name)?;
        self.failed.insert(name.to_string());
        Ok(())
    }

    fn finish(&mut self, name: &str) -> Result<(), ScheduleError> {
        let Some(&p) = self.priority.get(name) else {
            return Err(ScheduleError::UnknownNode {
                name: name.to_string(),
            });
        };
        self.running.remove(name);
        self.ready.remove(&(p, name.to_string()));
        Ok(())
    }

    fn is_ready(&self, name: &str) -> bool {
        self.dependencies
            .get(name)
            .is_none_or(|deps| deps.iter().all(|d| self.completed.contains(d)))
    }

    fn is_settled(&self, name: &str) -> bool {
        self.completed.contains(name)
            || self.failed.contains(name)
            || self.running.contains(name)
    }

    /// Nothing is ready and nothing is running
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.ready.is_empty() && self.running.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deps(names: &[&str]) -> IndexSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_scheduler_new() {
        let mut scheduler = Scheduler::new();
        assert!(scheduler.is_idle());
        assert!(scheduler.take_ready().is_empty());
    }

    #[test]
    fn test_scheduler_single_node() {
        let mut scheduler = Scheduler::new();
        scheduler.add_node("a", 0, deps(&[])).unwrap();
        assert_eq!(scheduler.ready.len(), 1);

        assert_eq!(scheduler.take_ready(), vec!["a".to_string()]);
        assert_eq!(scheduler.running.len(), 1);
        assert!(!scheduler.is_idle());

        scheduler.mark_complete("a").unwrap();
        assert!(scheduler.is_idle());
        assert!(scheduler.completed.contains("a"));
    }

    #[test]
    fn test_scheduler_dependencies() {
        let mut scheduler = Scheduler::new();
        scheduler.add_node("daily_totals", 0, deps(&[])).unwrap();
        scheduler.add_node("summary", 1, deps(&["daily_totals"])).unwrap();

        assert_eq!(scheduler.take_ready(), vec!["daily_totals".to_string()]);
        assert!(scheduler.take_ready().is_empty());

        scheduler.mark_complete("daily_totals").unwrap();
        assert_eq!(scheduler.take_ready(), vec!["summary".to_string()]);
    }

    #[test]
    fn test_scheduler_waits_for_all_dependencies() {
        let mut scheduler = Scheduler::new();
        scheduler.add_node("a", 0, deps(&[])).unwrap();
        scheduler.add_node("b", 1, deps(&[])).unwrap();
        scheduler.add_node("c", 2, deps(&["a", "b"])).unwrap();
        scheduler.take_ready();

        scheduler.mark_complete("a").unwrap();
        assert!(scheduler.take_ready().is_empty());
        scheduler.mark_complete("b").unwrap();
        assert_eq!(scheduler.take_ready(), vec!["c".to_string()]);
    }

    #[test]
    fn test_scheduler_self_dependency() {
        let mut scheduler = Scheduler::new();
        let result = scheduler.add_node("a", 0, deps(&["a"]));
        assert_eq!(result, Err(ScheduleError::SelfDependency { name: "a".into() }));
    }

    #[test]
    fn test_scheduler_duplicate() {
        let mut scheduler = Scheduler::new();
        scheduler.add_node("a", 0, deps(&[])).unwrap();
        assert!(scheduler.add_node("a", 1, deps(&[])).is_err());
    }

    #[test]
    fn test_scheduler_failure_blocks_dependents() {
        let mut scheduler = Scheduler::new();
        scheduler.add_node("a", 0, deps(&[])).unwrap();
        scheduler.add_node("b", 1, deps(&["a"])).unwrap();
        scheduler.take_ready();

        scheduler.mark_failed("a").unwrap();
        assert!(scheduler.failed.contains("a"));
        assert!(scheduler.take_ready().is_empty());
        assert!(scheduler.is_idle());
        assert!(!scheduler.completed.contains("b"));
    }

    #[test]
    fn test_scheduler_releases_in_plan_order() {
        let mut scheduler = Scheduler::new();
        scheduler.add_node("late", 5, deps(&[])).unwrap();
        scheduler.add_node("early", 1, deps(&[])).unwrap();
        scheduler.add_node("middle", 3, deps(&[])).unwrap();

        assert_eq!(scheduler.take_ready(), vec!["early", "middle", "late"]);
    }

    #[test]
    fn test_scheduler_unknown_node() {
        let mut scheduler = Scheduler::new();
        assert!(matches!(
            scheduler.mark_complete("ghost"),
            Err(ScheduleError::UnknownNode { .. })
        ));
    }
}
