//! Execution planning: the minimal ordered subgraph for requested outputs.

use crate::dag::NodeGraph;
use crate::error::ResolutionError;
use indexmap::{IndexMap, IndexSet};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Non-fatal diagnostic recorded while resolving
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanWarning {
    /// A literal input names no node and no external input
    UnusedInput(String),
}

/// Ordered work for one run
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    /// Graph the plan was resolved against
    pub graph: Arc<NodeGraph>,
    /// Requested outputs
    pub final_vars: Vec<String>,
    /// Nodes to compute, dependencies first
    pub order: Vec<String>,
    /// Literal inputs the plan reads
    pub literals: IndexSet<String>,
    /// For each computed node, the plan members it reads
    pub upstream: IndexMap<String, Vec<String>>,
    /// Diagnostics
    pub warnings: Vec<PlanWarning>,
}

impl ExecutionPlan {
    /// Computed nodes that read `name`
    #[must_use]
    pub fn downstream(&self, name: &str) -> Vec<&str> {
        self.upstream
            .iter()
            .filter(|(_, deps)| deps.iter().any(|d| d == name))
            .map(|(node, _)| node.as_str())
            .collect()
    }

    /// `names` plus every computed node downstream of them
    #[must_use]
    pub fn descendants<'a>(&'a self, names: impl IntoIterator<Item = &'a str>) -> IndexSet<&'a str> {
        let mut seen: IndexSet<&str> = IndexSet::new();
        let mut stack: Vec<&str> = names.into_iter().collect();
        while let Some(name) = stack.pop() {
            if seen.insert(name) {
                stack.extend(self.downstream(name));
            }
        }
        seen
    }

    /// Transitive plan members `name` reads, computed or literal
    #[must_use]
    pub fn ancestors(&self, name: &str) -> IndexSet<&str> {
        let mut seen: IndexSet<&str> = IndexSet::new();
        let mut stack: Vec<&str> = self
            .upstream
            .get(name)
            .map(|deps| deps.iter().map(String::as_str).collect())
            .unwrap_or_default();
        while let Some(dep) = stack.pop() {
            if seen.insert(dep) {
                if let Some(deps) = self.upstream.get(dep) {
                    stack.extend(deps.iter().map(String::as_str));
                }
            }
        }
        seen
    }

    /// Number of nodes to compute
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether nothing needs computing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Resolve the work needed to produce `final_vars`.
///
/// Names in `inputs` become literal sources: they are never computed and
/// their ancestors are not visited. The order is topological, with ties
/// broken by collection order.
///
/// # Errors
///
/// Returns error if an output names nothing known, or an external input
/// is needed but not supplied
pub fn resolve(
    graph: &Arc<NodeGraph>,
    final_vars: &[String],
    inputs: &IndexSet<String>,
) -> Result<ExecutionPlan, ResolutionError> {
    let mut warnings = Vec::new();
    for name in inputs {
        if graph.node(name).is_none() && !graph.external_inputs.contains(name) {
            tracing::warn!(input = %name, "Literal input matches no node");
            warnings.push(PlanWarning::UnusedInput(name.clone()));
        }
    }

    let mut literals = IndexSet::new();
    let mut upstream: IndexMap<String, Vec<String>> = IndexMap::new();

    // (name, requested by)
    let mut stack: Vec<(&str, Option<&str>)> =
        final_vars.iter().rev().map(|v| (v.as_str(), None)).collect();
    while let Some((name, required_by)) = stack.pop() {
        if inputs.contains(name) {
            literals.insert(name.to_string());
            continue;
        }
        if upstream.contains_key(name) {
            continue;
        }
        let Some(node) = graph.node(name) else {
            return Err(match required_by {
                None if !graph.external_inputs.contains(name) => ResolutionError::UnknownOutput {
                    name: name.to_string(),
                },
                _ => ResolutionError::MissingInput {
                    name: name.to_string(),
                    required_by: required_by.unwrap_or(name).to_string(),
                },
            });
        };
        let deps: Vec<String> = node.dependencies().map(str::to_string).collect();
        for dep in node.dependencies() {
            stack.push((dep, Some(node.name.as_str())));
        }
        upstream.insert(name.to_string(), deps);
    }

    let order = topological_order(graph, &upstream);
    tracing::debug!(
        outputs = ?final_vars,
        nodes = order.len(),
        literals = literals.len(),
        "Resolved execution plan"
    );

    Ok(ExecutionPlan {
        graph: Arc::clone(graph),
        final_vars: final_vars.to_vec(),
        order,
        literals,
        upstream,
        warnings,
    })
}

/// Kahn's algorithm over computed nodes; the ready set is keyed by
/// collection index
fn topological_order(graph: &NodeGraph, upstream: &IndexMap<String, Vec<String>>) -> Vec<String> {
    let mut pending: IndexMap<&str, usize> = upstream
        .iter()
        .map(|(name, deps)| {
            let computed = deps.iter().filter(|d| upstream.contains_key(d.as_str())).count();
            (name.as_str(), computed)
        })
        .collect();

    let mut ready: BTreeSet<(usize, &str)> = pending
        .iter()
        .filter(|(_, count)| **count == 0)
        .filter_map(|(name, _)| graph.index_of(name).map(|i| (i, *name)))
        .collect();

    let mut order = Vec::with_capacity(upstream.len());
    while let Some((_, name)) = ready.pop_first() {
        order.push(name.to_string());
        for (dependent, deps) in upstream {
            // a node may read the same upstream twice
            let hits = deps.iter().filter(|d| d.as_str() == name).count();
            if hits == 0 {
                continue;
            }
            if let Some(count) = pending.get_mut(dependent.as_str()) {
                *count -= hits;
                if *count == 0 {
                    if let Some(i) = graph.index_of(dependent) {
                        ready.insert((i, dependent.as_str()));
                    }
                }
            }
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::NodeModule;
    use crate::node::NodeDef;
    use proptest::prelude::*;
    use serde_json::Map;
    use trellis_core::NodeValue;

    fn noop(name: &str, inputs: &[&str]) -> NodeDef {
        NodeDef::new(name, inputs.iter().copied(), |_| Ok(NodeValue::null()))
    }

    fn graph(module: NodeModule) -> Arc<NodeGraph> {
        Arc::new(NodeGraph::build(&[Arc::new(module)], &Map::new(), &Map::new()).unwrap())
    }

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn sales() -> Arc<NodeGraph> {
        graph(
            NodeModule::new("sales")
                .node(noop("summary", &["daily_totals", "save_results"]))
                .node(noop("save_results", &["daily_totals"]))
                .node(noop("daily_totals", &["raw_sales"]))
                .node(noop("unrelated", &["raw_sales"])),
        )
    }

    #[test]
    fn test_summary_scenario_order() {
        let inputs: IndexSet<String> = ["raw_sales".to_string()].into_iter().collect();
        let plan = resolve(&sales(), &names(&["summary"]), &inputs).unwrap();
        assert_eq!(plan.order, names(&["daily_totals", "save_results", "summary"]));
        assert_eq!(plan.literals.iter().collect::<Vec<_>>(), vec!["raw_sales"]);
        assert!(plan.warnings.is_empty());
    }

    #[test]
    fn test_literal_short_circuits_ancestors() {
        let inputs: IndexSet<String> = ["daily_totals".to_string()].into_iter().collect();
        let plan = resolve(&sales(), &names(&["summary"]), &inputs).unwrap();
        assert_eq!(plan.order, names(&["save_results", "summary"]));
    }

    #[test]
    fn test_unknown_output() {
        let err = resolve(&sales(), &names(&["totals"]), &IndexSet::new()).unwrap_err();
        assert_eq!(err, ResolutionError::UnknownOutput { name: "totals".into() });
    }

    #[test]
    fn test_missing_external_input() {
        let err = resolve(&sales(), &names(&["summary"]), &IndexSet::new()).unwrap_err();
        assert_eq!(
            err,
            ResolutionError::MissingInput {
                name: "raw_sales".into(),
                required_by: "daily_totals".into()
            }
        );
    }

    #[test]
    fn test_unused_literal_is_warning() {
        let inputs: IndexSet<String> =
            ["raw_sales".to_string(), "typo".to_string()].into_iter().collect();
        let plan = resolve(&sales(), &names(&["daily_totals"]), &inputs).unwrap();
        assert_eq!(plan.warnings, vec![PlanWarning::UnusedInput("typo".into())]);
    }

    #[test]
    fn test_ties_follow_collection_order() {
        let g = graph(
            NodeModule::new("m")
                .node(noop("c", &[]))
                .node(noop("a", &[]))
                .node(noop("b", &[]))
                .node(noop("out", &["b", "a", "c"])),
        );
        let plan = resolve(&g, &names(&["out"]), &IndexSet::new()).unwrap();
        assert_eq!(plan.order, names(&["c", "a", "b", "out"]));
    }

    #[test]
    fn test_descendants_and_ancestors() {
        let inputs: IndexSet<String> = ["raw_sales".to_string()].into_iter().collect();
        let plan = resolve(&sales(), &names(&["summary"]), &inputs).unwrap();

        let desc: Vec<_> = plan.descendants(["save_results"]).into_iter().collect();
        assert_eq!(desc, vec!["save_results", "summary"]);

        let anc = plan.ancestors("summary");
        assert!(anc.contains("daily_totals"));
        assert!(anc.contains("raw_sales"));
        assert!(!anc.contains("summary"));
    }

    // Node i may depend on any node j < i, so every generated graph is acyclic
    fn arb_dag() -> impl Strategy<Value = Vec<Vec<usize>>> {
        (1usize..12).prop_flat_map(|n| {
            (0..n)
                .map(|i| prop::collection::vec(0..i.max(1), 0..=i.min(3)))
                .collect::<Vec<_>>()
        })
    }

    proptest! {
        #[test]
        fn prop_resolve_is_topological(deps in arb_dag(), shuffle in any::<u64>()) {
            let n = deps.len();
            // register in a scrambled order so collection order differs from index order
            let mut order: Vec<usize> = (0..n).collect();
            order.sort_by_key(|i| (i.wrapping_mul(2654435761) ^ shuffle as usize) % 1009);

            let module = order.iter().fold(NodeModule::new("random"), |m, &i| {
                let inputs: Vec<String> = deps[i].iter().map(|d| format!("n{}", d)).collect();
                m.node(NodeDef::new(format!("n{}", i), inputs, |_| Ok(NodeValue::null())))
            });
            let g = graph(module);
            let all: Vec<String> = (0..n).map(|i| format!("n{}", i)).collect();
            let plan = resolve(&g, &all, &IndexSet::new()).unwrap();

            prop_assert_eq!(plan.order.len(), n);
            let position: IndexMap<&str, usize> =
                plan.order.iter().enumerate().map(|(p, name)| (name.as_str(), p)).collect();
            for edge in &g.edges {
                prop_assert!(position[edge.from.as_str()] < position[edge.to.as_str()]);
            }
        }
    }
}
