//! The expanded node graph.
//!
//! Nodes are stored in collection order; that order breaks ties when the
//! resolver sorts a plan.

use crate::cache::GraphKey;
use crate::error::GraphError;
use crate::expand;
use crate::module::NodeModule;
use crate::node::{InputSource, NodeFn, NodeInputs};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use trellis_core::{NodeError, NodeValue};

/// How a concrete node came to exist
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeOrigin {
    /// Registered directly (possibly as the selected conditional variant)
    Defined,
    /// One instance of a parameterized template
    Parameterized {
        /// Template name
        template: String,
        /// Parameter-set key
        key: String,
    },
    /// One column of a tabular parent
    Column {
        /// Parent node
        parent: String,
        /// Column name
        column: String,
    },
}

/// A concrete node after expansion
#[derive(Clone)]
pub struct Node {
    /// Unique name
    pub name: String,
    /// Declared input name and where its value comes from
    pub inputs: Vec<(String, InputSource)>,
    /// Callable
    pub func: NodeFn,
    /// Metadata tags
    pub tags: Vec<String>,
    /// Expansion origin
    pub origin: NodeOrigin,
    /// Contributing module
    pub module: String,
}

impl Node {
    /// Names this node reads from other nodes or literal inputs
    pub fn dependencies(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().filter_map(|(_, source)| match source {
            InputSource::Node(name) => Some(name.as_str()),
            InputSource::Literal(_) => None,
        })
    }

    /// Build the argument set from upstream values
    ///
    /// # Errors
    ///
    /// Returns a `KeyError` if an upstream value is missing
    pub fn bind<F>(&self, mut upstream: F) -> Result<NodeInputs, NodeError>
    where
        F: FnMut(&str) -> Option<NodeValue>,
    {
        self.inputs
            .iter()
            .map(|(param, source)| {
                let value = match source {
                    InputSource::Literal(v) => NodeValue::Data(v.clone()),
                    InputSource::Node(name) => upstream(name).ok_or_else(|| {
                        NodeError::key(format!("no value for '{}' (input of '{}')", name, self.name))
                    })?,
                };
                Ok((param.clone(), value))
            })
            .collect()
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("tags", &self.tags)
            .field("origin", &self.origin)
            .field("module", &self.module)
            .finish_non_exhaustive()
    }
}

/// Dependency edge: `to` reads the output of `from`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    /// Upstream node
    pub from: String,
    /// Downstream node
    pub to: String,
}

/// A validated, acyclic node graph
#[derive(Debug, Clone)]
pub struct NodeGraph {
    /// Nodes in collection order
    pub nodes: IndexMap<String, Node>,
    /// All dependency edges between nodes
    pub edges: Vec<Edge>,
    /// Names read by nodes that no node produces
    pub external_inputs: IndexSet<String>,
    /// Identity of (modules, config, params)
    pub key: GraphKey,
}

impl NodeGraph {
    /// Collect, expand and validate.
    ///
    /// `modules` is in composition order: later modules shadow earlier ones.
    ///
    /// # Errors
    ///
    /// Returns error on invalid names, unresolved variants, bad
    /// parameterization, duplicate names or cycles
    pub fn build(
        modules: &[Arc<NodeModule>],
        config: &Map<String, Value>,
        params: &Map<String, Value>,
    ) -> Result<Self, GraphError> {
        let key = GraphKey::compute(modules, config, params);
        let groups = expand::collect(modules)?;

        let mut nodes: IndexMap<String, Node> = IndexMap::new();
        let mut push = |node: Node| -> Result<(), GraphError> {
            if nodes.contains_key(&node.name) {
                return Err(GraphError::DuplicateNode { name: node.name });
            }
            nodes.insert(node.name.clone(), node);
            Ok(())
        };

        for (name, group) in &groups {
            let def = expand::select_variant(name, group, config)?;
            for instance in expand::parameterize(&def, &group.module, params)? {
                let siblings = expand::extract_columns(&instance, &def.columns)?;
                push(instance)?;
                for sibling in siblings {
                    push(sibling)?;
                }
            }
        }

        let mut edges = Vec::new();
        let mut external_inputs = IndexSet::new();
        for node in nodes.values() {
            for dep in node.dependencies() {
                if nodes.contains_key(dep) {
                    edges.push(Edge {
                        from: dep.to_string(),
                        to: node.name.clone(),
                    });
                } else {
                    external_inputs.insert(dep.to_string());
                }
            }
        }

        let graph = Self {
            nodes,
            edges,
            external_inputs,
            key,
        };
        graph.check_cycles()?;

        tracing::debug!(
            graph = %graph.key,
            nodes = graph.nodes.len(),
            edges = graph.edges.len(),
            external = graph.external_inputs.len(),
            "Built node graph"
        );
        Ok(graph)
    }

    /// Depth-first search over dependencies, reporting the first cycle
    fn check_cycles(&self) -> Result<(), GraphError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            OnStack,
            Done,
        }

        let mut marks = vec![Mark::Unvisited; self.nodes.len()];
        for start in 0..self.nodes.len() {
            if marks[start] != Mark::Unvisited {
                continue;
            }
            // (node index, next dependency to visit)
            let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
            marks[start] = Mark::OnStack;

            while let Some(&(index, cursor)) = stack.last() {
                let next = self.nodes[index]
                    .dependencies()
                    .filter_map(|dep| self.nodes.get_index_of(dep))
                    .nth(cursor);
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }

                match next {
                    Some(dep) if marks[dep] == Mark::OnStack => {
                        let from = stack.iter().position(|&(i, _)| i == dep).unwrap_or(0);
                        let mut path: Vec<String> = stack[from..]
                            .iter()
                            .map(|&(i, _)| self.nodes[i].name.clone())
                            .collect();
                        path.push(self.nodes[dep].name.clone());
                        return Err(GraphError::Cycle { path });
                    }
                    Some(dep) if marks[dep] == Mark::Unvisited => {
                        marks[dep] = Mark::OnStack;
                        stack.push((dep, 0));
                    }
                    Some(_) => {}
                    None => {
                        marks[index] = Mark::Done;
                        stack.pop();
                    }
                }
            }
        }
        Ok(())
    }

    /// Get a node by name
    #[must_use]
    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    /// Collection index of a node
    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.nodes.get_index_of(name)
    }

    /// Nodes that read the given node
    #[must_use]
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.from == name)
            .map(|e| e.to.as_str())
            .collect()
    }

    /// Nodes the given node reads
    #[must_use]
    pub fn dependencies(&self, name: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.to == name)
            .map(|e| e.from.as_str())
            .collect()
    }

    /// Node names and edges, for structural comparison
    #[must_use]
    pub fn structure(&self) -> (Vec<&str>, &[Edge]) {
        (self.nodes.keys().map(String::as_str).collect(), &self.edges)
    }

    /// Get total node count
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}
