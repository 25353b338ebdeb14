//! Node modules: named, versioned collections of node definitions.

use crate::node::NodeDef;

/// A named group of node definitions.
///
/// `revision` takes part in graph identity; bump it when the module's
/// definitions change so cached graphs are not reused.
#[derive(Debug, Clone)]
pub struct NodeModule {
    /// Module name
    pub name: String,
    /// Revision counter
    pub revision: u64,
    /// Definitions in registration order
    pub nodes: Vec<NodeDef>,
}

impl NodeModule {
    /// Create an empty module
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            revision: 0,
            nodes: Vec::new(),
        }
    }

    /// Add a definition
    #[must_use]
    pub fn node(mut self, def: NodeDef) -> Self {
        self.nodes.push(def);
        self
    }

    /// Set the revision
    #[must_use]
    pub fn revision(mut self, revision: u64) -> Self {
        self.revision = revision;
        self
    }

    /// Definitions that become graph nodes
    pub fn collectable(&self) -> impl Iterator<Item = &NodeDef> {
        self.nodes.iter().filter(|def| !def.is_helper())
    }
}
