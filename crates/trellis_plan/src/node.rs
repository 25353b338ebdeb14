//! Node definitions as registered by users.

use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use trellis_core::{NodeError, NodeValue};

/// A node callable
pub type NodeFn = Arc<dyn Fn(&NodeInputs) -> Result<NodeValue, NodeError> + Send + Sync>;

/// Arguments handed to a node callable, keyed by declared input name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeInputs {
    values: IndexMap<String, NodeValue>,
}

impl NodeInputs {
    /// Create an empty set of inputs
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind an input
    pub fn insert(&mut self, name: impl Into<String>, value: NodeValue) {
        self.values.insert(name.into(), value);
    }

    /// Fetch an input
    ///
    /// # Errors
    ///
    /// Returns a `KeyError` if the input is not bound
    pub fn get(&self, name: &str) -> Result<&NodeValue, NodeError> {
        self.values
            .get(name)
            .ok_or_else(|| NodeError::key(format!("input '{}' is not bound", name)))
    }

    /// Fetch an input as portable data
    ///
    /// # Errors
    ///
    /// Returns a `KeyError` if unbound, a `TypeError` if opaque
    pub fn data(&self, name: &str) -> Result<&Value, NodeError> {
        let value = self.get(name)?;
        value.as_data().ok_or_else(|| {
            NodeError::type_mismatch(format!("input '{}' is {}", name, value.type_label()))
        })
    }

    /// Fetch a numeric input
    ///
    /// # Errors
    ///
    /// Returns a `KeyError` if unbound, a `TypeError` if not a number
    pub fn f64(&self, name: &str) -> Result<f64, NodeError> {
        self.data(name)?
            .as_f64()
            .ok_or_else(|| NodeError::type_mismatch(format!("input '{}' is not a number", name)))
    }

    /// Fetch an opaque input by type
    ///
    /// # Errors
    ///
    /// Returns a `KeyError` if unbound, a `TypeError` on type mismatch
    pub fn opaque<T: std::any::Any>(&self, name: &str) -> Result<&T, NodeError> {
        let value = self.get(name)?;
        value.downcast_ref::<T>().ok_or_else(|| {
            NodeError::type_mismatch(format!(
                "input '{}' is {}, expected {}",
                name,
                value.type_label(),
                std::any::type_name::<T>()
            ))
        })
    }

    /// Iterate bound inputs
    pub fn iter(&self) -> impl Iterator<Item = (&String, &NodeValue)> {
        self.values.iter()
    }

    /// Number of bound inputs
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether nothing is bound
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl FromIterator<(String, NodeValue)> for NodeInputs {
    fn from_iter<I: IntoIterator<Item = (String, NodeValue)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// Predicate over the run's `config` map selecting a conditional variant
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Every key equals the given value
    When(Map<String, Value>),
    /// No key equals the given value
    WhenNot(Map<String, Value>),
    /// Every key is one of the given values
    WhenIn(Map<String, Value>),
}

impl Predicate {
    /// Evaluate against a config map
    #[must_use]
    pub fn matches(&self, config: &Map<String, Value>) -> bool {
        match self {
            Self::When(expected) => expected.iter().all(|(k, v)| config.get(k) == Some(v)),
            Self::WhenNot(excluded) => excluded.iter().all(|(k, v)| config.get(k) != Some(v)),
            Self::WhenIn(allowed) => allowed.iter().all(|(k, options)| {
                let Some(actual) = config.get(k) else {
                    return false;
                };
                match options {
                    Value::Array(options) => options.contains(actual),
                    single => single == actual,
                }
            }),
        }
    }
}

/// How a parameterized input is bound
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    /// A literal value
    Value(Value),
    /// The output of another node, under this input's name
    Source(String),
}

/// Parameter sets for a templated node
#[derive(Debug, Clone, PartialEq)]
pub enum ParamSets {
    /// Instance key to input bindings
    Literal(IndexMap<String, IndexMap<String, Binding>>),
    /// Object at a dotted path in pipeline `params`; each entry's fields
    /// become literal bindings
    FromParams(String),
}

/// Where a concrete node input comes from
#[derive(Debug, Clone, PartialEq)]
pub enum InputSource {
    /// Output of the named node, or a literal input of that name
    Node(String),
    /// A value fixed at build time
    Literal(Value),
}

/// A node as registered in a module, before expansion
#[derive(Clone)]
pub struct NodeDef {
    /// Logical name
    pub name: String,
    /// Declared input names
    pub inputs: Vec<String>,
    /// Callable
    pub func: NodeFn,
    /// Metadata tags
    pub tags: Vec<String>,
    /// Conditional selection predicate
    pub predicate: Option<Predicate>,
    /// Parameter sets, if templated
    pub params: Option<ParamSets>,
    /// Columns exposed as sibling nodes
    pub columns: Vec<String>,
}

impl NodeDef {
    /// Define a node
    pub fn new<I, S, F>(name: impl Into<String>, inputs: I, func: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&NodeInputs) -> Result<NodeValue, NodeError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            inputs: inputs.into_iter().map(Into::into).collect(),
            func: Arc::new(func),
            tags: Vec::new(),
            predicate: None,
            params: None,
            columns: Vec::new(),
        }
    }

    /// Attach a tag
    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Select this variant when every pair equals the run config
    #[must_use]
    pub fn when<K, I>(mut self, pairs: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        self.predicate = Some(Predicate::When(collect_pairs(pairs)));
        self
    }

    /// Select this variant when no pair equals the run config
    #[must_use]
    pub fn when_not<K, I>(mut self, pairs: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        self.predicate = Some(Predicate::WhenNot(collect_pairs(pairs)));
        self
    }

    /// Select this variant when every key is one of the listed values
    #[must_use]
    pub fn when_in<K, I>(mut self, pairs: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        self.predicate = Some(Predicate::WhenIn(collect_pairs(pairs)));
        self
    }

    /// Materialize one instance per key, binding literals or sources
    #[must_use]
    pub fn parameterize<K, I>(mut self, sets: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Vec<(&'static str, Binding)>)>,
    {
        let sets = sets
            .into_iter()
            .map(|(key, bindings)| {
                let bindings = bindings
                    .into_iter()
                    .map(|(input, binding)| (input.to_string(), binding))
                    .collect();
                (key.into(), bindings)
            })
            .collect();
        self.params = Some(ParamSets::Literal(sets));
        self
    }

    /// Materialize one instance per entry of the object at `path` in
    /// pipeline params
    #[must_use]
    pub fn parameterize_from(mut self, path: impl Into<String>) -> Self {
        self.params = Some(ParamSets::FromParams(path.into()));
        self
    }

    /// Expose named columns of a tabular result as sibling nodes
    #[must_use]
    pub fn extract_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Whether the name marks a helper, never collected as a node
    #[must_use]
    pub fn is_helper(&self) -> bool {
        self.name.starts_with('_')
    }
}

impl fmt::Debug for NodeDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeDef")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("tags", &self.tags)
            .field("predicate", &self.predicate)
            .field("params", &self.params)
            .field("columns", &self.columns)
            .finish_non_exhaustive()
    }
}

fn collect_pairs<K: Into<String>>(pairs: impl IntoIterator<Item = (K, Value)>) -> Map<String, Value> {
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}
