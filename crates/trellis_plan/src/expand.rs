//! Node collection and expansion.
//!
//! Collection walks modules in composition order. Expansion then runs
//! three pure passes per logical node, always in this order:
//! conditional selection, parameterization, column extraction.

use crate::dag::{Node, NodeOrigin};
use crate::error::GraphError;
use crate::module::NodeModule;
use crate::node::{Binding, InputSource, NodeDef, NodeInputs, ParamSets};
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::Arc;
use trellis_core::{NodeError, NodeValue};

static NODE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$")
        .unwrap_or_else(|_| panic!("static regex NODE_NAME failed to compile"))
});

static INSTANCE_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9_]+$")
        .unwrap_or_else(|_| panic!("static regex INSTANCE_KEY failed to compile"))
});

/// Every definition of one logical name, from the module that owns it
#[derive(Debug, Clone)]
pub struct VariantGroup {
    /// Contributing module
    pub module: String,
    /// Definitions, conditional or not
    pub variants: Vec<NodeDef>,
}

/// Gather definitions by logical name.
///
/// A module contributing a name already collected from an earlier module
/// replaces that group entirely. Helpers are skipped.
///
/// # Errors
///
/// Returns error if a name is not a valid identifier
pub fn collect(modules: &[Arc<NodeModule>]) -> Result<IndexMap<String, VariantGroup>, GraphError> {
    let mut groups: IndexMap<String, VariantGroup> = IndexMap::new();

    for module in modules {
        let mut local: IndexMap<String, Vec<NodeDef>> = IndexMap::new();
        for def in module.collectable() {
            if !NODE_NAME.is_match(&def.name) {
                return Err(GraphError::InvalidName(def.name.clone()));
            }
            local.entry(def.name.clone()).or_default().push(def.clone());
        }

        for (name, variants) in local {
            let group = VariantGroup {
                module: module.name.clone(),
                variants,
            };
            if let Some(previous) = groups.insert(name.clone(), group) {
                tracing::warn!(
                    node = %name,
                    shadowed = %previous.module,
                    by = %module.name,
                    "Node defined in multiple modules; later module wins"
                );
            }
        }
    }

    Ok(groups)
}

/// Pick the single definition that applies under `config`.
///
/// A matching predicated variant beats the unconditioned base.
///
/// # Errors
///
/// Returns error if several variants match or none applies
pub fn select_variant(
    name: &str,
    group: &VariantGroup,
    config: &Map<String, Value>,
) -> Result<NodeDef, GraphError> {
    let mut matched = Vec::new();
    let mut bases = Vec::new();
    for def in &group.variants {
        match &def.predicate {
            Some(predicate) if predicate.matches(config) => matched.push(def),
            Some(_) => {}
            None => bases.push(def),
        }
    }

    match (matched.as_slice(), bases.as_slice()) {
        ([one], _) => Ok((*one).clone()),
        ([], [base]) => Ok((*base).clone()),
        ([], []) => Err(GraphError::MissingVariant {
            name: name.to_string(),
        }),
        ([], _) => Err(GraphError::DuplicateNode {
            name: name.to_string(),
        }),
        (many, _) => Err(GraphError::AmbiguousVariant {
            name: name.to_string(),
            matches: many.len(),
        }),
    }
}

/// Materialize concrete nodes for one selected definition.
///
/// Untemplated definitions yield exactly one node.
///
/// # Errors
///
/// Returns error if parameter sets are malformed or missing
pub fn parameterize(
    def: &NodeDef,
    module: &str,
    params: &Map<String, Value>,
) -> Result<Vec<Node>, GraphError> {
    let Some(sets) = &def.params else {
        let inputs = def
            .inputs
            .iter()
            .map(|input| (input.clone(), InputSource::Node(input.clone())))
            .collect();
        return Ok(vec![concrete(def, module, def.name.clone(), inputs, NodeOrigin::Defined)]);
    };

    let invalid = |reason: String| GraphError::InvalidParameterization {
        node: def.name.clone(),
        reason,
    };

    let sets: Vec<(String, IndexMap<String, Binding>)> = match sets {
        ParamSets::Literal(sets) => sets.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        ParamSets::FromParams(path) => {
            let found = lookup(params, path)
                .ok_or_else(|| invalid(format!("params path '{}' not found", path)))?;
            let Value::Object(entries) = found else {
                return Err(invalid(format!("params path '{}' is not an object", path)));
            };
            entries
                .iter()
                .map(|(key, fields)| match fields {
                    Value::Object(fields) => Ok((
                        key.clone(),
                        fields
                            .iter()
                            .map(|(input, v)| (input.clone(), Binding::Value(v.clone())))
                            .collect(),
                    )),
                    _ => Err(invalid(format!("entry '{}' is not an object", key))),
                })
                .collect::<Result<_, _>>()?
        }
    };

    if sets.is_empty() {
        return Err(invalid("no parameter sets".to_string()));
    }

    let mut nodes = Vec::with_capacity(sets.len());
    for (key, bindings) in sets {
        if !INSTANCE_KEY.is_match(&key) {
            return Err(invalid(format!("'{}' is not a valid instance key", key)));
        }
        if let Some(unknown) = bindings.keys().find(|input| !def.inputs.contains(input)) {
            return Err(invalid(format!("'{}' is not a declared input", unknown)));
        }

        let inputs = def
            .inputs
            .iter()
            .map(|input| {
                let source = match bindings.get(input) {
                    Some(Binding::Value(v)) => InputSource::Literal(v.clone()),
                    Some(Binding::Source(node)) => InputSource::Node(node.clone()),
                    None => InputSource::Node(input.clone()),
                };
                (input.clone(), source)
            })
            .collect();

        let origin = NodeOrigin::Parameterized {
            template: def.name.clone(),
            key: key.clone(),
        };
        nodes.push(concrete(def, module, format!("{}.{}", def.name, key), inputs, origin));
    }
    Ok(nodes)
}

/// Sibling nodes exposing the declared columns of `parent`.
///
/// Column nodes are named by the column, or `<instance>.<column>` when
/// the parent is a parameterized instance.
///
/// # Errors
///
/// Returns error if a column name is not a valid identifier
pub fn extract_columns(parent: &Node, columns: &[String]) -> Result<Vec<Node>, GraphError> {
    let mut siblings = Vec::with_capacity(columns.len());
    for column in columns {
        if !NODE_NAME.is_match(column) {
            return Err(GraphError::InvalidName(column.clone()));
        }
        let name = match parent.origin {
            NodeOrigin::Parameterized { .. } => format!("{}.{}", parent.name, column),
            _ => column.clone(),
        };

        let source = parent.name.clone();
        let col = column.clone();
        siblings.push(Node {
            name,
            inputs: vec![(parent.name.clone(), InputSource::Node(parent.name.clone()))],
            func: Arc::new(move |inputs: &NodeInputs| column_of(inputs.get(&source)?, &col)),
            tags: parent.tags.clone(),
            origin: NodeOrigin::Column {
                parent: parent.name.clone(),
                column: column.clone(),
            },
            module: parent.module.clone(),
        });
    }
    Ok(siblings)
}

/// Pull one column out of a table: an object of columns, or an array of
/// row objects
fn column_of(table: &NodeValue, column: &str) -> Result<NodeValue, NodeError> {
    let missing = || NodeError::key(format!("column '{}' not found", column));
    match table.as_data() {
        Some(Value::Object(columns)) => columns
            .get(column)
            .cloned()
            .map(NodeValue::Data)
            .ok_or_else(missing),
        Some(Value::Array(rows)) => rows
            .iter()
            .map(|row| row.get(column).cloned().ok_or_else(missing))
            .collect::<Result<Vec<_>, _>>()
            .map(|cells| NodeValue::Data(Value::Array(cells))),
        _ => Err(NodeError::type_mismatch(format!(
            "cannot extract column '{}' from {}",
            column,
            table.type_label()
        ))),
    }
}

fn concrete(
    def: &NodeDef,
    module: &str,
    name: String,
    inputs: Vec<(String, InputSource)>,
    origin: NodeOrigin,
) -> Node {
    Node {
        name,
        inputs,
        func: Arc::clone(&def.func),
        tags: def.tags.clone(),
        origin,
        module: module.to_string(),
    }
}

/// Dotted lookup into a JSON object
pub(crate) fn lookup<'a>(root: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let first = root.get(parts.next()?)?;
    parts.try_fold(first, |value, part| value.get(part))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop(name: &str, inputs: &[&str]) -> NodeDef {
        NodeDef::new(name, inputs.iter().copied(), |_| Ok(NodeValue::null()))
    }

    fn map(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => Map::new(),
        }
    }

    #[test]
    fn test_later_module_shadows() {
        let base = Arc::new(NodeModule::new("base").node(noop("load", &["path"])));
        let custom = Arc::new(NodeModule::new("custom").node(noop("load", &["url"])));

        let groups = collect(&[base, custom]).unwrap();
        let group = &groups["load"];
        assert_eq!(group.module, "custom");
        assert_eq!(group.variants[0].inputs, vec!["url"]);
    }

    #[test]
    fn test_invalid_name_rejected() {
        let module = Arc::new(NodeModule::new("m").node(noop("bad-name", &[])));
        assert_eq!(
            collect(&[module]).unwrap_err(),
            GraphError::InvalidName("bad-name".to_string())
        );
    }

    #[test]
    fn test_matching_variant_beats_base() {
        let group = VariantGroup {
            module: "m".into(),
            variants: vec![
                noop("database_connection", &["dsn"]),
                noop("database_connection", &["pool"]).when([("environment", json!("production"))]),
            ],
        };
        let prod = select_variant("database_connection", &group, &map(json!({"environment": "production"})))
            .unwrap();
        assert_eq!(prod.inputs, vec!["pool"]);

        let dev = select_variant("database_connection", &group, &map(json!({"environment": "dev"})))
            .unwrap();
        assert_eq!(dev.inputs, vec!["dsn"]);
    }

    #[test]
    fn test_missing_variant() {
        let group = VariantGroup {
            module: "m".into(),
            variants: vec![noop("db", &[]).when([("environment", json!("production"))])],
        };
        assert_eq!(
            select_variant("db", &group, &Map::new()).unwrap_err(),
            GraphError::MissingVariant { name: "db".into() }
        );
    }

    #[test]
    fn test_literal_parameterization() {
        let def = noop("totals", &["sales", "currency"]).parameterize([
            ("eu", vec![("currency", Binding::Value(json!("EUR")))]),
            (
                "us",
                vec![
                    ("currency", Binding::Value(json!("USD"))),
                    ("sales", Binding::Source("us_sales".into())),
                ],
            ),
        ]);
        let nodes = parameterize(&def, "m", &Map::new()).unwrap();
        let names: Vec<_> = nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["totals.eu", "totals.us"]);

        let deps: Vec<_> = nodes[1].dependencies().collect();
        assert_eq!(deps, vec!["us_sales"]);
        assert_eq!(nodes[0].dependencies().collect::<Vec<_>>(), vec!["sales"]);
    }

    #[test]
    fn test_parameterization_from_params() {
        let params = map(json!({"regions": {"eu": {"currency": "EUR"}, "us": {"currency": "USD"}}}));
        let def = noop("totals", &["sales", "currency"]).parameterize_from("regions");
        let nodes = parameterize(&def, "m", &params).unwrap();
        assert_eq!(nodes.len(), 2);
        assert!(matches!(
            &nodes[0].inputs[1].1,
            InputSource::Literal(v) if v == &json!("EUR")
        ));
    }

    #[test]
    fn test_parameterization_unknown_input() {
        let def = noop("totals", &["sales"])
            .parameterize([("eu", vec![("currency", Binding::Value(json!("EUR")))])]);
        assert!(matches!(
            parameterize(&def, "m", &Map::new()),
            Err(GraphError::InvalidParameterization { .. })
        ));
    }

    #[test]
    fn test_column_extraction_naming_and_values() {
        let def = noop("frame", &[]).extract_columns(["a", "b"]);
        let parent = parameterize(&def, "m", &Map::new()).unwrap().remove(0);
        let siblings = extract_columns(&parent, &def.columns).unwrap();
        assert_eq!(siblings[0].name, "a");

        let mut inputs = NodeInputs::new();
        inputs.insert("frame", NodeValue::data(json!([{"a": 1, "b": 2}, {"a": 3, "b": 4}])));
        let column = (siblings[1].func)(&inputs).unwrap();
        assert_eq!(column, NodeValue::data(json!([2, 4])));

        inputs.insert("frame", NodeValue::data(json!({"a": [1, 3]})));
        assert_eq!((siblings[1].func)(&inputs).unwrap_err().kind, "KeyError");
    }

    #[test]
    fn test_column_naming_for_instances() {
        let def = noop("frame", &["src"])
            .parameterize([("eu", vec![("src", Binding::Value(json!(1)))])])
            .extract_columns(["total"]);
        let parent = parameterize(&def, "m", &Map::new()).unwrap().remove(0);
        let siblings = extract_columns(&parent, &def.columns).unwrap();
        assert_eq!(siblings[0].name, "frame.eu.total");
    }
}
