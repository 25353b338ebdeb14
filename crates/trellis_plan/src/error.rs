//! Graph build and plan resolution errors.

/// Errors raised while building a graph
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    /// Dependencies form a cycle
    #[error("Cycle detected: {}", path.join(" -> "))]
    Cycle {
        /// Nodes on the cycle, first node repeated at the end
        path: Vec<String>,
    },

    /// More than one conditional variant matched
    #[error("Ambiguous variant for node '{name}': {matches} variants match the config")]
    AmbiguousVariant {
        /// Logical node name
        name: String,
        /// Number of matching variants
        matches: usize,
    },

    /// No conditional variant matched and there is no base
    #[error("No variant of node '{name}' matches the config")]
    MissingVariant {
        /// Logical node name
        name: String,
    },

    /// Two nodes share a name after expansion
    #[error("Duplicate node: {name}")]
    DuplicateNode {
        /// Node name
        name: String,
    },

    /// Parameter sets are malformed or cannot be found
    #[error("Invalid parameterization of '{node}': {reason}")]
    InvalidParameterization {
        /// Node being parameterized
        node: String,
        /// What went wrong
        reason: String,
    },

    /// Name is not a valid node identifier
    #[error("Invalid node name: '{0}'")]
    InvalidName(String),
}

/// Errors raised while resolving a plan
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolutionError {
    /// A requested output names nothing in the graph
    #[error("Unknown output: {name}")]
    UnknownOutput {
        /// Requested name
        name: String,
    },

    /// An external input is needed but was not supplied
    #[error("Missing input '{name}' required by '{required_by}'")]
    MissingInput {
        /// External input name
        name: String,
        /// Node (or output) that needs it
        required_by: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_display() {
        let err = GraphError::Cycle {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Cycle detected: a -> b -> a");
    }

    #[test]
    fn test_ambiguous_names_node() {
        let err = GraphError::AmbiguousVariant {
            name: "database_connection".into(),
            matches: 2,
        };
        assert!(err.to_string().contains("database_connection"));
    }
}
