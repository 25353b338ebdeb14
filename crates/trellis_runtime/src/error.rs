//! Run errors.

use crate::retry::AttemptError;
use trellis_config::ConfigError;
use trellis_core::{NodeError, SerializationError};
use trellis_plan::{GraphError, ResolutionError};

/// Why a run did not produce its outputs
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RunError {
    /// Configuration could not be merged or validated
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Graph could not be built
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// Plan could not be resolved
    #[error("Resolution error: {0}")]
    Resolution(#[from] ResolutionError),

    /// A node failed after exhausting its retries
    #[error("Node '{node}' failed after {attempts} attempt(s): {source}")]
    Execution {
        /// Failing node
        node: String,
        /// Attempts made
        attempts: u32,
        /// Last error
        source: NodeError,
    },

    /// A value could not cross an executor boundary
    #[error("Node '{node}' could not be executed: {source}")]
    Serialization {
        /// Node whose inputs or output failed to encode
        node: String,
        /// Encoding error
        source: SerializationError,
    },

    /// The run was cancelled
    #[error("Run cancelled")]
    Cancelled,

    /// The blocking entry point could not start an async runtime
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl RunError {
    /// Wrap a node's final attempt error
    #[must_use]
    pub fn from_attempt(node: impl Into<String>, attempts: u32, error: AttemptError) -> Self {
        let node = node.into();
        match error {
            AttemptError::Node(source) => Self::Execution {
                node,
                attempts,
                source,
            },
            AttemptError::Serialization(source) => Self::Serialization { node, source },
        }
    }

    /// Node the error originated from, if any
    #[must_use]
    pub fn node(&self) -> Option<&str> {
        match self {
            Self::Execution { node, .. } | Self::Serialization { node, .. } => Some(node),
            _ => None,
        }
    }

    /// Attempts made by the failing node, if any
    #[must_use]
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::Execution { attempts, .. } => Some(*attempts),
            Self::Serialization { .. } => Some(1),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_error_carries_node_and_attempts() {
        let err = RunError::from_attempt(
            "fetch",
            4,
            AttemptError::Node(NodeError::timeout("gateway")),
        );
        assert_eq!(err.node(), Some("fetch"));
        assert_eq!(err.attempts(), Some(4));
        assert_eq!(
            err.to_string(),
            "Node 'fetch' failed after 4 attempt(s): TimeoutError: gateway"
        );
    }

    #[test]
    fn test_config_error_converts() {
        let err: RunError = ConfigError::UnknownOption("x".into()).into();
        assert!(matches!(err, RunError::Config(_)));
        assert_eq!(err.node(), None);
    }
}
