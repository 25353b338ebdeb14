//! Errors raised by node callables and by value encoding.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classifier that matches every node error in a retry policy.
pub const ANY_ERROR: &str = "Exception";

/// Failure reported by a node callable.
///
/// `kind` is the classifier retry policies match against, e.g. `TimeoutError`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeError {
    /// Error classifier
    pub kind: String,
    /// Human readable message
    pub message: String,
}

impl NodeError {
    /// Create an error with an explicit classifier
    #[must_use]
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// A `TimeoutError`
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new("TimeoutError", message)
    }

    /// A `ValueError`
    #[must_use]
    pub fn value(message: impl Into<String>) -> Self {
        Self::new("ValueError", message)
    }

    /// A `KeyError`
    #[must_use]
    pub fn key(message: impl Into<String>) -> Self {
        Self::new("KeyError", message)
    }

    /// A `TypeError`
    #[must_use]
    pub fn type_mismatch(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    /// Whether this error is matched by `classifier`
    #[must_use]
    pub fn matches(&self, classifier: &str) -> bool {
        classifier == ANY_ERROR || classifier == self.kind
    }
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for NodeError {}

/// A value could not be encoded to, or decoded from, its portable form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializationError {
    /// Type of the offending value
    pub value_type: String,
    /// Why encoding failed
    pub reason: String,
}

impl SerializationError {
    /// Create a serialization error
    #[must_use]
    pub fn new(value_type: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            value_type: value_type.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for SerializationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot serialize {}: {}", self.value_type, self.reason)
    }
}

impl std::error::Error for SerializationError {}

impl From<serde_json::Error> for SerializationError {
    fn from(err: serde_json::Error) -> Self {
        Self::new("json", err.to_string())
    }
}
