//! Values produced and consumed by pipeline nodes.
//!
//! Portable values are plain JSON data and may cross any executor
//! boundary. Opaque values are arbitrary in-process objects (a database
//! handle, a model) and only travel through in-process backends.

use crate::error::SerializationError;
use crate::hash::Fingerprinter;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A value flowing along a graph edge
#[derive(Clone)]
pub enum NodeValue {
    /// Portable data
    Data(serde_json::Value),
    /// In-process object that cannot be serialized
    Opaque(OpaqueValue),
}

/// Type-erased in-process value
#[derive(Clone)]
pub struct OpaqueValue {
    type_name: &'static str,
    inner: Arc<dyn Any + Send + Sync>,
}

impl OpaqueValue {
    /// Name of the wrapped type
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl NodeValue {
    /// Wrap portable data
    #[must_use]
    pub fn data(value: impl Into<serde_json::Value>) -> Self {
        Self::Data(value.into())
    }

    /// Wrap an in-process object
    #[must_use]
    pub fn opaque<T: Any + Send + Sync>(value: T) -> Self {
        Self::Opaque(OpaqueValue {
            type_name: std::any::type_name::<T>(),
            inner: Arc::new(value),
        })
    }

    /// JSON null
    #[must_use]
    pub fn null() -> Self {
        Self::Data(serde_json::Value::Null)
    }

    /// Borrow the portable data, if any
    #[must_use]
    pub fn as_data(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Data(v) => Some(v),
            Self::Opaque(_) => None,
        }
    }

    /// Downcast an opaque value
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Self::Opaque(o) => o.inner.downcast_ref::<T>(),
            Self::Data(_) => None,
        }
    }

    /// Whether the value may cross a serialization boundary
    #[must_use]
    pub fn is_portable(&self) -> bool {
        matches!(self, Self::Data(_))
    }

    /// Short type description used in diagnostics
    #[must_use]
    pub fn type_label(&self) -> String {
        match self {
            Self::Data(serde_json::Value::Null) => "null".to_string(),
            Self::Data(serde_json::Value::Bool(_)) => "bool".to_string(),
            Self::Data(serde_json::Value::Number(_)) => "number".to_string(),
            Self::Data(serde_json::Value::String(_)) => "string".to_string(),
            Self::Data(serde_json::Value::Array(_)) => "array".to_string(),
            Self::Data(serde_json::Value::Object(_)) => "object".to_string(),
            Self::Opaque(o) => format!("opaque({})", o.type_name),
        }
    }

    /// Encode to the portable wire form
    ///
    /// # Errors
    ///
    /// Returns error for opaque values
    pub fn to_bytes(&self) -> Result<Vec<u8>, SerializationError> {
        match self {
            Self::Data(v) => Ok(serde_json::to_vec(v)?),
            Self::Opaque(o) => Err(SerializationError::new(
                format!("opaque({})", o.type_name),
                "in-process values cannot cross an executor boundary",
            )),
        }
    }

    /// Decode from the portable wire form
    ///
    /// # Errors
    ///
    /// Returns error if the bytes are not valid JSON
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SerializationError> {
        Ok(Self::Data(serde_json::from_slice(bytes)?))
    }

    /// Feed this value into a fingerprint
    pub fn fingerprint_into(&self, fp: &mut Fingerprinter) {
        match self {
            Self::Data(v) => {
                fp.update_str("data").update_json(v);
            }
            Self::Opaque(o) => {
                // Identity of the shared allocation; stable for the process lifetime
                let addr = Arc::as_ptr(&o.inner) as *const () as usize;
                fp.update_str("opaque")
                    .update_str(o.type_name)
                    .update_bytes(&addr.to_le_bytes());
            }
        }
    }
}

impl fmt::Debug for NodeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data(v) => write!(f, "Data({})", v),
            Self::Opaque(o) => write!(f, "Opaque({})", o.type_name),
        }
    }
}

impl PartialEq for NodeValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Data(a), Self::Data(b)) => a == b,
            (Self::Opaque(a), Self::Opaque(b)) => Arc::ptr_eq(&a.inner, &b.inner),
            _ => false,
        }
    }
}

impl From<serde_json::Value> for NodeValue {
    fn from(value: serde_json::Value) -> Self {
        Self::Data(value)
    }
}

impl From<i64> for NodeValue {
    fn from(value: i64) -> Self {
        Self::Data(value.into())
    }
}

impl From<f64> for NodeValue {
    fn from(value: f64) -> Self {
        Self::Data(value.into())
    }
}

impl From<bool> for NodeValue {
    fn from(value: bool) -> Self {
        Self::Data(value.into())
    }
}

impl From<&str> for NodeValue {
    fn from(value: &str) -> Self {
        Self::Data(value.into())
    }
}

impl From<String> for NodeValue {
    fn from(value: String) -> Self {
        Self::Data(value.into())
    }
}
