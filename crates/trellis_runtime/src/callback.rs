//! Lifecycle callbacks.
//!
//! Callbacks are registered under dotted identifiers and referenced from
//! configuration by name, together with fixed arguments.

use crate::engine::RunResult;
use crate::error::RunError;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use trellis_config::{CallbackSpec, ConfigError};

/// Invoked with the result of a successful run
pub type SuccessCallback = Arc<dyn Fn(&RunResult, &[Value], &Map<String, Value>) + Send + Sync>;

/// Invoked with the error of a failed run
pub type FailureCallback = Arc<dyn Fn(&RunError, &[Value], &Map<String, Value>) + Send + Sync>;

/// A callback together with the arguments configured for it
#[derive(Clone)]
pub struct Bound<C> {
    /// Identifier the callback was resolved from
    pub id: String,
    callback: C,
    args: Vec<Value>,
    kwargs: Map<String, Value>,
}

impl<C> fmt::Debug for Bound<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bound")
            .field("id", &self.id)
            .field("args", &self.args)
            .field("kwargs", &self.kwargs)
            .finish_non_exhaustive()
    }
}

impl Bound<SuccessCallback> {
    /// Fire the callback; a panicking callback is logged and swallowed
    pub fn fire(&self, result: &RunResult) {
        let call = AssertUnwindSafe(|| (self.callback)(result, &self.args, &self.kwargs));
        if std::panic::catch_unwind(call).is_err() {
            tracing::warn!(callback = %self.id, "Success callback panicked");
        }
    }
}

impl Bound<FailureCallback> {
    /// Fire the callback; a panicking callback is logged and swallowed
    pub fn fire(&self, error: &RunError) {
        let call = AssertUnwindSafe(|| (self.callback)(error, &self.args, &self.kwargs));
        if std::panic::catch_unwind(call).is_err() {
            tracing::warn!(callback = %self.id, "Failure callback panicked");
        }
    }
}

/// Callbacks available to runs, by identifier
#[derive(Clone, Default)]
pub struct CallbackRegistry {
    success: HashMap<String, SuccessCallback>,
    failure: HashMap<String, FailureCallback>,
}

impl CallbackRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a success callback
    pub fn register_success<F>(&mut self, id: impl Into<String>, callback: F)
    where
        F: Fn(&RunResult, &[Value], &Map<String, Value>) + Send + Sync + 'static,
    {
        self.success.insert(id.into(), Arc::new(callback));
    }

    /// Register a failure callback
    pub fn register_failure<F>(&mut self, id: impl Into<String>, callback: F)
    where
        F: Fn(&RunError, &[Value], &Map<String, Value>) + Send + Sync + 'static,
    {
        self.failure.insert(id.into(), Arc::new(callback));
    }

    /// Resolve a configured success callback
    ///
    /// # Errors
    ///
    /// Returns error if nothing is registered under the identifier
    pub fn resolve_success(&self, spec: &CallbackSpec) -> Result<Bound<SuccessCallback>, ConfigError> {
        Self::bind(&self.success, spec)
    }

    /// Resolve a configured failure callback
    ///
    /// # Errors
    ///
    /// Returns error if nothing is registered under the identifier
    pub fn resolve_failure(&self, spec: &CallbackSpec) -> Result<Bound<FailureCallback>, ConfigError> {
        Self::bind(&self.failure, spec)
    }

    fn bind<C: Clone>(table: &HashMap<String, C>, spec: &CallbackSpec) -> Result<Bound<C>, ConfigError> {
        let callback = table
            .get(&spec.function)
            .ok_or_else(|| ConfigError::UnknownCallback(spec.function.clone()))?;
        Ok(Bound {
            id: spec.function.clone(),
            callback: callback.clone(),
            args: spec.args.clone(),
            kwargs: spec.kwargs.clone(),
        })
    }
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut success: Vec<&str> = self.success.keys().map(String::as_str).collect();
        let mut failure: Vec<&str> = self.failure.keys().map(String::as_str).collect();
        success.sort_unstable();
        failure.sort_unstable();
        f.debug_struct("CallbackRegistry")
            .field("success", &success)
            .field("failure", &failure)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[test]
    fn test_unknown_callback() {
        let registry = CallbackRegistry::new();
        let err = registry
            .resolve_success(&CallbackSpec::new("hooks.notify"))
            .unwrap_err();
        assert_eq!(err, ConfigError::UnknownCallback("hooks.notify".into()));
    }

    #[test]
    fn test_failure_callback_receives_arguments() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = CallbackRegistry::new();
        let sink = Arc::clone(&seen);
        registry.register_failure("hooks.page", move |err, args, kwargs| {
            sink.lock().unwrap().push((err.to_string(), args.to_vec(), kwargs.clone()));
        });

        let mut spec = CallbackSpec::new("hooks.page");
        spec.args = vec![json!("oncall")];
        spec.kwargs.insert("severity".into(), json!(2));
        let bound = registry.resolve_failure(&spec).unwrap();
        bound.fire(&RunError::Cancelled);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "Run cancelled");
        assert_eq!(seen[0].1, vec![json!("oncall")]);
        assert_eq!(seen[0].2.get("severity"), Some(&json!(2)));
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let mut registry = CallbackRegistry::new();
        registry.register_failure("hooks.broken", |_, _, _| panic!("callback bug"));
        let bound = registry.resolve_failure(&CallbackSpec::new("hooks.broken")).unwrap();
        bound.fire(&RunError::Cancelled);
    }
}
