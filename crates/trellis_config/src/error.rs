//! Configuration errors.

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Malformed or contradictory configuration
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A document could not be parsed
    #[error("Failed to parse {origin}: {message}")]
    Parse {
        /// Document name or path
        origin: String,
        /// Parser message
        message: String,
    },

    /// A document could not be read
    #[error("Failed to read {path}: {message}")]
    Io {
        /// Path that was read
        path: String,
        /// OS error message
        message: String,
    },

    /// Option name not recognised
    #[error("Unknown option: {0}")]
    UnknownOption(String),

    /// Option present but its value is unusable
    #[error("Invalid value for {option}: {reason}")]
    InvalidValue {
        /// Option name, dotted for nested fields
        option: String,
        /// What is wrong with it
        reason: String,
    },

    /// Callback identifier not registered
    #[error("Unknown callback: {0}")]
    UnknownCallback(String),

    /// Module name not registered
    #[error("Unknown module: {0}")]
    UnknownModule(String),

    /// Executor kind with no available backend
    #[error("Unsupported executor: {0}")]
    UnsupportedExecutor(String),
}

impl ConfigError {
    /// Shorthand for [`ConfigError::InvalidValue`]
    pub fn invalid(option: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            option: option.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_value_display() {
        let err = ConfigError::invalid("retry.jitter_factor", "must be in [0, 1)");
        assert_eq!(
            err.to_string(),
            "Invalid value for retry.jitter_factor: must be in [0, 1)"
        );
    }
}
