//! Error types for Flowline

use thiserror::Error;

/// Result type alias for Flowline operations
pub type Result<T> = std::result::Result<T, FlowError>;

/// Main error type for Flowline
#[derive(Error, Debug)]
pub enum FlowError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// A collection-level rule failed; the run is aborted and no package is written
    #[error("Rule '{rule}' violated: {message}")]
    RuleViolation { rule: String, message: String },

    #[error("Commit failed: {0}")]
    Commit(String),

    #[error("Storage error: {0}")]
    Storage(String),

    /// Write-once document already present at this key
    #[error("Document already exists: {0}")]
    AlreadyExists(String),

    #[error("Unknown controller kind: {0}")]
    UnknownController(String),

    /// Run aborted by a record failure under the abort-on-first-error policy
    #[error("Run aborted: {0}")]
    Aborted(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FlowError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a rule violation error
    pub fn rule_violation(rule: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RuleViolation {
            rule: rule.into(),
            message: message.into(),
        }
    }

    /// Whether this error is a collection-level rule failure
    pub fn is_rule_violation(&self) -> bool {
        matches!(self, Self::RuleViolation { .. })
    }
}
