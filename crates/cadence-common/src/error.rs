//! Error types shared across cadence crates
//!
//! Errors carry enough context (field, component) to make a log line
//! actionable without a stack trace.

use thiserror::Error;

/// Main error type for cadence operations
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration or resource content
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The invalid field or variable (e.g., "spec.desired", "LOG_LEVEL")
        field: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Component where the error occurred (e.g., "Job", "conductor")
        context: String,
    },
}

impl Error {
    /// Create a validation error naming the offending field
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Get the field if this error names one
    pub fn field(&self) -> Option<&str> {
        match self {
            Error::Validation { field, .. } => field.as_deref(),
            _ => None,
        }
    }
}
