/// Domain module containing the core tracker entities
///
/// This module defines app usage records, productivity categories, custom
/// category mappings and focus sessions, together with their validation rules.
/// These types are what the storage layer hands back to callers: plain
/// serializable data, never backend handles.
pub mod category;
pub mod session;
pub mod types;
pub mod usage;

// Re-export public types for easy access
pub use category::*;
pub use session::*;
pub use types::*;
pub use usage::*;

use thiserror::Error;

/// Errors that can occur during domain operations
///
/// These are validation failures: they are raised before any I/O happens and
/// are never retried.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Invalid hour: {0} (expected 0-23)")]
    InvalidHour(i64),

    #[error("Invalid category type: {0}")]
    InvalidCategoryType(String),

    #[error("Invalid session status: {0}")]
    InvalidSessionStatus(String),

    #[error("Cannot {action} a session that is {status}")]
    InvalidTransition {
        action: &'static str,
        status: SessionStatus,
    },

    #[error("Invalid date: {0}")]
    InvalidDate(String),
}

impl DomainError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        DomainError::Validation {
            message: message.into(),
        }
    }
}
