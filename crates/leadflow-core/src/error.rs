//! Error type shared by every LeadFlow crate.

use thiserror::Error;

/// Errors raised by the transfer engine and its collaborators.
#[derive(Debug, Error)]
pub enum LeadFlowError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Rule not found: {0}")]
    RuleNotFound(String),

    #[error("Rule is disabled: {0}")]
    RuleDisabled(String),

    #[error("Permission denied: {0}")]
    Forbidden(String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Notification error: {0}")]
    Notify(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, LeadFlowError>;
