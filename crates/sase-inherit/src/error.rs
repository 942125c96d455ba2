//! Error types for the inheritance controller

use crate::model::GroupId;
use thiserror::Error;

/// Inheritance controller error type
#[derive(Error, Debug)]
pub enum InheritError {
    /// Malformed or incomplete policy document
    #[error("config validation error: {0}")]
    ConfigValidation(String),

    /// Transport failure reaching the fabric controller
    #[error("communication error: {0}")]
    Communication(String),

    /// Fabric state diverged from the snapshot a delta was computed from
    #[error("state conflict: {0}")]
    StateConflict(String),

    /// Policy entry names a group absent from the fetched snapshot
    #[error("unknown group: {0}")]
    UnknownGroup(GroupId),

    /// Credentials rejected by the fabric controller (single attempt)
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// Credentials rejected after the retry budget was exhausted
    #[error("fatal authentication error: {0}")]
    FatalAuth(String),

    /// Controller is shutting down
    #[error("controller shut down")]
    Shutdown,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl InheritError {
    /// Whether the operation that produced this error may be retried
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Communication(_) | Self::AuthRejected(_))
    }

    /// Whether this error must be surfaced to the operator-facing layer
    pub fn is_operator_facing(&self) -> bool {
        matches!(self, Self::ConfigValidation(_) | Self::FatalAuth(_))
    }
}

/// Result type for the inheritance controller
pub type Result<T> = std::result::Result<T, InheritError>;
