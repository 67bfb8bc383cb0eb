//! # Actor Runtime Errors
//!
//! Error taxonomy for the mailbox and group lifecycle machinery. Subscription
//! errors are local and recoverable by the caller; construction errors abort
//! only the group being registered. Nothing here is fatal to the process.

use crate::registry::{ActorId, GroupId};
use thiserror::Error;

/// Errors produced by the actor runtime
#[derive(Debug, Error)]
pub enum ActorError {
    /// Subscribe called twice for the same (mailbox, type, subscriber)
    #[error("Duplicate subscription: {subscriber} to {message_type} on mailbox '{mailbox}'")]
    DuplicateSubscription {
        mailbox: String,
        message_type: &'static str,
        subscriber: ActorId,
    },

    /// A group member failed to initialize; the partial group was torn down
    #[error("Construction of group '{group}' failed at member #{member}: {source}")]
    Construction {
        group: String,
        member: usize,
        #[source]
        source: Box<ActorError>,
    },

    /// Child group registration against a parent that is not active
    #[error("Parent group {parent} is not active")]
    ParentNotActive { parent: GroupId },

    /// Envelope routed to a handler of a different message type
    #[error("Payload mismatch: handler expects {expected}, envelope carries {actual}")]
    PayloadMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    /// Actor-defined failure during construction or message handling
    #[error("Actor failed: {0}")]
    ActorFailed(String),

    /// Configuration loading or validation failure
    #[error("Configuration error: {0}")]
    Config(String),

    /// The growth/shrink scenario did not complete
    #[error("Scenario failed: {0}")]
    Scenario(String),
}

impl ActorError {
    /// Create an actor-defined failure
    pub fn actor_failed(msg: impl Into<String>) -> Self {
        ActorError::ActorFailed(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        ActorError::Config(msg.into())
    }

    /// Check if the caller can recover by retrying (e.g. with another identity)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ActorError::DuplicateSubscription { .. } | ActorError::ParentNotActive { .. }
        )
    }

    /// Short category name for structured logs
    pub fn category(&self) -> &'static str {
        match self {
            ActorError::DuplicateSubscription { .. } => "subscription",
            ActorError::Construction { .. } => "construction",
            ActorError::ParentNotActive { .. } => "lifecycle",
            ActorError::PayloadMismatch { .. } => "dispatch",
            ActorError::ActorFailed(_) => "actor",
            ActorError::Config(_) => "config",
            ActorError::Scenario(_) => "scenario",
        }
    }
}

/// Result type for actor runtime operations
pub type Result<T> = std::result::Result<T, ActorError>;
