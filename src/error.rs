//! Error types for the command hub.

use crate::types::{CommandId, DeviceId};
use thiserror::Error;

/// Main error type for hub operations.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Command {id} not found for device {device_id}")]
    NotFound { id: CommandId, device_id: DeviceId },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HubError {
    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HubError::Store(_))
    }
}

/// Errors raised by a [`CommandStore`](crate::store::CommandStore) implementation.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Write rejected: {0}")]
    Rejected(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Per-connection send failure. Logged and dropped, never returned to publishers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("connection buffer is full")]
    ConnectionFull,

    #[error("connection is closed")]
    ConnectionClosed,
}

impl<T> From<crossbeam_channel::TrySendError<T>> for DeliveryError {
    fn from(e: crossbeam_channel::TrySendError<T>) -> Self {
        match e {
            crossbeam_channel::TrySendError::Full(_) => DeliveryError::ConnectionFull,
            crossbeam_channel::TrySendError::Disconnected(_) => DeliveryError::ConnectionClosed,
        }
    }
}

/// Result type for hub operations.
pub type Result<T> = std::result::Result<T, HubError>;
