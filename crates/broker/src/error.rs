//! Broker error types.

use thiserror::Error;

/// Failures in the connection index.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum BrokerError {
    #[error("connection '{connection_id}' is not registered")]
    NotRegistered { connection_id: String },

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Failures delivering to one connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SendError {
    /// The remote endpoint reports the client has vanished (the
    /// 410-equivalent). The broker reacts by unregistering; this never
    /// propagates past the fan-out.
    #[error("connection '{connection_id}' is gone")]
    Gone { connection_id: String },

    #[error("send failed: {0}")]
    Failed(String),
}
