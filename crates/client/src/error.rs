//! Client-side error type.

use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    /// The connection died; pending calls and stream queues are closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The server answered with a failure response.
    #[error("{0}")]
    Call(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid endpoint: {0}")]
    Endpoint(String),

    #[error("io error: {0}")]
    Io(String),
}
