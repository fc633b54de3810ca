//! Structured error types for the runtime.
//!
//! Every variant carries typed context. Errors that reach a remote caller
//! are flattened into a failure [`ResponseEnvelope`](crate::wire::ResponseEnvelope)
//! (or a stream error frame) through [`DispatchError::to_failure_message`];
//! everything else stays inside the process.

use thiserror::Error;

/// Codec-level failures. Streaming transports log and drop these;
/// request/response transports reject the request.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum WireError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("invalid actor identifier: {reason}")]
    InvalidActorId { reason: String },
}

/// Failure raised by actor method bodies.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ActorError {
    #[error("{0}")]
    Method(String),

    #[error("unknown target: {target}")]
    UnknownTarget { target: String },

    #[error("unsupported generic substitution: {substitution}")]
    UnsupportedSubstitution { substitution: String },
}

impl ActorError {
    pub fn method(message: impl Into<String>) -> Self {
        ActorError::Method(message.into())
    }
}

/// Argument decoding failures. Surfaced to callers as failure responses
/// carrying the diagnostic, never as a successful call.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum DecodeError {
    #[error("expected {expected} arguments, got {actual}")]
    Arity { expected: usize, actual: usize },

    #[error("argument {index} does not match the expected type: {reason}")]
    Type { index: usize, reason: String },

    #[error("{remaining} arguments left undecoded")]
    Unconsumed { remaining: usize },
}

/// Everything the dispatch kernel can report about one invocation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DispatchError {
    #[error("Actor '{id}' not found")]
    ActorNotFound { id: String },

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("authorization denied: {0}")]
    Authorization(String),

    #[error("rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{0}")]
    Method(String),

    #[error("Server is shutting down")]
    ShuttingDown,

    #[error("internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    /// The message placed into a failure response envelope.
    pub fn to_failure_message(&self) -> String {
        self.to_string()
    }
}

impl From<ActorError> for DispatchError {
    fn from(e: ActorError) -> Self {
        DispatchError::Method(e.to_string())
    }
}

impl From<WireError> for DispatchError {
    fn from(e: WireError) -> Self {
        DispatchError::Validation(e.to_string())
    }
}

/// Transport adapter failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("write deadline exceeded after {seconds}s")]
    WriteTimeout { seconds: u64 },

    #[error("response already sent")]
    AlreadyResponded,

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}

/// Persistent state store failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum StateError {
    #[error("version conflict: expected {expected}, store has {actual}")]
    VersionConflict { expected: u64, actual: u64 },

    #[error("gave up after {attempts} attempts")]
    MaxRetriesExceeded { attempts: u32 },

    #[error("state backend error: {0}")]
    Backend(String),
}
