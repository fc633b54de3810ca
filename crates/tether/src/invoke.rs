//! Typed bridge between the wire envelope and an actor method.
//!
//! Generated target code pulls arguments in declaration order from an
//! [`Arguments`] decoder and reports its outcome through a [`ResultSink`].
//! Three decoder backings exist: raw JSON bytes from an invocation
//! envelope (the main path), a single stream-frame payload (observe
//! introspection and resume), and plain in-memory values for tests.

use crate::error::DecodeError;
use crate::wire::ResponseEnvelope;
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

enum Backing {
    /// One raw JSON document per argument.
    Json(Vec<Vec<u8>>),
    /// The payload of a single stream frame.
    Frame(Option<Vec<u8>>),
    /// Pre-parsed values.
    Memory(Vec<serde_json::Value>),
}

/// Positional argument decoder.
pub struct Arguments {
    backing: Backing,
    cursor: usize,
}

impl Arguments {
    /// Decoder over the raw JSON argument list of an invocation envelope.
    pub fn json(raw: Vec<Vec<u8>>) -> Self {
        Self {
            backing: Backing::Json(raw),
            cursor: 0,
        }
    }

    /// Decoder over one stream frame payload.
    pub fn frame(payload: Vec<u8>) -> Self {
        Self {
            backing: Backing::Frame(Some(payload)),
            cursor: 0,
        }
    }

    /// Empty decoder, for targets that take no arguments.
    pub fn empty() -> Self {
        Self::json(Vec::new())
    }

    /// In-memory decoder for tests.
    pub fn values(values: Vec<serde_json::Value>) -> Self {
        Self {
            backing: Backing::Memory(values),
            cursor: 0,
        }
    }

    /// Total number of arguments carried.
    pub fn len(&self) -> usize {
        match &self.backing {
            Backing::Json(raw) => raw.len(),
            Backing::Frame(payload) => usize::from(payload.is_some()) + self.cursor,
            Backing::Memory(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Arguments not yet consumed.
    pub fn remaining(&self) -> usize {
        self.len() - self.cursor
    }

    /// Decode the next argument as `T`.
    pub fn next<T: DeserializeOwned>(&mut self) -> Result<T, DecodeError> {
        let index = self.cursor;
        let value = match &mut self.backing {
            Backing::Json(raw) => {
                let bytes = raw.get(index).ok_or(DecodeError::Arity {
                    expected: index + 1,
                    actual: raw.len(),
                })?;
                serde_json::from_slice(bytes).map_err(|e| DecodeError::Type {
                    index,
                    reason: e.to_string(),
                })?
            }
            Backing::Frame(payload) => {
                let bytes = payload.take().ok_or(DecodeError::Arity {
                    expected: index + 1,
                    actual: index,
                })?;
                serde_json::from_slice(&bytes).map_err(|e| DecodeError::Type {
                    index,
                    reason: e.to_string(),
                })?
            }
            Backing::Memory(values) => {
                let value = values.get(index).cloned().ok_or(DecodeError::Arity {
                    expected: index + 1,
                    actual: values.len(),
                })?;
                serde_json::from_value(value).map_err(|e| DecodeError::Type {
                    index,
                    reason: e.to_string(),
                })?
            }
        };
        self.cursor += 1;
        Ok(value)
    }

    /// Assert every argument was consumed; call after the last `next`.
    pub fn finish(&self) -> Result<(), DecodeError> {
        let remaining = self.remaining();
        if remaining > 0 {
            return Err(DecodeError::Unconsumed { remaining });
        }
        Ok(())
    }
}

/// Collects the single outcome of a target: a typed return value or an
/// error message. The second write wins over nothing; it is a bug for a
/// target to report twice, and the sink keeps the first outcome.
#[derive(Default)]
pub struct ResultSink {
    outcome: Option<Result<Vec<u8>, String>>,
}

impl ResultSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful, serializable return value.
    pub fn complete<T: Serialize>(&mut self, value: &T) -> Result<(), DecodeError> {
        let bytes = serde_json::to_vec(value).map_err(|e| DecodeError::Type {
            index: 0,
            reason: format!("result serialization: {e}"),
        })?;
        self.outcome.get_or_insert(Ok(bytes));
        Ok(())
    }

    /// Record an already-serialized return value.
    pub fn complete_raw(&mut self, bytes: Vec<u8>) {
        self.outcome.get_or_insert(Ok(bytes));
    }

    /// Record a failure.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.outcome.get_or_insert(Err(message.into()));
    }

    pub fn has_outcome(&self) -> bool {
        self.outcome.is_some()
    }

    /// The recorded outcome, if any.
    pub fn into_outcome(self) -> Option<Result<Vec<u8>, String>> {
        self.outcome
    }

    /// Shape the outcome as a wire response. A target that never reported
    /// is a method error.
    pub fn into_response(self, call_id: Uuid) -> ResponseEnvelope {
        match self.outcome {
            Some(Ok(bytes)) => ResponseEnvelope::success(call_id, bytes),
            Some(Err(message)) => ResponseEnvelope::failure(call_id, message),
            None => ResponseEnvelope::failure(call_id, "target produced no result"),
        }
    }
}
