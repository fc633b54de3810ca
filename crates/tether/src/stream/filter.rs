//! Server-side stream filters.
//!
//! A filter is evaluated immediately before a payload is buffered and
//! encoded; a payload that fails is suppressed entirely and does not
//! advance the stream's sequence number. Unknown predefined names are
//! rejected when the stream opens, not silently per frame.

use crate::actor::RemoteActor;
use crate::error::DispatchError;
use crate::wire::Filter;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThresholdOp {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
    Neq,
}

impl ThresholdOp {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "gt" => Some(Self::Gt),
            "gte" => Some(Self::Gte),
            "lt" => Some(Self::Lt),
            "lte" => Some(Self::Lte),
            "eq" => Some(Self::Eq),
            "neq" => Some(Self::Neq),
            _ => None,
        }
    }

    fn compare(self, left: f64, right: f64) -> bool {
        match self {
            Self::Gt => left > right,
            Self::Gte => left >= right,
            Self::Lt => left < right,
            Self::Lte => left <= right,
            Self::Eq => left == right,
            Self::Neq => left != right,
        }
    }
}

#[derive(Debug)]
enum Mode {
    All,
    /// Drop byte-equal successors of the last *passed* payload.
    Changed { last_passed: Option<Vec<u8>> },
    NonEmpty,
    Threshold {
        op: ThresholdOp,
        value: f64,
        field: Option<String>,
    },
    /// Delegated to the actor's filter hook.
    Custom { data: Vec<u8> },
}

/// Per-stream filter state. Dropped with the stream, which is what clears
/// `changed` history on stream end.
#[derive(Debug)]
pub struct FilterState {
    mode: Mode,
}

impl FilterState {
    /// Build and validate the state for a stream's filter selection.
    pub fn new(filter: Option<&Filter>) -> Result<Self, DispatchError> {
        let mode = match filter {
            None | Some(Filter::All) => Mode::All,
            Some(Filter::Predefined { name, params }) => match name.as_str() {
                "changed" => Mode::Changed { last_passed: None },
                "nonEmpty" => Mode::NonEmpty,
                "threshold" => parse_threshold(params)?,
                other => {
                    return Err(DispatchError::Validation(format!(
                        "unknown predefined filter '{other}'"
                    )));
                }
            },
            Some(Filter::Custom { data }) => Mode::Custom { data: data.clone() },
        };
        Ok(Self { mode })
    }

    /// Whether `payload` should be emitted. Stateful modes update their
    /// history only when the payload passes.
    pub fn passes(&mut self, payload: &[u8], actor: &dyn RemoteActor) -> bool {
        match &mut self.mode {
            Mode::All => true,
            Mode::Changed { last_passed } => {
                if last_passed.as_deref() == Some(payload) {
                    false
                } else {
                    *last_passed = Some(payload.to_vec());
                    true
                }
            }
            Mode::NonEmpty => match serde_json::from_slice::<serde_json::Value>(payload) {
                Ok(serde_json::Value::Array(items)) => !items.is_empty(),
                Ok(serde_json::Value::Object(fields)) => !fields.is_empty(),
                Ok(serde_json::Value::String(text)) => !text.is_empty(),
                _ => true,
            },
            Mode::Threshold { op, value, field } => {
                extract_number(payload, field.as_deref())
                    .map(|extracted| op.compare(extracted, *value))
                    .unwrap_or(false)
            }
            Mode::Custom { data } => actor.custom_filter(data, payload),
        }
    }
}

fn parse_threshold(params: &HashMap<String, String>) -> Result<Mode, DispatchError> {
    let op = params
        .get("operator")
        .and_then(|name| ThresholdOp::parse(name))
        .ok_or_else(|| {
            DispatchError::Validation("threshold filter requires a valid 'operator'".to_string())
        })?;
    let value = params
        .get("value")
        .and_then(|raw| raw.parse::<f64>().ok())
        .ok_or_else(|| {
            DispatchError::Validation("threshold filter requires a numeric 'value'".to_string())
        })?;
    Ok(Mode::Threshold {
        op,
        value,
        field: params.get("field").cloned(),
    })
}

/// Pull a numeric value out of a JSON payload, optionally following a
/// dotted field path. Anything non-numeric fails closed.
fn extract_number(payload: &[u8], field: Option<&str>) -> Option<f64> {
    let mut value: serde_json::Value = serde_json::from_slice(payload).ok()?;
    if let Some(path) = field {
        for segment in path.split('.') {
            value = value.get_mut(segment)?.take();
        }
    }
    value.as_f64()
}
