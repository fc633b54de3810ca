//! Wire protocol types for remote invocation and state streaming.
//!
//! Every unit of traffic is an [`Envelope`]: a tagged JSON union with a
//! `type` discriminator. Bytes fields are base64, UUIDs are canonical
//! 36-char, timestamps are RFC 3339 UTC.

use crate::error::WireError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use time::OffsetDateTime;
use uuid::Uuid;

/// Longest accepted actor identifier, in bytes.
pub const MAX_ACTOR_ID_BYTES: usize = 256;

/// Targets with this prefix open a state stream instead of an RPC.
pub const OBSERVE_PREFIX: &str = "observe";

/// Stable identity of an actor, optionally carrying a transport hint.
///
/// Equality and hashing cover all three fields; the wire form carries all
/// three as well.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActorId {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl ActorId {
    /// An identity with no transport hint.
    pub fn named(id: impl Into<String>) -> Result<Self, WireError> {
        let id = id.into();
        validate_actor_id(&id)?;
        Ok(Self {
            id,
            host: None,
            port: None,
        })
    }

    /// A process-local identity with a generated unique id.
    pub fn local() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            host: None,
            port: None,
        }
    }

    pub fn with_endpoint(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = Some(host.into());
        self.port = Some(port);
        self
    }
}

impl std::fmt::Display for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.host, self.port) {
            (Some(host), Some(port)) => write!(f, "{}@{}:{}", self.id, host, port),
            (Some(host), None) => write!(f, "{}@{}", self.id, host),
            _ => f.write_str(&self.id),
        }
    }
}

fn validate_actor_id(id: &str) -> Result<(), WireError> {
    if id.is_empty() {
        return Err(WireError::InvalidActorId {
            reason: "empty identifier".to_string(),
        });
    }
    if id.len() > MAX_ACTOR_ID_BYTES {
        return Err(WireError::InvalidActorId {
            reason: format!("identifier exceeds {} bytes", MAX_ACTOR_ID_BYTES),
        });
    }
    Ok(())
}

/// Trace propagation context carried inside each envelope.
///
/// 128-bit trace id and 64-bit span ids, hex-encoded on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    #[serde(rename = "traceID", with = "hex_u128")]
    pub trace_id: u128,
    #[serde(rename = "spanID", with = "hex_u64")]
    pub span_id: u64,
    #[serde(
        rename = "parentSpanID",
        default,
        with = "hex_u64_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub parent_span_id: Option<u64>,
}

impl TraceContext {
    /// A fresh root context.
    pub fn root() -> Self {
        let id = Uuid::new_v4();
        let (hi, lo) = id.as_u64_pair();
        Self {
            trace_id: id.as_u128(),
            span_id: hi ^ lo,
            parent_span_id: None,
        }
    }

    /// A child context under `self`, keeping the trace id.
    pub fn child(&self) -> Self {
        let (hi, lo) = Uuid::new_v4().as_u64_pair();
        Self {
            trace_id: self.trace_id,
            span_id: hi ^ lo,
            parent_span_id: Some(self.span_id),
        }
    }
}

/// Server-side stream filter selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Filter {
    /// Every payload passes.
    All,
    /// One of the built-in filters, by wire name.
    Predefined {
        name: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        params: HashMap<String, String>,
    },
    /// Opaque bytes delegated to the actor's filter hook.
    Custom {
        #[serde(with = "b64")]
        data: Vec<u8>,
    },
}

impl Filter {
    pub fn changed() -> Self {
        Filter::Predefined {
            name: "changed".to_string(),
            params: HashMap::new(),
        }
    }

    pub fn non_empty() -> Self {
        Filter::Predefined {
            name: "nonEmpty".to_string(),
            params: HashMap::new(),
        }
    }

    pub fn threshold(operator: &str, value: f64, field: Option<&str>) -> Self {
        let mut params = HashMap::new();
        params.insert("operator".to_string(), operator.to_string());
        params.insert("value".to_string(), value.to_string());
        if let Some(field) = field {
            params.insert("field".to_string(), field.to_string());
        }
        Filter::Predefined {
            name: "threshold".to_string(),
            params,
        }
    }
}

/// Why a stream closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StreamEndReason {
    Completed,
    Error,
    Cancelled,
}

fn default_protocol_version() -> u32 {
    1
}

/// A method or stream invocation sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationEnvelope {
    #[serde(rename = "callID")]
    pub call_id: Uuid,
    #[serde(rename = "actorID")]
    pub actor_id: ActorId,
    #[serde(rename = "targetIdentifier")]
    pub target: String,
    #[serde(rename = "protocolVersion", default = "default_protocol_version")]
    pub protocol_version: u32,
    #[serde(
        rename = "genericSubstitutions",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub generic_substitutions: Vec<String>,
    #[serde(default, with = "b64_list")]
    pub arguments: Vec<Vec<u8>>,
    #[serde(
        rename = "streamFilter",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub stream_filter: Option<Filter>,
    #[serde(
        rename = "traceContext",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub trace_context: Option<TraceContext>,
}

impl InvocationEnvelope {
    pub fn new(call_id: Uuid, actor_id: ActorId, target: impl Into<String>) -> Self {
        Self {
            call_id,
            actor_id,
            target: target.into(),
            protocol_version: default_protocol_version(),
            generic_substitutions: Vec::new(),
            arguments: Vec::new(),
            stream_filter: None,
            trace_context: None,
        }
    }

    /// `observe*` targets open a stream rather than a unary call.
    pub fn is_stream_target(&self) -> bool {
        self.target.starts_with(OBSERVE_PREFIX)
    }
}

/// Outcome of a unary invocation. Exactly one of `result` and
/// `error_message` is present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(rename = "callID")]
    pub call_id: Uuid,
    #[serde(default, with = "b64_opt", skip_serializing_if = "Option::is_none")]
    pub result: Option<Vec<u8>>,
    #[serde(
        rename = "errorMessage",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub error_message: Option<String>,
}

impl ResponseEnvelope {
    pub fn success(call_id: Uuid, result: Vec<u8>) -> Self {
        Self {
            call_id,
            result: Some(result),
            error_message: None,
        }
    }

    pub fn failure(call_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            call_id,
            result: None,
            error_message: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error_message.is_none()
    }
}

/// Announces a server-chosen stream id for the originating call.
///
/// When the start answers a [`StreamResumeEnvelope`] whose replay buffer
/// has expired, `call_id` carries the *old* stream id so the client can
/// correlate the restarted stream with its resume request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamStartEnvelope {
    #[serde(rename = "streamID")]
    pub stream_id: Uuid,
    #[serde(rename = "callID")]
    pub call_id: Uuid,
}

/// One emitted stream value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDataEnvelope {
    #[serde(rename = "streamID")]
    pub stream_id: Uuid,
    #[serde(rename = "sequenceNumber")]
    pub sequence_number: u64,
    #[serde(with = "b64")]
    pub data: Vec<u8>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Orderly close of a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEndEnvelope {
    #[serde(rename = "streamID")]
    pub stream_id: Uuid,
    pub reason: StreamEndReason,
}

/// Stream terminated by a method error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamErrorEnvelope {
    #[serde(rename = "streamID")]
    pub stream_id: Uuid,
    #[serde(rename = "errorMessage")]
    pub error_message: String,
}

/// Client request to continue a stream after reconnecting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamResumeEnvelope {
    #[serde(rename = "streamID")]
    pub stream_id: Uuid,
    #[serde(rename = "lastSequence")]
    pub last_sequence: u64,
    #[serde(rename = "actorID")]
    pub actor_id: ActorId,
    #[serde(rename = "targetIdentifier")]
    pub target: String,
}

/// The wire envelope union.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    #[serde(rename = "invocation")]
    Invocation(InvocationEnvelope),
    #[serde(rename = "response")]
    Response(ResponseEnvelope),
    #[serde(rename = "streamStart")]
    StreamStart(StreamStartEnvelope),
    #[serde(rename = "streamData")]
    StreamData(StreamDataEnvelope),
    #[serde(rename = "streamEnd")]
    StreamEnd(StreamEndEnvelope),
    #[serde(rename = "streamError")]
    StreamError(StreamErrorEnvelope),
    #[serde(rename = "streamResume")]
    StreamResume(StreamResumeEnvelope),
}

impl Envelope {
    /// Wire discriminator, for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Invocation(_) => "invocation",
            Self::Response(_) => "response",
            Self::StreamStart(_) => "streamStart",
            Self::StreamData(_) => "streamData",
            Self::StreamEnd(_) => "streamEnd",
            Self::StreamError(_) => "streamError",
            Self::StreamResume(_) => "streamResume",
        }
    }
}

/// Serialize an envelope to its wire bytes.
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, WireError> {
    serde_json::to_vec(envelope).map_err(|e| WireError::Encode(e.to_string()))
}

/// Parse and validate one wire frame.
///
/// Unknown discriminators and malformed bodies surface as
/// [`WireError::Protocol`]; actor identifiers are checked against the
/// length and non-emptiness invariants.
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, WireError> {
    let envelope: Envelope =
        serde_json::from_slice(bytes).map_err(|e| WireError::Protocol(e.to_string()))?;
    match &envelope {
        Envelope::Invocation(inv) => validate_actor_id(&inv.actor_id.id)?,
        Envelope::StreamResume(resume) => validate_actor_id(&resume.actor_id.id)?,
        _ => {}
    }
    Ok(envelope)
}

/// Base64 codec for bytes fields.
pub mod b64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.as_bytes()).map_err(Error::custom)
    }
}

mod b64_opt {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => STANDARD
                .decode(encoded.as_bytes())
                .map(Some)
                .map_err(Error::custom),
            None => Ok(None),
        }
    }
}

mod b64_list {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::ser::SerializeSeq;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(
        list: &[Vec<u8>],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(list.len()))?;
        for bytes in list {
            seq.serialize_element(&STANDARD.encode(bytes))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<Vec<u8>>, D::Error> {
        let encoded = Vec::<String>::deserialize(deserializer)?;
        encoded
            .into_iter()
            .map(|item| STANDARD.decode(item.as_bytes()).map_err(Error::custom))
            .collect()
    }
}

mod hex_u128 {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{:032x}", value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        let hex = String::deserialize(deserializer)?;
        u128::from_str_radix(&hex, 16).map_err(Error::custom)
    }
}

mod hex_u64 {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{:016x}", value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let hex = String::deserialize(deserializer)?;
        u64::from_str_radix(&hex, 16).map_err(Error::custom)
    }
}

mod hex_u64_opt {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(
        value: &Option<u64>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(value) => serializer.serialize_some(&format!("{:016x}", value)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<u64>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(hex) => u64::from_str_radix(&hex, 16).map(Some).map_err(Error::custom),
            None => Ok(None),
        }
    }
}
