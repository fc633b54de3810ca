//! Transport adapters.
//!
//! Every adapter — framed TCP, websocket, HTTP one-shot, in-memory —
//! yields the same shape into the server intake: a [`TransportMessage`]
//! carrying the raw frame and a [`Responder`] for writing back. Duplex
//! adapters hand out responders that can be called many times (streams);
//! connectionless adapters hand out one-shot responders.

pub mod http;
pub mod memory;
pub mod tcp;

use crate::error::TransportError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// How long an outbound frame may take before the write is abandoned.
pub const WRITE_DEADLINE_SECS: u64 = 30;

/// Idle duplex connections are closed after this long.
pub const IDLE_TIMEOUT_SECS: u64 = 300;

/// Write half of a transport, as seen by the dispatch side.
#[async_trait]
pub trait Respond: Send + Sync {
    /// Queue one encoded envelope for delivery.
    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError>;
}

/// Shared handle to a transport write half.
pub type Responder = Arc<dyn Respond>;

/// One inbound frame plus the way back.
pub struct TransportMessage {
    pub payload: Vec<u8>,
    /// Remote endpoint or connection id, where the adapter knows one.
    pub source: Option<String>,
    /// Adapter metadata (headers, query parameters) consumed by
    /// middleware, e.g. credential extraction.
    pub metadata: HashMap<String, String>,
    pub responder: Responder,
}

impl TransportMessage {
    pub fn new(payload: Vec<u8>, responder: Responder) -> Self {
        Self {
            payload,
            source: None,
            metadata: HashMap::new(),
            responder,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Responder backed by a connection writer task; usable any number of
/// times until the connection goes away.
pub struct ChannelResponder {
    tx: mpsc::Sender<Vec<u8>>,
}

impl ChannelResponder {
    pub fn new(tx: mpsc::Sender<Vec<u8>>) -> Responder {
        Arc::new(Self { tx })
    }
}

#[async_trait]
impl Respond for ChannelResponder {
    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| TransportError::Closed)
    }
}

/// Responder that accepts exactly one frame (HTTP request/response).
pub struct OneshotResponder {
    slot: parking_lot::Mutex<Option<oneshot::Sender<Vec<u8>>>>,
}

impl OneshotResponder {
    pub fn new() -> (Responder, oneshot::Receiver<Vec<u8>>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                slot: parking_lot::Mutex::new(Some(tx)),
            }),
            rx,
        )
    }
}

#[async_trait]
impl Respond for OneshotResponder {
    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        let sender = self
            .slot
            .lock()
            .take()
            .ok_or(TransportError::AlreadyResponded)?;
        sender.send(frame).map_err(|_| TransportError::Closed)
    }
}

/// Responder that drops every frame; used when tearing a connection down.
pub struct NullResponder;

impl NullResponder {
    pub fn new() -> Responder {
        Arc::new(Self)
    }
}

#[async_trait]
impl Respond for NullResponder {
    async fn send(&self, _frame: Vec<u8>) -> Result<(), TransportError> {
        Err(TransportError::Closed)
    }
}
