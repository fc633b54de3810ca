//! In-memory duplex transport: both directions are channels.
//!
//! Used by the test suites and by embedded setups that host client and
//! server in one process.

use crate::error::TransportError;
use crate::transport::{ChannelResponder, Responder, TransportMessage};
use std::collections::HashMap;
use tokio::sync::mpsc;

const CONNECTION_BUFFER: usize = 64;

/// Client end of an in-memory connection.
pub struct MemoryConnection {
    intake: mpsc::Sender<TransportMessage>,
    responder: Responder,
    metadata: HashMap<String, String>,
    source: String,
}

impl MemoryConnection {
    /// Open a connection into a server intake. Returns the connection and
    /// the receiver of server→client frames.
    pub fn connect(intake: mpsc::Sender<TransportMessage>) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(CONNECTION_BUFFER);
        let connection = Self {
            intake,
            responder: ChannelResponder::new(tx),
            metadata: HashMap::new(),
            source: format!("memory:{}", uuid::Uuid::new_v4()),
        };
        (connection, rx)
    }

    /// Metadata attached to every frame sent over this connection, the
    /// way a socket transport would attach its headers.
    pub fn set_metadata(&mut self, metadata: HashMap<String, String>) {
        self.metadata = metadata;
    }

    /// Push one client→server frame.
    pub async fn send(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        let mut message =
            TransportMessage::new(payload, self.responder.clone()).with_source(self.source.clone());
        message.metadata = self.metadata.clone();
        self.intake
            .send(message)
            .await
            .map_err(|_| TransportError::Closed)
    }
}
