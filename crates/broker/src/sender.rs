//! Outbound delivery to individual connections.
//!
//! Production posts through the API-gateway management API, where a
//! 410-equivalent response maps to [`SendError::Gone`]. The in-memory
//! sender backs the tests: each attached connection is an mpsc channel,
//! and connections can be marked gone to simulate vanished clients.

use crate::error::SendError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use time::OffsetDateTime;
use tokio::sync::mpsc;

/// What the management side knows about one connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub connection_id: String,
    pub connected_at: OffsetDateTime,
}

/// Pushes frames to connections by id.
#[async_trait]
pub trait ConnectionSender: Send + Sync {
    async fn send(&self, frame: &[u8], to: &str) -> Result<(), SendError>;

    async fn is_alive(&self, connection_id: &str) -> bool;

    async fn disconnect(&self, connection_id: &str) -> Result<(), SendError>;

    async fn connection_info(&self, connection_id: &str) -> Option<ConnectionInfo>;
}

struct Attached {
    tx: mpsc::Sender<Vec<u8>>,
    connected_at: OffsetDateTime,
    gone: bool,
}

/// Channel-backed sender for tests and embedded use.
#[derive(Default)]
pub struct InMemoryConnectionSender {
    connections: Mutex<HashMap<String, Attached>>,
}

impl InMemoryConnectionSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a connection; the receiver yields everything sent to it.
    pub fn attach(&self, connection_id: &str) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(64);
        self.connections.lock().insert(
            connection_id.to_string(),
            Attached {
                tx,
                connected_at: OffsetDateTime::now_utc(),
                gone: false,
            },
        );
        rx
    }

    /// Simulate a vanished client: subsequent sends return
    /// [`SendError::Gone`].
    pub fn mark_gone(&self, connection_id: &str) {
        if let Some(attached) = self.connections.lock().get_mut(connection_id) {
            attached.gone = true;
        }
    }
}

#[async_trait]
impl ConnectionSender for InMemoryConnectionSender {
    async fn send(&self, frame: &[u8], to: &str) -> Result<(), SendError> {
        let tx = {
            let connections = self.connections.lock();
            let attached = connections.get(to).ok_or_else(|| SendError::Gone {
                connection_id: to.to_string(),
            })?;
            if attached.gone {
                return Err(SendError::Gone {
                    connection_id: to.to_string(),
                });
            }
            attached.tx.clone()
        };
        tx.send(frame.to_vec()).await.map_err(|_| SendError::Gone {
            connection_id: to.to_string(),
        })
    }

    async fn is_alive(&self, connection_id: &str) -> bool {
        self.connections
            .lock()
            .get(connection_id)
            .is_some_and(|attached| !attached.gone)
    }

    async fn disconnect(&self, connection_id: &str) -> Result<(), SendError> {
        self.connections.lock().remove(connection_id);
        Ok(())
    }

    async fn connection_info(&self, connection_id: &str) -> Option<ConnectionInfo> {
        self.connections
            .lock()
            .get(connection_id)
            .map(|attached| ConnectionInfo {
                connection_id: connection_id.to_string(),
                connected_at: attached.connected_at,
            })
    }
}
