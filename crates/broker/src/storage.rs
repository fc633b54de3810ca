//! Durable connection index: connection → subscription, with a secondary
//! actor → connections index.
//!
//! Production backs this with a remote KV (primary key on connectionID,
//! secondary index on actorID, TTL eviction); the in-memory
//! implementation keeps both directions consistent under one lock and is
//! what the tests and embedded deployments use.

use crate::error::BrokerError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tether::wire::ActorId;
use time::OffsetDateTime;
use tokio::time::Instant;
use uuid::Uuid;

/// One connection's stream subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub connection_id: String,
    pub actor_id: ActorId,
    pub stream_id: Uuid,
    pub last_sequence: u64,
    pub connected_at: OffsetDateTime,
    pub ttl: Option<Duration>,
}

/// Connection index operations.
#[async_trait]
pub trait ConnectionStorage: Send + Sync {
    /// Record a connection, optionally already pinned to an actor.
    async fn register(
        &self,
        connection_id: &str,
        actor: Option<&ActorId>,
    ) -> Result<(), BrokerError>;

    /// Attach a stream subscription to a registered connection.
    async fn subscribe(
        &self,
        connection_id: &str,
        stream_id: Uuid,
        actor: &ActorId,
    ) -> Result<(), BrokerError>;

    /// Drop a connection from both indexes. Unknown ids are a no-op.
    async fn unregister(&self, connection_id: &str) -> Result<(), BrokerError>;

    /// Advance the subscriber's delivered high-water mark.
    async fn update_sequence(
        &self,
        connection_id: &str,
        last_sequence: u64,
    ) -> Result<(), BrokerError>;

    /// Every live subscription for `actor`.
    async fn connections_for(&self, actor: &ActorId) -> Result<Vec<Subscription>, BrokerError>;
}

struct Connection {
    actor: Option<ActorId>,
    stream_id: Option<Uuid>,
    last_sequence: u64,
    connected_at: OffsetDateTime,
    expires_at: Option<Instant>,
}

struct Indexes {
    by_connection: HashMap<String, Connection>,
    by_actor: HashMap<ActorId, HashSet<String>>,
}

/// Dual-index in-memory storage with TTL reaping.
pub struct InMemoryConnectionStorage {
    indexes: Mutex<Indexes>,
    ttl: Option<Duration>,
}

impl InMemoryConnectionStorage {
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            indexes: Mutex::new(Indexes {
                by_connection: HashMap::new(),
                by_actor: HashMap::new(),
            }),
            ttl,
        }
    }

    fn remove_locked(indexes: &mut Indexes, connection_id: &str) {
        if let Some(connection) = indexes.by_connection.remove(connection_id) {
            if let Some(actor) = connection.actor {
                if let Some(set) = indexes.by_actor.get_mut(&actor) {
                    set.remove(connection_id);
                    if set.is_empty() {
                        indexes.by_actor.remove(&actor);
                    }
                }
            }
        }
    }

    /// Drop entries whose absolute deadline passed. Returns the count.
    pub fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let mut indexes = self.indexes.lock();
        let expired: Vec<String> = indexes
            .by_connection
            .iter()
            .filter(|(_, c)| c.expires_at.is_some_and(|deadline| deadline <= now))
            .map(|(id, _)| id.clone())
            .collect();
        for connection_id in &expired {
            Self::remove_locked(&mut indexes, connection_id);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.indexes.lock().by_connection.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryConnectionStorage {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl ConnectionStorage for InMemoryConnectionStorage {
    async fn register(
        &self,
        connection_id: &str,
        actor: Option<&ActorId>,
    ) -> Result<(), BrokerError> {
        let mut indexes = self.indexes.lock();
        Self::remove_locked(&mut indexes, connection_id);
        if let Some(actor) = actor {
            indexes
                .by_actor
                .entry(actor.clone())
                .or_default()
                .insert(connection_id.to_string());
        }
        indexes.by_connection.insert(
            connection_id.to_string(),
            Connection {
                actor: actor.cloned(),
                stream_id: None,
                last_sequence: 0,
                connected_at: OffsetDateTime::now_utc(),
                expires_at: self.ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn subscribe(
        &self,
        connection_id: &str,
        stream_id: Uuid,
        actor: &ActorId,
    ) -> Result<(), BrokerError> {
        let mut indexes = self.indexes.lock();
        // Move the secondary-index entry if the actor changed.
        let previous_actor = indexes
            .by_connection
            .get(connection_id)
            .and_then(|c| c.actor.clone());
        if let Some(previous) = previous_actor.as_ref().filter(|p| *p != actor) {
            if let Some(set) = indexes.by_actor.get_mut(previous) {
                set.remove(connection_id);
                if set.is_empty() {
                    indexes.by_actor.remove(previous);
                }
            }
        }
        let connection = indexes
            .by_connection
            .get_mut(connection_id)
            .ok_or_else(|| BrokerError::NotRegistered {
                connection_id: connection_id.to_string(),
            })?;
        connection.actor = Some(actor.clone());
        connection.stream_id = Some(stream_id);
        indexes
            .by_actor
            .entry(actor.clone())
            .or_default()
            .insert(connection_id.to_string());
        Ok(())
    }

    async fn unregister(&self, connection_id: &str) -> Result<(), BrokerError> {
        let mut indexes = self.indexes.lock();
        Self::remove_locked(&mut indexes, connection_id);
        Ok(())
    }

    async fn update_sequence(
        &self,
        connection_id: &str,
        last_sequence: u64,
    ) -> Result<(), BrokerError> {
        let mut indexes = self.indexes.lock();
        let connection = indexes
            .by_connection
            .get_mut(connection_id)
            .ok_or_else(|| BrokerError::NotRegistered {
                connection_id: connection_id.to_string(),
            })?;
        connection.last_sequence = last_sequence;
        Ok(())
    }

    async fn connections_for(&self, actor: &ActorId) -> Result<Vec<Subscription>, BrokerError> {
        self.reap_expired();
        let indexes = self.indexes.lock();
        let Some(connection_ids) = indexes.by_actor.get(actor) else {
            return Ok(Vec::new());
        };
        Ok(connection_ids
            .iter()
            .filter_map(|connection_id| {
                let connection = indexes.by_connection.get(connection_id)?;
                let stream_id = connection.stream_id?;
                Some(Subscription {
                    connection_id: connection_id.clone(),
                    actor_id: actor.clone(),
                    stream_id,
                    last_sequence: connection.last_sequence,
                    connected_at: connection.connected_at,
                    ttl: self.ttl,
                })
            })
            .collect())
    }
}
