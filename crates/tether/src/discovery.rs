//! Service registry interface: where actors advertise dialable endpoints.
//!
//! The runtime consumes this interface only; production backends live
//! elsewhere. The in-memory implementation carries TTL expiry and
//! broadcast-backed watches and is what the tests run against.

use crate::wire::ActorId;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// A dialable location for an actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub address: String,
}

impl Endpoint {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

/// Watch notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// Current snapshot, emitted once when a watch opens.
    Endpoints(Vec<Endpoint>),
    Updated(Endpoint),
    Removed,
    Error(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DiscoveryError {
    #[error("actor '{id}' is not registered")]
    NotRegistered { id: String },

    #[error("registry backend error: {0}")]
    Backend(String),
}

/// Registration and resolution of actor endpoints.
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    async fn register(
        &self,
        actor: &ActorId,
        endpoint: Endpoint,
        metadata: HashMap<String, String>,
        ttl: Option<Duration>,
    ) -> Result<(), DiscoveryError>;

    async fn resolve(&self, actor: &ActorId) -> Result<Option<Endpoint>, DiscoveryError>;

    async fn resolve_all(&self) -> Result<Vec<Endpoint>, DiscoveryError>;

    /// Stream of registration changes for one actor, starting with a
    /// snapshot of the current endpoints.
    async fn watch(&self, actor: &ActorId) -> BoxStream<'static, RegistryEvent>;

    async fn deregister(&self, actor: &ActorId) -> Result<(), DiscoveryError>;

    /// Refresh a TTL-bound registration.
    async fn heartbeat(&self, actor: &ActorId) -> Result<(), DiscoveryError>;

    /// All registrations, optionally restricted to ids with `prefix`.
    async fn list(
        &self,
        prefix: Option<&str>,
    ) -> Result<Vec<(ActorId, Endpoint)>, DiscoveryError>;
}

struct Registration {
    endpoint: Endpoint,
    #[allow(dead_code)]
    metadata: HashMap<String, String>,
    ttl: Option<Duration>,
    expires_at: Option<Instant>,
}

const WATCH_BUFFER: usize = 64;

/// Map-backed registry with lazy TTL reaping.
#[derive(Default)]
pub struct InMemoryServiceRegistry {
    entries: Mutex<HashMap<ActorId, Registration>>,
    watchers: Mutex<HashMap<ActorId, broadcast::Sender<RegistryEvent>>>,
}

impl InMemoryServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn publish(&self, actor: &ActorId, event: RegistryEvent) {
        if let Some(sender) = self.watchers.lock().get(actor) {
            let _ = sender.send(event);
        }
    }

    /// Remove expired registrations for `actor`; true when one was
    /// reaped.
    fn reap(&self, actor: &ActorId) -> bool {
        let mut entries = self.entries.lock();
        let expired = entries
            .get(actor)
            .and_then(|r| r.expires_at)
            .is_some_and(|deadline| deadline <= Instant::now());
        if expired {
            entries.remove(actor);
        }
        drop(entries);
        if expired {
            self.publish(actor, RegistryEvent::Removed);
        }
        expired
    }
}

#[async_trait]
impl ServiceRegistry for InMemoryServiceRegistry {
    async fn register(
        &self,
        actor: &ActorId,
        endpoint: Endpoint,
        metadata: HashMap<String, String>,
        ttl: Option<Duration>,
    ) -> Result<(), DiscoveryError> {
        self.entries.lock().insert(
            actor.clone(),
            Registration {
                endpoint: endpoint.clone(),
                metadata,
                ttl,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        self.publish(actor, RegistryEvent::Updated(endpoint));
        Ok(())
    }

    async fn resolve(&self, actor: &ActorId) -> Result<Option<Endpoint>, DiscoveryError> {
        self.reap(actor);
        Ok(self
            .entries
            .lock()
            .get(actor)
            .map(|r| r.endpoint.clone()))
    }

    async fn resolve_all(&self) -> Result<Vec<Endpoint>, DiscoveryError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, r| r.expires_at.is_none_or(|deadline| deadline > now));
        Ok(entries.values().map(|r| r.endpoint.clone()).collect())
    }

    async fn watch(&self, actor: &ActorId) -> BoxStream<'static, RegistryEvent> {
        let receiver = {
            let mut watchers = self.watchers.lock();
            watchers
                .entry(actor.clone())
                .or_insert_with(|| broadcast::channel(WATCH_BUFFER).0)
                .subscribe()
        };
        let snapshot = {
            self.entries
                .lock()
                .get(actor)
                .map(|r| vec![r.endpoint.clone()])
                .unwrap_or_default()
        };
        let initial = futures::stream::once(async move { RegistryEvent::Endpoints(snapshot) });
        let updates = tokio_stream::wrappers::BroadcastStream::new(receiver).map(|item| {
            item.unwrap_or_else(|e| RegistryEvent::Error(e.to_string()))
        });
        initial.chain(updates).boxed()
    }

    async fn deregister(&self, actor: &ActorId) -> Result<(), DiscoveryError> {
        let removed = self.entries.lock().remove(actor).is_some();
        if removed {
            self.publish(actor, RegistryEvent::Removed);
        }
        Ok(())
    }

    async fn heartbeat(&self, actor: &ActorId) -> Result<(), DiscoveryError> {
        self.reap(actor);
        let mut entries = self.entries.lock();
        let registration = entries.get_mut(actor).ok_or_else(|| {
            DiscoveryError::NotRegistered {
                id: actor.id.clone(),
            }
        })?;
        registration.expires_at = registration.ttl.map(|ttl| Instant::now() + ttl);
        Ok(())
    }

    async fn list(
        &self,
        prefix: Option<&str>,
    ) -> Result<Vec<(ActorId, Endpoint)>, DiscoveryError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, r| r.expires_at.is_none_or(|deadline| deadline > now));
        Ok(entries
            .iter()
            .filter(|(id, _)| prefix.is_none_or(|p| id.id.starts_with(p)))
            .map(|(id, r)| (id.clone(), r.endpoint.clone()))
            .collect())
    }
}
