//! The runtime contract for distributed actors and the exposed-name
//! registry.
//!
//! An actor is a named, single-writer object: its methods execute one at a
//! time under the actor's own serialization discipline (an inbox task, an
//! internal mutex, whatever the implementation chooses). The kernel adds
//! no locking of its own.

use crate::error::{ActorError, WireError};
use crate::invoke::{Arguments, ResultSink};
use crate::wire::ActorId;
use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Lazy sequence of serialized state values produced by an `observe*`
/// target. Every mutation of the observed property yields the new value
/// exactly once; dropping the stream deregisters the subscriber.
pub type StateStream = BoxStream<'static, Result<Vec<u8>, ActorError>>;

/// Contract generated target code must obey.
#[async_trait]
pub trait RemoteActor: Send + Sync + 'static {
    /// Actor type tag, used for authorization rules and metrics.
    fn type_name(&self) -> &'static str;

    /// Execute a unary target: decode arguments in declaration order,
    /// report the outcome through the sink. Unknown targets and
    /// unsupported generic substitutions are errors.
    async fn execute(
        &self,
        target: &str,
        substitutions: &[String],
        args: &mut Arguments,
        sink: &mut ResultSink,
    ) -> Result<(), ActorError>;

    /// Open a state stream for an `observe*` target.
    async fn observe(&self, target: &str, args: &mut Arguments) -> Result<StateStream, ActorError> {
        let _ = args;
        Err(ActorError::UnknownTarget {
            target: target.to_string(),
        })
    }

    /// Hook for custom stream filters. Actors that do not implement it
    /// pass every payload through.
    fn custom_filter(&self, filter: &[u8], payload: &[u8]) -> bool {
        let _ = (filter, payload);
        true
    }
}

struct Registered {
    id: ActorId,
    actor: Arc<dyn RemoteActor>,
}

#[derive(Default)]
struct Tables {
    by_name: HashMap<String, Registered>,
    by_id: HashMap<ActorId, Arc<dyn RemoteActor>>,
}

/// Maps exposed names to actors.
///
/// Two tables are kept: exposed name → [`ActorId`] and [`ActorId`] →
/// actor object. Used only for routing; never held across an invocation,
/// so calls already dispatched keep running after `unexpose`.
#[derive(Default)]
pub struct ActorRegistry {
    tables: RwLock<Tables>,
}

impl ActorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `actor` under `name`.
    ///
    /// Idempotent over `(name, actor)`; exposing a different actor under
    /// an existing name replaces it atomically.
    pub fn expose(
        &self,
        name: &str,
        actor: Arc<dyn RemoteActor>,
    ) -> Result<ActorId, WireError> {
        let id = ActorId::named(name)?;
        let mut tables = self.tables.write();
        if let Some(existing) = tables.by_name.get(name) {
            if Arc::ptr_eq(&existing.actor, &actor) {
                return Ok(existing.id.clone());
            }
        }
        tables.by_id.insert(id.clone(), actor.clone());
        if let Some(previous) = tables.by_name.insert(
            name.to_string(),
            Registered {
                id: id.clone(),
                actor,
            },
        ) {
            if previous.id != id {
                tables.by_id.remove(&previous.id);
            }
        }
        tracing::debug!(name, "actor exposed");
        Ok(id)
    }

    /// Remove a name and its actor entry. Calls already dispatched
    /// continue to completion.
    pub fn unexpose(&self, name: &str) -> bool {
        let mut tables = self.tables.write();
        match tables.by_name.remove(name) {
            Some(previous) => {
                tables.by_id.remove(&previous.id);
                tracing::debug!(name, "actor unexposed");
                true
            }
            None => false,
        }
    }

    /// The actor exposed under `name`.
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn RemoteActor>> {
        self.tables.read().by_name.get(name).map(|r| r.actor.clone())
    }

    /// The actor registered under a concrete id.
    pub fn resolve_id(&self, id: &ActorId) -> Option<Arc<dyn RemoteActor>> {
        self.tables.read().by_id.get(id).cloned()
    }

    /// The id currently bound to `name`.
    pub fn id_for(&self, name: &str) -> Option<ActorId> {
        self.tables.read().by_name.get(name).map(|r| r.id.clone())
    }

    pub fn exposed_names(&self) -> Vec<String> {
        self.tables.read().by_name.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tables.read().by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
