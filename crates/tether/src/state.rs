//! Persistent actor state, behind a pluggable KV interface.
//!
//! Production deployments back this with a remote KV; the in-memory
//! implementation serves tests and embedded use. Sequence numbers are
//! strictly increasing per actor, and `save_if_version` is the atomic
//! compare-and-set the optimistic-concurrency helpers build on.

use crate::error::StateError;
use crate::wire::ActorId;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

/// Default attempt count for [`update_with_retry`].
pub const DEFAULT_UPDATE_ATTEMPTS: u32 = 3;

const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// One stored state record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedState {
    pub state: Vec<u8>,
    pub sequence_number: u64,
    pub updated_at: OffsetDateTime,
}

/// Persistent actor state KV.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, actor: &ActorId) -> Result<Option<VersionedState>, StateError>;

    /// Unconditional write; returns the new sequence number.
    async fn save(&self, actor: &ActorId, state: Vec<u8>) -> Result<u64, StateError>;

    /// Write only when the store's version equals `expected`; otherwise
    /// fails with [`StateError::VersionConflict`] carrying both versions.
    async fn save_if_version(
        &self,
        actor: &ActorId,
        state: Vec<u8>,
        expected: u64,
    ) -> Result<u64, StateError>;

    async fn delete(&self, actor: &ActorId) -> Result<(), StateError>;

    async fn sequence_number(&self, actor: &ActorId) -> Result<Option<u64>, StateError>;
}

/// Read-modify-write with optimistic concurrency.
///
/// Version conflicts retry with exponential backoff (100 ms · 2ⁿ) up to
/// `attempts` tries; exhaustion surfaces as
/// [`StateError::MaxRetriesExceeded`]. An actor with no stored state is
/// transformed from `None` and written at version 0.
pub async fn update_with_retry<F>(
    store: &dyn StateStore,
    actor: &ActorId,
    attempts: u32,
    mut transform: F,
) -> Result<u64, StateError>
where
    F: FnMut(Option<&[u8]>) -> Vec<u8> + Send,
{
    for attempt in 0..attempts {
        let current = store.load(actor).await?;
        let expected = current.as_ref().map(|s| s.sequence_number).unwrap_or(0);
        let next = transform(current.as_ref().map(|s| s.state.as_slice()));
        match store.save_if_version(actor, next, expected).await {
            Ok(sequence) => return Ok(sequence),
            Err(StateError::VersionConflict { .. }) => {
                let delay = RETRY_BASE_DELAY * 2u32.pow(attempt);
                tracing::debug!(actor = %actor.id, attempt, ?delay, "version conflict, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(other) => return Err(other),
        }
    }
    Err(StateError::MaxRetriesExceeded { attempts })
}

/// Hash-map backed store. Sequence numbers start at 1 on first save.
#[derive(Default)]
pub struct InMemoryStateStore {
    records: Mutex<HashMap<ActorId, VersionedState>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn load(&self, actor: &ActorId) -> Result<Option<VersionedState>, StateError> {
        Ok(self.records.lock().get(actor).cloned())
    }

    async fn save(&self, actor: &ActorId, state: Vec<u8>) -> Result<u64, StateError> {
        let mut records = self.records.lock();
        let next = records
            .get(actor)
            .map(|record| record.sequence_number + 1)
            .unwrap_or(1);
        records.insert(
            actor.clone(),
            VersionedState {
                state,
                sequence_number: next,
                updated_at: OffsetDateTime::now_utc(),
            },
        );
        Ok(next)
    }

    async fn save_if_version(
        &self,
        actor: &ActorId,
        state: Vec<u8>,
        expected: u64,
    ) -> Result<u64, StateError> {
        let mut records = self.records.lock();
        let actual = records
            .get(actor)
            .map(|record| record.sequence_number)
            .unwrap_or(0);
        if actual != expected {
            return Err(StateError::VersionConflict { expected, actual });
        }
        let next = actual + 1;
        records.insert(
            actor.clone(),
            VersionedState {
                state,
                sequence_number: next,
                updated_at: OffsetDateTime::now_utc(),
            },
        );
        Ok(next)
    }

    async fn delete(&self, actor: &ActorId) -> Result<(), StateError> {
        self.records.lock().remove(actor);
        Ok(())
    }

    async fn sequence_number(&self, actor: &ActorId) -> Result<Option<u64>, StateError> {
        Ok(self
            .records
            .lock()
            .get(actor)
            .map(|record| record.sequence_number))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actor() -> ActorId {
        ActorId::named("todo").unwrap()
    }

    #[tokio::test]
    async fn save_produces_strictly_increasing_sequences() {
        let store = InMemoryStateStore::new();
        let actor = actor();
        assert_eq!(store.save(&actor, b"a".to_vec()).await.unwrap(), 1);
        assert_eq!(store.save(&actor, b"b".to_vec()).await.unwrap(), 2);
        assert_eq!(store.save(&actor, b"c".to_vec()).await.unwrap(), 3);
        assert_eq!(store.sequence_number(&actor).await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn save_if_version_succeeds_only_on_the_observed_version() {
        let store = InMemoryStateStore::new();
        let actor = actor();
        let v1 = store.save(&actor, b"a".to_vec()).await.unwrap();

        let v2 = store
            .save_if_version(&actor, b"b".to_vec(), v1)
            .await
            .unwrap();
        assert_eq!(v2, v1 + 1);

        let err = store
            .save_if_version(&actor, b"stale".to_vec(), v1)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            StateError::VersionConflict {
                expected: v1,
                actual: v2
            }
        );
        // The conflicting write left no trace.
        let record = store.load(&actor).await.unwrap().unwrap();
        assert_eq!(record.state, b"b");
    }

    #[tokio::test]
    async fn save_if_version_zero_creates_the_record() {
        let store = InMemoryStateStore::new();
        let actor = actor();
        let v = store
            .save_if_version(&actor, b"first".to_vec(), 0)
            .await
            .unwrap();
        assert_eq!(v, 1);
    }

    #[tokio::test]
    async fn delete_then_load_is_none() {
        let store = InMemoryStateStore::new();
        let actor = actor();
        store.save(&actor, b"a".to_vec()).await.unwrap();
        store.delete(&actor).await.unwrap();
        assert!(store.load(&actor).await.unwrap().is_none());
        assert_eq!(store.sequence_number(&actor).await.unwrap(), None);
    }

    #[tokio::test]
    async fn update_with_retry_applies_the_transform() {
        let store = InMemoryStateStore::new();
        let actor = actor();
        store.save(&actor, b"1".to_vec()).await.unwrap();

        let sequence = update_with_retry(&store, &actor, DEFAULT_UPDATE_ATTEMPTS, |current| {
            let n: i64 = serde_json::from_slice(current.unwrap()).unwrap();
            serde_json::to_vec(&(n + 1)).unwrap()
        })
        .await
        .unwrap();

        assert_eq!(sequence, 2);
        let record = store.load(&actor).await.unwrap().unwrap();
        assert_eq!(record.state, b"2");
    }

    #[tokio::test]
    async fn update_with_retry_initializes_missing_state() {
        let store = InMemoryStateStore::new();
        let actor = actor();
        let sequence = update_with_retry(&store, &actor, DEFAULT_UPDATE_ATTEMPTS, |current| {
            assert!(current.is_none());
            b"init".to_vec()
        })
        .await
        .unwrap();
        assert_eq!(sequence, 1);
    }

    /// Store whose compare-and-set always loses the race.
    struct AlwaysConflicting;

    #[async_trait]
    impl StateStore for AlwaysConflicting {
        async fn load(&self, _actor: &ActorId) -> Result<Option<VersionedState>, StateError> {
            Ok(None)
        }

        async fn save(&self, _actor: &ActorId, _state: Vec<u8>) -> Result<u64, StateError> {
            Ok(1)
        }

        async fn save_if_version(
            &self,
            _actor: &ActorId,
            _state: Vec<u8>,
            expected: u64,
        ) -> Result<u64, StateError> {
            Err(StateError::VersionConflict {
                expected,
                actual: expected + 1,
            })
        }

        async fn delete(&self, _actor: &ActorId) -> Result<(), StateError> {
            Ok(())
        }

        async fn sequence_number(&self, _actor: &ActorId) -> Result<Option<u64>, StateError> {
            Ok(None)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_back_off_then_give_up() {
        let store = AlwaysConflicting;
        let actor = actor();
        let started = tokio::time::Instant::now();
        let err = update_with_retry(&store, &actor, 3, |_| b"x".to_vec())
            .await
            .unwrap_err();
        assert_eq!(err, StateError::MaxRetriesExceeded { attempts: 3 });
        // 100ms + 200ms + 400ms of backoff.
        assert!(started.elapsed() >= Duration::from_millis(700));
    }
}
