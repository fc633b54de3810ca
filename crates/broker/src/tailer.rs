//! State-change tailer: external change events in, stream frames out.
//!
//! The tailer consumes an ordered feed of per-actor state changes (a
//! change log on the persistent state KV, in production) and asks the
//! broker to fan each one out to the actor's subscribers. Removal events
//! are ignored: the streaming contract is "current state", and deletions
//! surface through actor methods, never as silent stream writes.

use crate::broker::{BroadcastReport, ConnectionBroker};
use futures::StreamExt;
use futures::stream::BoxStream;
use std::sync::Arc;
use tether::wire::ActorId;

/// What happened to an actor's stored state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Updated,
    Removed,
}

/// One ordered change-log entry.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub actor: ActorId,
    pub state: Vec<u8>,
    /// Source sequence number; becomes the stream frame's sequence.
    pub sequence: u64,
    pub kind: ChangeKind,
}

/// Ordered feed of change events.
pub type ChangeFeed = BoxStream<'static, ChangeEvent>;

/// Broadcasts state changes to subscribed connections.
pub struct StateTailer {
    broker: Arc<ConnectionBroker>,
}

impl StateTailer {
    pub fn new(broker: Arc<ConnectionBroker>) -> Self {
        Self { broker }
    }

    /// Consume the feed until it ends.
    pub async fn run(&self, mut feed: ChangeFeed) {
        while let Some(event) = feed.next().await {
            self.apply(&event).await;
        }
        tracing::debug!("change feed ended");
    }

    /// Fan one event out. Per-connection failures are absorbed by the
    /// broker (gone connections get unregistered); they never stop the
    /// tailer.
    pub async fn apply(&self, event: &ChangeEvent) -> BroadcastReport {
        match event.kind {
            ChangeKind::Removed => {
                tracing::trace!(actor = %event.actor.id, "ignoring removal event");
                BroadcastReport::default()
            }
            ChangeKind::Updated => {
                let report = self
                    .broker
                    .broadcast_state(&event.actor, &event.state, event.sequence)
                    .await;
                tracing::debug!(
                    actor = %event.actor.id,
                    sequence = event.sequence,
                    delivered = report.delivered,
                    pruned = report.pruned,
                    "state change broadcast"
                );
                report
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sender::InMemoryConnectionSender;
    use crate::storage::{ConnectionStorage, InMemoryConnectionStorage};
    use tether::wire::{Envelope, decode_envelope};
    use uuid::Uuid;

    fn actor(id: &str) -> ActorId {
        ActorId::named(id).unwrap()
    }

    async fn fixture_with_subscribers(
        ids: &[&str],
    ) -> (
        Arc<InMemoryConnectionStorage>,
        Arc<InMemoryConnectionSender>,
        StateTailer,
        Vec<tokio::sync::mpsc::Receiver<Vec<u8>>>,
    ) {
        let storage = Arc::new(InMemoryConnectionStorage::default());
        let sender = Arc::new(InMemoryConnectionSender::new());
        let broker = Arc::new(ConnectionBroker::new(storage.clone(), sender.clone()));
        let todo = actor("todo");
        let mut receivers = Vec::new();
        for id in ids {
            receivers.push(sender.attach(id));
            storage.register(id, None).await.unwrap();
            storage.subscribe(id, Uuid::new_v4(), &todo).await.unwrap();
        }
        (storage, sender, StateTailer::new(broker), receivers)
    }

    #[tokio::test]
    async fn update_events_reach_every_subscriber() {
        let (_storage, _sender, tailer, mut receivers) =
            fixture_with_subscribers(&["c1", "c2"]).await;

        let report = tailer
            .apply(&ChangeEvent {
                actor: actor("todo"),
                state: b"B".to_vec(),
                sequence: 10,
                kind: ChangeKind::Updated,
            })
            .await;
        assert_eq!(report.delivered, 2);

        for rx in &mut receivers {
            match decode_envelope(&rx.recv().await.unwrap()).unwrap() {
                Envelope::StreamData(data) => {
                    assert_eq!(data.sequence_number, 10);
                    assert_eq!(data.data, b"B");
                }
                other => panic!("expected streamData, got {}", other.type_name()),
            }
        }
    }

    #[tokio::test]
    async fn removal_events_are_ignored() {
        let (_storage, _sender, tailer, mut receivers) =
            fixture_with_subscribers(&["c1"]).await;

        let report = tailer
            .apply(&ChangeEvent {
                actor: actor("todo"),
                state: Vec::new(),
                sequence: 11,
                kind: ChangeKind::Removed,
            })
            .await;
        assert_eq!(report, BroadcastReport::default());
        assert!(receivers[0].try_recv().is_err());
    }

    #[tokio::test]
    async fn gone_subscriber_is_unregistered_and_the_rest_deliver() {
        let (storage, sender, tailer, mut receivers) =
            fixture_with_subscribers(&["c1", "c2"]).await;
        sender.mark_gone("c2");

        let report = tailer
            .apply(&ChangeEvent {
                actor: actor("todo"),
                state: b"B".to_vec(),
                sequence: 10,
                kind: ChangeKind::Updated,
            })
            .await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.pruned, 1);
        assert!(receivers[0].recv().await.is_some());
        assert_eq!(
            storage.connections_for(&actor("todo")).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn run_drains_an_ordered_feed() {
        let (_storage, _sender, tailer, mut receivers) =
            fixture_with_subscribers(&["c1"]).await;

        let events = vec![
            ChangeEvent {
                actor: actor("todo"),
                state: b"1".to_vec(),
                sequence: 1,
                kind: ChangeKind::Updated,
            },
            ChangeEvent {
                actor: actor("todo"),
                state: b"2".to_vec(),
                sequence: 2,
                kind: ChangeKind::Updated,
            },
        ];
        tailer.run(futures::stream::iter(events).boxed()).await;

        let mut sequences = Vec::new();
        while let Ok(frame) = receivers[0].try_recv() {
            if let Envelope::StreamData(data) = decode_envelope(&frame).unwrap() {
                sequences.push(data.sequence_number);
            }
        }
        assert_eq!(sequences, vec![1, 2]);
    }
}
