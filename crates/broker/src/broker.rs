//! Fan-out over the connection index.
//!
//! A broadcast loads the subscribers of an actor and sends to each
//! concurrently. One connection's failure never aborts the fan-out; a
//! gone connection is unregistered on the spot and skipped thereafter.

use crate::error::SendError;
use crate::sender::ConnectionSender;
use crate::storage::{ConnectionStorage, Subscription};
use std::sync::Arc;
use tether::wire::{ActorId, Envelope, StreamDataEnvelope, encode_envelope};
use time::OffsetDateTime;
use uuid::Uuid;

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Gone connections removed from the index during this fan-out.
    pub pruned: usize,
    pub failed: usize,
}

/// Maps actors to their subscribed connections and delivers frames.
pub struct ConnectionBroker {
    storage: Arc<dyn ConnectionStorage>,
    sender: Arc<dyn ConnectionSender>,
}

impl ConnectionBroker {
    pub fn new(storage: Arc<dyn ConnectionStorage>, sender: Arc<dyn ConnectionSender>) -> Self {
        Self { storage, sender }
    }

    pub fn storage(&self) -> Arc<dyn ConnectionStorage> {
        self.storage.clone()
    }

    pub fn sender(&self) -> Arc<dyn ConnectionSender> {
        self.sender.clone()
    }

    /// Deliver one frame to a single connection; a gone connection is
    /// unregistered and reported as `Err(Gone)`.
    pub async fn send(&self, frame: &[u8], to: &str) -> Result<(), SendError> {
        match self.sender.send(frame, to).await {
            Ok(()) => Ok(()),
            Err(SendError::Gone { connection_id }) => {
                tracing::debug!(connection_id = %connection_id, "connection gone, unregistering");
                let _ = self.storage.unregister(&connection_id).await;
                Err(SendError::Gone { connection_id })
            }
            Err(other) => Err(other),
        }
    }

    /// Send the same raw frame to every subscriber of `actor`.
    pub async fn broadcast(
        &self,
        frame: &[u8],
        actor: &ActorId,
        excluding: Option<&str>,
    ) -> BroadcastReport {
        let subscriptions = self.load_subscribers(actor, excluding).await;
        let sends = subscriptions
            .iter()
            .map(|sub| self.send(frame, &sub.connection_id));
        self.tally(futures::future::join_all(sends).await)
    }

    /// Fan a state change out as stream data. Each subscriber receives a
    /// frame carrying *its own* streamID; the sequence number is the
    /// source's. Delivered subscribers have their high-water mark
    /// advanced.
    pub async fn broadcast_state(
        &self,
        actor: &ActorId,
        state: &[u8],
        sequence: u64,
    ) -> BroadcastReport {
        let subscriptions = self.load_subscribers(actor, None).await;
        let timestamp = OffsetDateTime::now_utc();
        let sends = subscriptions.iter().map(|sub| async move {
            let frame = match encode_envelope(&Envelope::StreamData(StreamDataEnvelope {
                stream_id: sub.stream_id,
                sequence_number: sequence,
                data: state.to_vec(),
                timestamp,
            })) {
                Ok(frame) => frame,
                Err(e) => return Err(SendError::Failed(e.to_string())),
            };
            self.send(&frame, &sub.connection_id).await?;
            let _ = self
                .storage
                .update_sequence(&sub.connection_id, sequence)
                .await;
            Ok(())
        });
        self.tally(futures::future::join_all(sends).await)
    }

    async fn load_subscribers(
        &self,
        actor: &ActorId,
        excluding: Option<&str>,
    ) -> Vec<Subscription> {
        match self.storage.connections_for(actor).await {
            Ok(subscriptions) => subscriptions
                .into_iter()
                .filter(|sub| excluding.is_none_or(|ex| sub.connection_id != ex))
                .collect(),
            Err(e) => {
                tracing::error!(actor = %actor.id, error = %e, "failed to load subscribers");
                Vec::new()
            }
        }
    }

    fn tally(&self, outcomes: Vec<Result<(), SendError>>) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for outcome in outcomes {
            match outcome {
                Ok(()) => report.delivered += 1,
                Err(SendError::Gone { .. }) => report.pruned += 1,
                Err(_) => report.failed += 1,
            }
        }
        report
    }

    /// Allocate a subscription for a connection and record it.
    pub async fn subscribe(
        &self,
        connection_id: &str,
        actor: &ActorId,
    ) -> Result<Uuid, crate::error::BrokerError> {
        let stream_id = Uuid::new_v4();
        self.storage
            .subscribe(connection_id, stream_id, actor)
            .await?;
        Ok(stream_id)
    }
}
