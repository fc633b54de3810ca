//! Client stream registry.
//!
//! A subscription's delivery queue is registered *before* the invocation
//! goes out, so data racing ahead of the `streamStart` is never dropped.
//! The local key is the callID; `streamStart` remaps it to the server's
//! streamID. Frames are delivered only when their sequence number exceeds
//! the subscription's high-water mark — duplicates and reorders are
//! silently discarded, gaps (permitted across resumption) are delivered.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tether::wire::{
    ActorId, StreamDataEnvelope, StreamEndEnvelope, StreamEndReason, StreamErrorEnvelope,
    StreamResumeEnvelope, StreamStartEnvelope,
};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use uuid::Uuid;

const SUBSCRIPTION_BUFFER: usize = 64;

/// What a subscriber receives.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Data {
        sequence: u64,
        data: Vec<u8>,
        timestamp: OffsetDateTime,
    },
    End {
        reason: StreamEndReason,
    },
    Error {
        message: String,
    },
}

struct Shared {
    actor_id: ActorId,
    target: String,
    stream_id: Mutex<Option<Uuid>>,
    last_seen: AtomicU64,
}

/// Everything needed to resume a stream on a fresh connection.
#[derive(Debug, Clone)]
pub struct ResumeHandle {
    pub stream_id: Uuid,
    pub last_sequence: u64,
    pub actor_id: ActorId,
    pub target: String,
}

impl ResumeHandle {
    pub fn to_envelope(&self) -> StreamResumeEnvelope {
        StreamResumeEnvelope {
            stream_id: self.stream_id,
            last_sequence: self.last_sequence,
            actor_id: self.actor_id.clone(),
            target: self.target.clone(),
        }
    }
}

/// Typed receiver for one observed stream.
pub struct Subscription {
    rx: mpsc::Receiver<StreamEvent>,
    shared: Arc<Shared>,
}

impl Subscription {
    /// Next event; `None` once the stream (or its connection) closed.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    /// Server streamID, known once `streamStart` arrived.
    pub fn stream_id(&self) -> Option<Uuid> {
        *self.shared.stream_id.lock()
    }

    /// Highest sequence number delivered so far.
    pub fn last_seen(&self) -> u64 {
        self.shared.last_seen.load(Ordering::SeqCst)
    }

    /// State for resuming on a new connection; `None` before the stream
    /// was ever started.
    pub fn resume_handle(&self) -> Option<ResumeHandle> {
        self.stream_id().map(|stream_id| ResumeHandle {
            stream_id,
            last_sequence: self.last_seen(),
            actor_id: self.shared.actor_id.clone(),
            target: self.shared.target.clone(),
        })
    }
}

struct Entry {
    tx: mpsc::Sender<StreamEvent>,
    shared: Arc<Shared>,
    /// Resume entries reset their high-water mark when the server answers
    /// with a fresh `streamStart` instead of a replay.
    is_resume: bool,
}

impl Entry {
    fn duplicate(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            shared: self.shared.clone(),
            is_resume: self.is_resume,
        }
    }
}

/// Routes inbound stream frames to subscriptions.
#[derive(Default)]
pub(crate) struct StreamRouter {
    /// Awaiting `streamStart`, keyed by callID.
    pending: Mutex<HashMap<Uuid, Entry>>,
    /// Live streams, keyed by server streamID.
    active: Mutex<HashMap<Uuid, Entry>>,
}

impl StreamRouter {
    /// Pre-register a subscription under its callID; call before sending
    /// the invocation.
    pub fn register(&self, call_id: Uuid, actor_id: ActorId, target: String) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let shared = Arc::new(Shared {
            actor_id,
            target,
            stream_id: Mutex::new(None),
            last_seen: AtomicU64::new(0),
        });
        self.pending.lock().insert(
            call_id,
            Entry {
                tx,
                shared: shared.clone(),
                is_resume: false,
            },
        );
        Subscription { rx, shared }
    }

    /// Register a resume: the reply is either data on the old streamID
    /// (replay) or a `streamStart` whose callID is the old streamID
    /// (restart). Both routes are armed before the resume is sent.
    pub fn register_resume(&self, handle: &ResumeHandle) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let shared = Arc::new(Shared {
            actor_id: handle.actor_id.clone(),
            target: handle.target.clone(),
            stream_id: Mutex::new(Some(handle.stream_id)),
            last_seen: AtomicU64::new(handle.last_sequence),
        });
        let entry = Entry {
            tx,
            shared: shared.clone(),
            is_resume: true,
        };
        self.active.lock().insert(handle.stream_id, entry.duplicate());
        self.pending.lock().insert(handle.stream_id, entry);
        Subscription { rx, shared }
    }

    /// Whether a pending stream invocation exists for this callID.
    pub fn has_pending(&self, call_id: &Uuid) -> bool {
        self.pending.lock().contains_key(call_id)
    }

    pub fn on_start(&self, start: &StreamStartEnvelope) {
        let Some(entry) = self.pending.lock().remove(&start.call_id) else {
            tracing::debug!(call_id = %start.call_id, "streamStart for unknown call");
            return;
        };
        if entry.is_resume {
            // Restart path: the old stream and its high-water mark are
            // obsolete.
            self.active.lock().remove(&start.call_id);
            entry.shared.last_seen.store(0, Ordering::SeqCst);
        }
        *entry.shared.stream_id.lock() = Some(start.stream_id);
        self.active.lock().insert(start.stream_id, entry);
    }

    pub async fn on_data(&self, data: &StreamDataEnvelope) {
        let entry = {
            let active = self.active.lock();
            match active.get(&data.stream_id) {
                Some(entry) => entry.duplicate(),
                None => {
                    tracing::debug!(stream_id = %data.stream_id, "data for unknown stream");
                    return;
                }
            }
        };
        let last_seen = entry.shared.last_seen.load(Ordering::SeqCst);
        if data.sequence_number <= last_seen {
            // Duplicate or reorder; the client-side contract is strictly
            // increasing delivery.
            return;
        }
        entry
            .shared
            .last_seen
            .store(data.sequence_number, Ordering::SeqCst);
        let _ = entry
            .tx
            .send(StreamEvent::Data {
                sequence: data.sequence_number,
                data: data.data.clone(),
                timestamp: data.timestamp,
            })
            .await;
    }

    pub async fn on_end(&self, end: &StreamEndEnvelope) {
        let entry = self.active.lock().remove(&end.stream_id);
        if let Some(entry) = entry {
            let _ = entry.tx.send(StreamEvent::End { reason: end.reason }).await;
        }
    }

    pub async fn on_error(&self, error: &StreamErrorEnvelope) {
        let entry = self.active.lock().remove(&error.stream_id);
        if let Some(entry) = entry {
            let _ = entry
                .tx
                .send(StreamEvent::Error {
                    message: error.error_message.clone(),
                })
                .await;
        }
    }

    /// Deliver a pre-start failure (the server refused the observe
    /// invocation with a failure response).
    pub async fn fail_pending(&self, call_id: &Uuid, message: String) {
        let entry = self.pending.lock().remove(call_id);
        if let Some(entry) = entry {
            self.active.lock().retain(|_, e| !Arc::ptr_eq(&e.shared, &entry.shared));
            let _ = entry.tx.send(StreamEvent::Error { message }).await;
        }
    }

    /// Drop every queue; receivers observe end-of-stream.
    pub fn close_all(&self) {
        self.pending.lock().clear();
        self.active.lock().clear();
    }
}
