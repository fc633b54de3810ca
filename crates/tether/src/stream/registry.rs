//! Server-side stream engine.
//!
//! For each `observe*` invocation the registry allocates a stream id,
//! announces it with a `streamStart` frame, then drains the actor's lazy
//! sequence: every payload that passes the active filter is assigned the
//! next sequence number, appended to the replay buffer, and emitted as
//! `streamData`. Source completion, source error, and cancellation each
//! close the stream with the matching terminal frame.
//!
//! When an outbound send fails the stream *detaches*: it stops writing but
//! keeps draining into the replay buffer so a reconnecting client can
//! resume without a gap. A stream detached longer than the buffer TTL is
//! torn down.

use crate::actor::{RemoteActor, StateStream};
use crate::error::DispatchError;
use crate::stream::buffer::{StreamBufferConfig, StreamBuffers};
use crate::stream::filter::FilterState;
use crate::transport::{Respond, Responder};
use crate::wire::{
    Envelope, Filter, StreamDataEnvelope, StreamEndEnvelope, StreamEndReason, StreamErrorEnvelope,
    StreamResumeEnvelope, StreamStartEnvelope, encode_envelope,
};
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Write side of one live stream. Emission and (re)attachment both take
/// this lock, which is what keeps replayed and live frames ordered.
struct StreamSink {
    responder: Option<Responder>,
    detached_at: Option<Instant>,
}

impl StreamSink {
    async fn emit(&mut self, frame: &Envelope) {
        let Some(responder) = &self.responder else {
            return;
        };
        let bytes = match encode_envelope(frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(error = %e, kind = frame.type_name(), "failed to encode stream frame");
                return;
            }
        };
        if responder.send(bytes).await.is_err() {
            tracing::debug!(kind = frame.type_name(), "stream transport gone, detaching");
            self.responder = None;
            self.detached_at = Some(Instant::now());
        }
    }
}

#[derive(Clone)]
struct LiveHandle {
    actor_name: String,
    target: String,
    sink: Arc<tokio::sync::Mutex<StreamSink>>,
    cancel: CancellationToken,
}

/// What a resume request resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// Buffered frames past the client's high-water mark were replayed and
    /// the live stream re-attached; sequence numbers continue contiguously.
    Replayed,
    /// The stream is unknown or its buffer expired; the caller must run a
    /// fresh `observe*` invocation under a new stream id.
    Restart,
}

/// Owns every live server stream and its replay buffer.
pub struct StreamRegistry {
    buffers: Arc<StreamBuffers>,
    live: Arc<Mutex<HashMap<Uuid, LiveHandle>>>,
}

impl StreamRegistry {
    pub fn new(config: StreamBufferConfig) -> Self {
        Self {
            buffers: Arc::new(StreamBuffers::new(config)),
            live: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn buffers(&self) -> Arc<StreamBuffers> {
        self.buffers.clone()
    }

    /// Number of live streams, for health reporting.
    pub fn active_count(&self) -> usize {
        self.live.lock().len()
    }

    /// Open a stream for an `observe*` invocation and start draining it.
    ///
    /// `call_id` is echoed in the `streamStart` frame; on the
    /// resume-restart path callers pass the old stream id here so the
    /// client can correlate.
    pub async fn open(
        &self,
        call_id: Uuid,
        actor: Arc<dyn RemoteActor>,
        actor_name: impl Into<String>,
        target: impl Into<String>,
        filter: Option<&Filter>,
        source: StateStream,
        responder: Responder,
    ) -> Result<Uuid, DispatchError> {
        let filter_state = FilterState::new(filter)?;
        let stream_id = Uuid::new_v4();
        let actor_name = actor_name.into();
        let target = target.into();

        let sink = Arc::new(tokio::sync::Mutex::new(StreamSink {
            responder: Some(responder),
            detached_at: None,
        }));
        let cancel = CancellationToken::new();
        let handle = LiveHandle {
            actor_name: actor_name.clone(),
            target: target.clone(),
            sink: sink.clone(),
            cancel: cancel.clone(),
        };
        self.live.lock().insert(stream_id, handle);

        sink.lock()
            .await
            .emit(&Envelope::StreamStart(StreamStartEnvelope {
                stream_id,
                call_id,
            }))
            .await;

        tracing::debug!(%stream_id, actor = %actor_name, target = %target, "stream opened");

        let drain = DrainTask {
            stream_id,
            actor,
            filter_state,
            sink,
            cancel,
            buffers: self.buffers.clone(),
            live: self.live.clone(),
        };
        tokio::spawn(drain.run(source));

        Ok(stream_id)
    }

    /// Handle a client resume.
    ///
    /// On the replay path the buffered frames with `sequence >
    /// last_sequence` go out in order under the emit lock, then the new
    /// responder is attached so live emission continues without a gap.
    pub async fn resume(
        &self,
        resume: &StreamResumeEnvelope,
        responder: Responder,
    ) -> ResumeOutcome {
        let handle = match self.live.lock().get(&resume.stream_id) {
            Some(handle) => handle.clone(),
            None => return ResumeOutcome::Restart,
        };

        let mut sink = handle.sink.lock().await;
        let frames = match self.buffers.collect_after(resume.stream_id, resume.last_sequence) {
            Some(frames) => frames,
            None => {
                // Buffer aged out while the stream idled; tear the stale
                // stream down and make the caller start fresh.
                drop(sink);
                handle.cancel.cancel();
                return ResumeOutcome::Restart;
            }
        };

        let mut delivered = true;
        for frame in &frames {
            let bytes = match encode_envelope(&Envelope::StreamData(StreamDataEnvelope {
                stream_id: resume.stream_id,
                sequence_number: frame.sequence,
                data: frame.data.clone(),
                timestamp: frame.enqueued_at,
            })) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::error!(error = %e, "failed to encode replay frame");
                    continue;
                }
            };
            if responder.send(bytes).await.is_err() {
                delivered = false;
                break;
            }
        }

        if delivered {
            sink.responder = Some(responder);
            sink.detached_at = None;
            tracing::debug!(
                stream_id = %resume.stream_id,
                replayed = frames.len(),
                after = resume.last_sequence,
                "stream resumed"
            );
        }
        ResumeOutcome::Replayed
    }

    /// Cancel every live stream (server shutdown). Each one emits
    /// `streamEnd(cancelled)` where its transport still permits; all
    /// replay buffers are dropped.
    pub fn cancel_all(&self) {
        let handles: Vec<LiveHandle> = self.live.lock().values().cloned().collect();
        for handle in &handles {
            tracing::debug!(actor = %handle.actor_name, target = %handle.target, "cancelling stream");
            handle.cancel.cancel();
        }
        self.buffers.clear();
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new(StreamBufferConfig::default())
    }
}

struct DrainTask {
    stream_id: Uuid,
    actor: Arc<dyn RemoteActor>,
    filter_state: FilterState,
    sink: Arc<tokio::sync::Mutex<StreamSink>>,
    cancel: CancellationToken,
    buffers: Arc<StreamBuffers>,
    live: Arc<Mutex<HashMap<Uuid, LiveHandle>>>,
}

impl DrainTask {
    async fn run(mut self, mut source: StateStream) {
        let detach_ttl = self.buffers.config().ttl;
        let mut sequence: u64 = 0;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.close(StreamEndReason::Cancelled).await;
                    return;
                }
                item = source.next() => match item {
                    Some(Ok(payload)) => {
                        if !self.filter_state.passes(&payload, self.actor.as_ref()) {
                            continue;
                        }
                        sequence += 1;
                        let mut sink = self.sink.lock().await;
                        if let Some(detached_at) = sink.detached_at {
                            if detached_at.elapsed() > detach_ttl {
                                // Nobody came back for the buffer; stop
                                // draining the source.
                                drop(sink);
                                self.teardown();
                                return;
                            }
                        }
                        self.buffers.append(self.stream_id, sequence, payload.clone());
                        sink.emit(&Envelope::StreamData(StreamDataEnvelope {
                            stream_id: self.stream_id,
                            sequence_number: sequence,
                            data: payload,
                            timestamp: OffsetDateTime::now_utc(),
                        }))
                        .await;
                    }
                    Some(Err(e)) => {
                        let mut sink = self.sink.lock().await;
                        sink.emit(&Envelope::StreamError(StreamErrorEnvelope {
                            stream_id: self.stream_id,
                            error_message: e.to_string(),
                        }))
                        .await;
                        drop(sink);
                        self.teardown();
                        return;
                    }
                    None => {
                        self.close(StreamEndReason::Completed).await;
                        return;
                    }
                }
            }
        }
    }

    async fn close(&self, reason: StreamEndReason) {
        let mut sink = self.sink.lock().await;
        sink.emit(&Envelope::StreamEnd(StreamEndEnvelope {
            stream_id: self.stream_id,
            reason,
        }))
        .await;
        drop(sink);
        self.teardown();
    }

    fn teardown(&self) {
        self.buffers.remove(self.stream_id);
        self.live.lock().remove(&self.stream_id);
    }
}
