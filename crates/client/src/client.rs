//! The client connector.
//!
//! One connection multiplexes any number of unary calls and stream
//! subscriptions. Calls are correlated by callID through oneshot
//! resolvers; stream frames route through the [`StreamRouter`]. When the
//! connection dies every pending call and stream queue closes.

use crate::error::ClientError;
use crate::stream::{ResumeHandle, StreamRouter, Subscription};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tether::transport::memory::MemoryConnection;
use tether::wire::{
    ActorId, Envelope, Filter, InvocationEnvelope, ResponseEnvelope, TraceContext,
    decode_envelope, encode_envelope,
};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

const OUTBOUND_BUFFER: usize = 64;

struct Inner {
    out: mpsc::Sender<Vec<u8>>,
    pending: Mutex<HashMap<Uuid, oneshot::Sender<ResponseEnvelope>>>,
    streams: StreamRouter,
}

impl Inner {
    fn new(out: mpsc::Sender<Vec<u8>>) -> Arc<Self> {
        Arc::new(Self {
            out,
            pending: Mutex::new(HashMap::new()),
            streams: StreamRouter::default(),
        })
    }

    async fn on_frame(&self, payload: &[u8]) {
        let envelope = match decode_envelope(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::error!("dropping undecodable server frame: {}", e);
                return;
            }
        };
        match envelope {
            Envelope::Response(response) => self.on_response(response).await,
            Envelope::StreamStart(start) => self.streams.on_start(&start),
            Envelope::StreamData(data) => self.streams.on_data(&data).await,
            Envelope::StreamEnd(end) => self.streams.on_end(&end).await,
            Envelope::StreamError(error) => self.streams.on_error(&error).await,
            other => {
                tracing::debug!(kind = other.type_name(), "ignoring server-bound envelope");
            }
        }
    }

    async fn on_response(&self, response: ResponseEnvelope) {
        if let Some(resolver) = self.pending.lock().remove(&response.call_id) {
            let _ = resolver.send(response);
            return;
        }
        // A failure answering a stream invocation that never started.
        if self.streams.has_pending(&response.call_id) {
            let message = response
                .error_message
                .unwrap_or_else(|| "stream refused".to_string());
            self.streams.fail_pending(&response.call_id, message).await;
            return;
        }
        tracing::debug!(call_id = %response.call_id, "response for unknown call");
    }

    fn on_disconnect(&self) {
        self.pending.lock().clear();
        self.streams.close_all();
    }
}

/// Connection to one actor host.
pub struct Client {
    inner: Arc<Inner>,
    io_tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Client {
    /// Dial a websocket endpoint (`ws://host:port/ws`).
    pub async fn connect_ws(url: &str) -> Result<Self, ClientError> {
        url::Url::parse(url).map_err(|e| ClientError::Endpoint(e.to_string()))?;
        let (socket, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ClientError::Io(e.to_string()))?;
        let (mut sink, mut stream) = socket.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_BUFFER);
        let write_task = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let message = tokio_tungstenite::tungstenite::Message::Binary(frame.into());
                if sink.send(message).await.is_err() {
                    break;
                }
            }
        });

        let inner = Inner::new(out_tx);
        let reader = inner.clone();
        let read_task = tokio::spawn(async move {
            use tokio_tungstenite::tungstenite::Message;
            while let Some(next) = stream.next().await {
                let payload = match next {
                    Ok(Message::Binary(data)) => data.to_vec(),
                    Ok(Message::Text(text)) => text.as_bytes().to_vec(),
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                reader.on_frame(&payload).await;
            }
            reader.on_disconnect();
        });

        Ok(Self {
            inner,
            io_tasks: vec![write_task, read_task],
        })
    }

    /// Dial a framed-TCP endpoint (`host:port`).
    pub async fn connect_tcp(addr: &str) -> Result<Self, ClientError> {
        let (mut writer, mut reader_half) = tether::transport::tcp::dial(addr)
            .await
            .map_err(|e| ClientError::Io(e.to_string()))?;

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_BUFFER);
        let write_task = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if writer.send(bytes::Bytes::from(frame)).await.is_err() {
                    break;
                }
            }
        });

        let inner = Inner::new(out_tx);
        let reader = inner.clone();
        let read_task = tokio::spawn(async move {
            while let Some(next) = reader_half.next().await {
                match next {
                    Ok(frame) => reader.on_frame(&frame).await,
                    Err(_) => break,
                }
            }
            reader.on_disconnect();
        });

        Ok(Self {
            inner,
            io_tasks: vec![write_task, read_task],
        })
    }

    /// Attach to an in-process server through its intake channel.
    pub fn connect_memory(
        connection: MemoryConnection,
        mut inbound: mpsc::Receiver<Vec<u8>>,
    ) -> Self {
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_BUFFER);
        let write_task = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if connection.send(frame).await.is_err() {
                    break;
                }
            }
        });

        let inner = Inner::new(out_tx);
        let reader = inner.clone();
        let read_task = tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                reader.on_frame(&frame).await;
            }
            reader.on_disconnect();
        });

        Self {
            inner,
            io_tasks: vec![write_task, read_task],
        }
    }

    /// Tear the connection down. Pending calls and stream queues close;
    /// the server observes the transport going away.
    pub fn close(&self) {
        for task in &self.io_tasks {
            task.abort();
        }
        self.inner.on_disconnect();
    }

    /// Invoke a unary target with pre-encoded JSON arguments.
    pub async fn invoke(
        &self,
        actor: &str,
        target: &str,
        arguments: Vec<Vec<u8>>,
    ) -> Result<Vec<u8>, ClientError> {
        self.invoke_envelope(self.build_envelope(actor, target, arguments)?)
            .await
    }

    /// Invoke with an explicit envelope (filters, trace context,
    /// substitutions).
    pub async fn invoke_envelope(
        &self,
        envelope: InvocationEnvelope,
    ) -> Result<Vec<u8>, ClientError> {
        let call_id = envelope.call_id;
        let (resolver, reply) = oneshot::channel();
        self.inner.pending.lock().insert(call_id, resolver);

        if let Err(e) = self.send(Envelope::Invocation(envelope)).await {
            self.inner.pending.lock().remove(&call_id);
            return Err(e);
        }

        let response = reply.await.map_err(|_| ClientError::ConnectionClosed)?;
        match (response.result, response.error_message) {
            (Some(result), None) => Ok(result),
            (_, Some(message)) => Err(ClientError::Call(message)),
            (None, None) => Ok(Vec::new()),
        }
    }

    /// Subscribe to an `observe*` stream. The subscription is registered
    /// before the invocation leaves, so an immediate first frame is never
    /// lost.
    pub async fn observe(
        &self,
        actor: &str,
        target: &str,
        filter: Option<Filter>,
    ) -> Result<Subscription, ClientError> {
        let mut envelope = self.build_envelope(actor, target, Vec::new())?;
        envelope.stream_filter = filter;
        let subscription = self.inner.streams.register(
            envelope.call_id,
            envelope.actor_id.clone(),
            envelope.target.clone(),
        );
        self.send(Envelope::Invocation(envelope)).await?;
        Ok(subscription)
    }

    /// Resume a stream from a previous connection. The server either
    /// replays the buffered tail on the old streamID or answers with a
    /// fresh `streamStart` correlated by it; the subscription accepts
    /// both.
    pub async fn resume(&self, handle: &ResumeHandle) -> Result<Subscription, ClientError> {
        let subscription = self.inner.streams.register_resume(handle);
        self.send(Envelope::StreamResume(handle.to_envelope()))
            .await?;
        Ok(subscription)
    }

    fn build_envelope(
        &self,
        actor: &str,
        target: &str,
        arguments: Vec<Vec<u8>>,
    ) -> Result<InvocationEnvelope, ClientError> {
        let actor_id =
            ActorId::named(actor).map_err(|e| ClientError::Endpoint(e.to_string()))?;
        let mut envelope = InvocationEnvelope::new(Uuid::new_v4(), actor_id, target);
        envelope.arguments = arguments;
        envelope.trace_context = Some(TraceContext::root());
        Ok(envelope)
    }

    async fn send(&self, envelope: Envelope) -> Result<(), ClientError> {
        let frame =
            encode_envelope(&envelope).map_err(|e| ClientError::Protocol(e.to_string()))?;
        self.inner
            .out
            .send(frame)
            .await
            .map_err(|_| ClientError::ConnectionClosed)
    }
}
