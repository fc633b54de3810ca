//! API-gateway websocket adapter.
//!
//! Serverless deployments get one event per websocket action instead of a
//! socket: `$connect` registers the connection, `$disconnect` removes it,
//! and `$default` carries an envelope. Unary invocations go through the
//! dispatch kernel with a responder that posts back through the
//! [`ConnectionSender`]; `observe*` invocations and resumes become
//! durable broker subscriptions fed by the state-change tailer, because
//! no process outlives the event to drain an in-process stream.

use crate::broker::ConnectionBroker;
use crate::error::SendError;
use crate::sender::ConnectionSender;
use crate::storage::ConnectionStorage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tether::dispatch::Dispatcher;
use tether::error::TransportError;
use tether::state::StateStore;
use tether::transport::Respond;
use tether::wire::{
    Envelope, InvocationEnvelope, StreamDataEnvelope, StreamResumeEnvelope, StreamStartEnvelope,
    decode_envelope, encode_envelope,
};
use time::OffsetDateTime;

/// Incoming gateway event.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayEvent {
    #[serde(rename = "requestContext")]
    pub request_context: RequestContext,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RequestContext {
    #[serde(rename = "connectionId")]
    pub connection_id: String,
    #[serde(rename = "routeKey")]
    pub route_key: String,
}

/// What the gateway expects back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GatewayResponse {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
}

impl GatewayResponse {
    pub const OK: Self = Self { status_code: 200 };
    pub const BAD_REQUEST: Self = Self { status_code: 400 };
    pub const GONE: Self = Self { status_code: 410 };
    pub const ERROR: Self = Self { status_code: 500 };
}

/// Responder that posts through the management API; a gone connection is
/// unregistered immediately.
struct GatewayResponder {
    sender: Arc<dyn ConnectionSender>,
    storage: Arc<dyn ConnectionStorage>,
    connection_id: String,
}

#[async_trait]
impl Respond for GatewayResponder {
    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        match self.sender.send(&frame, &self.connection_id).await {
            Ok(()) => Ok(()),
            Err(SendError::Gone { connection_id }) => {
                let _ = self.storage.unregister(&connection_id).await;
                Err(TransportError::Closed)
            }
            Err(e) => Err(TransportError::Io(e.to_string())),
        }
    }
}

/// Per-event entry point for serverless deployments.
pub struct GatewayAdapter {
    dispatcher: Arc<Dispatcher>,
    broker: Arc<ConnectionBroker>,
    state: Option<Arc<dyn StateStore>>,
}

impl GatewayAdapter {
    pub fn new(dispatcher: Arc<Dispatcher>, broker: Arc<ConnectionBroker>) -> Self {
        Self {
            dispatcher,
            broker,
            state: None,
        }
    }

    /// Attach the persistent state store so fresh subscriptions receive
    /// the current state immediately after their `streamStart`.
    pub fn with_state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.state = Some(store);
        self
    }

    /// Handle one gateway event.
    pub async fn handle(&self, event: GatewayEvent) -> GatewayResponse {
        let connection_id = event.request_context.connection_id.clone();
        match event.request_context.route_key.as_str() {
            "$connect" => {
                match self.broker.storage().register(&connection_id, None).await {
                    Ok(()) => GatewayResponse::OK,
                    Err(e) => {
                        tracing::error!(%connection_id, error = %e, "connect registration failed");
                        GatewayResponse::ERROR
                    }
                }
            }
            "$disconnect" => {
                let _ = self.broker.storage().unregister(&connection_id).await;
                GatewayResponse::OK
            }
            "$default" => self.handle_default(&connection_id, event.body.as_deref()).await,
            other => {
                tracing::warn!(route_key = other, "unknown route key");
                GatewayResponse::BAD_REQUEST
            }
        }
    }

    async fn handle_default(&self, connection_id: &str, body: Option<&str>) -> GatewayResponse {
        let Some(body) = body else {
            return GatewayResponse::BAD_REQUEST;
        };
        let envelope = match decode_envelope(body.as_bytes()) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(%connection_id, error = %e, "undecodable gateway body");
                return GatewayResponse::BAD_REQUEST;
            }
        };

        match envelope {
            Envelope::Invocation(inv) if inv.is_stream_target() => {
                self.subscribe(connection_id, &inv).await
            }
            Envelope::StreamResume(resume) => self.resume(connection_id, &resume).await,
            other => {
                let responder: tether::transport::Responder = Arc::new(GatewayResponder {
                    sender: self.broker.sender(),
                    storage: self.broker.storage(),
                    connection_id: connection_id.to_string(),
                });
                self.dispatcher
                    .dispatch_envelope(other, Default::default(), responder)
                    .await;
                GatewayResponse::OK
            }
        }
    }

    /// Durable subscription: record it in the index, announce the stream,
    /// and push the current state so the subscriber is never behind.
    async fn subscribe(&self, connection_id: &str, inv: &InvocationEnvelope) -> GatewayResponse {
        let stream_id = match self.broker.subscribe(connection_id, &inv.actor_id).await {
            Ok(stream_id) => stream_id,
            Err(e) => {
                tracing::warn!(%connection_id, error = %e, "subscription failed");
                return GatewayResponse::GONE;
            }
        };

        let start = encode_envelope(&Envelope::StreamStart(StreamStartEnvelope {
            stream_id,
            call_id: inv.call_id,
        }));
        match start {
            Ok(frame) => {
                if self.broker.send(&frame, connection_id).await.is_err() {
                    return GatewayResponse::GONE;
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to encode streamStart");
                return GatewayResponse::ERROR;
            }
        }

        self.push_current_state(connection_id, &inv.actor_id, stream_id, 0)
            .await;
        GatewayResponse::OK
    }

    /// A reconnecting subscriber keeps its stream id; the recorded
    /// high-water mark picks up where the old connection left off, and
    /// any state newer than it is pushed immediately.
    async fn resume(
        &self,
        connection_id: &str,
        resume: &StreamResumeEnvelope,
    ) -> GatewayResponse {
        let storage = self.broker.storage();
        if let Err(e) = storage
            .subscribe(connection_id, resume.stream_id, &resume.actor_id)
            .await
        {
            tracing::warn!(%connection_id, error = %e, "resume subscription failed");
            return GatewayResponse::GONE;
        }
        let _ = storage
            .update_sequence(connection_id, resume.last_sequence)
            .await;
        self.push_current_state(
            connection_id,
            &resume.actor_id,
            resume.stream_id,
            resume.last_sequence,
        )
        .await;
        GatewayResponse::OK
    }

    async fn push_current_state(
        &self,
        connection_id: &str,
        actor: &tether::wire::ActorId,
        stream_id: uuid::Uuid,
        after: u64,
    ) {
        let Some(store) = &self.state else {
            return;
        };
        let current = match store.load(actor).await {
            Ok(Some(current)) if current.sequence_number > after => current,
            Ok(_) => return,
            Err(e) => {
                tracing::warn!(actor = %actor.id, error = %e, "state load failed");
                return;
            }
        };
        let frame = encode_envelope(&Envelope::StreamData(StreamDataEnvelope {
            stream_id,
            sequence_number: current.sequence_number,
            data: current.state,
            timestamp: OffsetDateTime::now_utc(),
        }));
        match frame {
            Ok(frame) => {
                if self.broker.send(&frame, connection_id).await.is_ok() {
                    let _ = self
                        .broker
                        .storage()
                        .update_sequence(connection_id, current.sequence_number)
                        .await;
                }
            }
            Err(e) => tracing::error!(error = %e, "failed to encode current state"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sender::InMemoryConnectionSender;
    use crate::storage::InMemoryConnectionStorage;
    use crate::tailer::{ChangeEvent, ChangeKind, StateTailer};
    use tether::actor::{ActorRegistry, RemoteActor};
    use tether::error::ActorError;
    use tether::invoke::{Arguments, ResultSink};
    use tether::lifecycle::{InflightTracker, LifecycleManager};
    use tether::middleware::MiddlewareChain;
    use tether::state::InMemoryStateStore;
    use tether::stream::{StreamBufferConfig, StreamRegistry};
    use tether::wire::ActorId;
    use uuid::Uuid;

    struct TodoActor;

    #[async_trait]
    impl RemoteActor for TodoActor {
        fn type_name(&self) -> &'static str {
            "Todo"
        }

        async fn execute(
            &self,
            target: &str,
            _substitutions: &[String],
            _args: &mut Arguments,
            sink: &mut ResultSink,
        ) -> Result<(), ActorError> {
            match target {
                "count" => {
                    sink.complete(&1).map_err(|e| ActorError::method(e.to_string()))?;
                    Ok(())
                }
                other => Err(ActorError::UnknownTarget {
                    target: other.to_string(),
                }),
            }
        }
    }

    struct Fixture {
        adapter: GatewayAdapter,
        sender: Arc<InMemoryConnectionSender>,
        storage: Arc<InMemoryConnectionStorage>,
        store: Arc<InMemoryStateStore>,
        tailer: StateTailer,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(ActorRegistry::new());
        registry.expose("todo", Arc::new(TodoActor)).unwrap();
        let streams = Arc::new(StreamRegistry::new(StreamBufferConfig::default()));
        let lifecycle = Arc::new(LifecycleManager::new(
            Arc::new(InflightTracker::new()),
            streams.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            registry,
            MiddlewareChain::new(),
            streams,
            lifecycle,
        ));

        let storage = Arc::new(InMemoryConnectionStorage::default());
        let sender = Arc::new(InMemoryConnectionSender::new());
        let broker = Arc::new(ConnectionBroker::new(storage.clone(), sender.clone()));
        let store = InMemoryStateStore::shared();
        let adapter = GatewayAdapter::new(dispatcher, broker.clone())
            .with_state_store(store.clone());
        Fixture {
            adapter,
            sender,
            storage,
            store,
            tailer: StateTailer::new(broker),
        }
    }

    fn event(connection_id: &str, route_key: &str, body: Option<String>) -> GatewayEvent {
        GatewayEvent {
            request_context: RequestContext {
                connection_id: connection_id.to_string(),
                route_key: route_key.to_string(),
            },
            body,
        }
    }

    fn observe_body(call_id: Uuid) -> String {
        let inv = InvocationEnvelope::new(
            call_id,
            ActorId::named("todo").unwrap(),
            "observeItems",
        );
        String::from_utf8(encode_envelope(&Envelope::Invocation(inv)).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn event_shape_deserializes() {
        let event: GatewayEvent = serde_json::from_str(
            r#"{"requestContext":{"connectionId":"c1","routeKey":"$connect"}}"#,
        )
        .unwrap();
        assert_eq!(event.request_context.connection_id, "c1");
        assert_eq!(event.request_context.route_key, "$connect");
        assert!(event.body.is_none());
        assert_eq!(
            serde_json::to_value(GatewayResponse::OK).unwrap()["statusCode"],
            200
        );
    }

    #[tokio::test]
    async fn connect_then_rpc_dispatches_through_the_kernel() {
        let f = fixture();
        let mut rx = f.sender.attach("c1");
        assert_eq!(f.adapter.handle(event("c1", "$connect", None)).await, GatewayResponse::OK);

        let call_id = Uuid::new_v4();
        let inv =
            InvocationEnvelope::new(call_id, ActorId::named("todo").unwrap(), "count");
        let body =
            String::from_utf8(encode_envelope(&Envelope::Invocation(inv)).unwrap()).unwrap();
        assert_eq!(
            f.adapter.handle(event("c1", "$default", Some(body))).await,
            GatewayResponse::OK
        );

        match decode_envelope(&rx.recv().await.unwrap()).unwrap() {
            Envelope::Response(response) => {
                assert_eq!(response.call_id, call_id);
                assert!(response.is_success());
            }
            other => panic!("expected response, got {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn observe_subscribes_and_receives_start_plus_current_state() {
        let f = fixture();
        let todo = ActorId::named("todo").unwrap();
        f.store.save(&todo, b"[\"milk\"]".to_vec()).await.unwrap();

        let mut rx = f.sender.attach("c1");
        f.adapter.handle(event("c1", "$connect", None)).await;

        let call_id = Uuid::new_v4();
        let response = f
            .adapter
            .handle(event("c1", "$default", Some(observe_body(call_id))))
            .await;
        assert_eq!(response, GatewayResponse::OK);

        let stream_id = match decode_envelope(&rx.recv().await.unwrap()).unwrap() {
            Envelope::StreamStart(start) => {
                assert_eq!(start.call_id, call_id);
                start.stream_id
            }
            other => panic!("expected streamStart, got {}", other.type_name()),
        };
        match decode_envelope(&rx.recv().await.unwrap()).unwrap() {
            Envelope::StreamData(data) => {
                assert_eq!(data.stream_id, stream_id);
                assert_eq!(data.data, b"[\"milk\"]");
                assert_eq!(data.sequence_number, 1);
            }
            other => panic!("expected streamData, got {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn tailer_fans_out_to_gateway_subscribers_and_prunes_gone_ones() {
        let f = fixture();
        let todo = ActorId::named("todo").unwrap();
        let mut rx1 = f.sender.attach("c1");
        let _rx2 = f.sender.attach("c2");
        for id in ["c1", "c2"] {
            f.adapter.handle(event(id, "$connect", None)).await;
            f.adapter
                .handle(event(id, "$default", Some(observe_body(Uuid::new_v4()))))
                .await;
        }
        // Drain the subscription frames.
        while rx1.try_recv().is_ok() {}
        f.sender.mark_gone("c2");

        let report = f
            .tailer
            .apply(&ChangeEvent {
                actor: todo.clone(),
                state: b"B".to_vec(),
                sequence: 10,
                kind: ChangeKind::Updated,
            })
            .await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.pruned, 1);

        match decode_envelope(&rx1.recv().await.unwrap()).unwrap() {
            Envelope::StreamData(data) => {
                assert_eq!(data.sequence_number, 10);
                assert_eq!(data.data, b"B");
            }
            other => panic!("expected streamData, got {}", other.type_name()),
        }
        assert_eq!(f.storage.connections_for(&todo).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn disconnect_unsubscribes() {
        let f = fixture();
        let todo = ActorId::named("todo").unwrap();
        let _rx = f.sender.attach("c1");
        f.adapter.handle(event("c1", "$connect", None)).await;
        f.adapter
            .handle(event("c1", "$default", Some(observe_body(Uuid::new_v4()))))
            .await;
        assert_eq!(f.storage.connections_for(&todo).await.unwrap().len(), 1);

        f.adapter.handle(event("c1", "$disconnect", None)).await;
        assert!(f.storage.connections_for(&todo).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn resume_keeps_the_stream_id_and_high_water_mark() {
        let f = fixture();
        let todo = ActorId::named("todo").unwrap();
        let stream_id = Uuid::new_v4();

        // Fresh connection after a reconnect.
        let _rx = f.sender.attach("c2");
        f.adapter.handle(event("c2", "$connect", None)).await;
        let resume = StreamResumeEnvelope {
            stream_id,
            last_sequence: 42,
            actor_id: todo.clone(),
            target: "observeItems".to_string(),
        };
        let body = String::from_utf8(
            encode_envelope(&Envelope::StreamResume(resume)).unwrap(),
        )
        .unwrap();
        assert_eq!(
            f.adapter.handle(event("c2", "$default", Some(body))).await,
            GatewayResponse::OK
        );

        let subs = f.storage.connections_for(&todo).await.unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].stream_id, stream_id);
        assert_eq!(subs[0].last_sequence, 42);
    }

    #[tokio::test]
    async fn malformed_bodies_are_rejected() {
        let f = fixture();
        f.adapter.handle(event("c1", "$connect", None)).await;
        assert_eq!(
            f.adapter
                .handle(event("c1", "$default", Some("{ nope".to_string())))
                .await,
            GatewayResponse::BAD_REQUEST
        );
        assert_eq!(
            f.adapter.handle(event("c1", "$default", None)).await,
            GatewayResponse::BAD_REQUEST
        );
        assert_eq!(
            f.adapter.handle(event("c1", "$teleport", None)).await,
            GatewayResponse::BAD_REQUEST
        );
    }
}
