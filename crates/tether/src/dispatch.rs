//! The dispatch kernel: envelope in, method call out.
//!
//! Each decoded invocation is admitted (or refused while draining),
//! resolved against the exposed-name registry, and run through the
//! middleware chain around a terminal handler. Unary targets produce
//! exactly one response envelope; `observe*` targets produce none — the
//! stream frames carry the results. An invocation that fails *before* its
//! `streamStart` goes out (unknown actor, middleware denial, filter
//! validation, observe error) is answered with a failure response; after
//! `streamStart`, errors surface as `streamError`.

use crate::actor::{ActorRegistry, RemoteActor};
use crate::error::DispatchError;
use crate::invoke::{Arguments, ResultSink};
use crate::lifecycle::LifecycleManager;
use crate::middleware::{Handler, InvocationContext, MiddlewareChain};
use crate::stream::{ResumeOutcome, StreamRegistry};
use crate::transport::{Respond, Responder, TransportMessage};
use crate::wire::{
    Envelope, InvocationEnvelope, ResponseEnvelope, StreamResumeEnvelope, decode_envelope,
    encode_envelope,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Turns decoded envelopes into actor work.
pub struct Dispatcher {
    registry: Arc<ActorRegistry>,
    chain: MiddlewareChain,
    streams: Arc<StreamRegistry>,
    lifecycle: Arc<LifecycleManager>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ActorRegistry>,
        chain: MiddlewareChain,
        streams: Arc<StreamRegistry>,
        lifecycle: Arc<LifecycleManager>,
    ) -> Self {
        Self {
            registry,
            chain,
            streams,
            lifecycle,
        }
    }

    pub fn registry(&self) -> Arc<ActorRegistry> {
        self.registry.clone()
    }

    pub fn streams(&self) -> Arc<StreamRegistry> {
        self.streams.clone()
    }

    /// Entry point for streaming transports: decode one frame and act on
    /// it. Protocol errors are logged and the frame dropped.
    pub async fn handle_message(&self, message: TransportMessage) {
        let TransportMessage {
            payload,
            source,
            metadata,
            responder,
        } = message;
        let envelope = match decode_envelope(&payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, source = source.as_deref().unwrap_or("-"), "dropping undecodable frame");
                return;
            }
        };
        self.dispatch_envelope(envelope, metadata, responder).await;
    }

    /// Act on one decoded envelope.
    pub async fn dispatch_envelope(
        &self,
        envelope: Envelope,
        metadata: HashMap<String, String>,
        responder: Responder,
    ) {
        match envelope {
            Envelope::Invocation(inv) => self.dispatch_invocation(inv, metadata, responder).await,
            Envelope::StreamResume(resume) => {
                self.dispatch_resume(resume, metadata, responder).await
            }
            other => {
                tracing::warn!(kind = other.type_name(), "ignoring client-bound envelope");
            }
        }
    }

    async fn dispatch_invocation(
        &self,
        envelope: InvocationEnvelope,
        metadata: HashMap<String, String>,
        responder: Responder,
    ) {
        if !self.lifecycle.is_admitting() {
            self.respond(
                &responder,
                ResponseEnvelope::failure(envelope.call_id, DispatchError::ShuttingDown.to_failure_message()),
            )
            .await;
            return;
        }

        let Some(actor) = self.registry.resolve(&envelope.actor_id.id) else {
            let message = DispatchError::ActorNotFound {
                id: envelope.actor_id.id.clone(),
            }
            .to_failure_message();
            self.respond(&responder, ResponseEnvelope::failure(envelope.call_id, message))
                .await;
            return;
        };

        let mut ctx = InvocationContext::new().with_metadata(metadata);
        ctx.trace = envelope.trace_context;

        if envelope.is_stream_target() {
            self.run_stream_invocation(&envelope, actor, &mut ctx, responder)
                .await;
            return;
        }

        let guard = self.lifecycle.tracker().begin(
            envelope.call_id,
            envelope.actor_id.id.clone(),
            envelope.target.clone(),
        );
        let terminal = UnaryTerminal;
        let response = match self
            .chain
            .execute(&envelope, &actor, &mut ctx, &terminal)
            .await
        {
            Ok(response) => response,
            Err(e) => ResponseEnvelope::failure(envelope.call_id, e.to_failure_message()),
        };
        drop(guard);

        self.respond(&responder, response).await;
    }

    async fn run_stream_invocation(
        &self,
        envelope: &InvocationEnvelope,
        actor: Arc<dyn RemoteActor>,
        ctx: &mut InvocationContext,
        responder: Responder,
    ) {
        let terminal = StreamTerminal {
            streams: self.streams.clone(),
            responder: responder.clone(),
        };
        if let Err(e) = self.chain.execute(envelope, &actor, ctx, &terminal).await {
            self.respond(
                &responder,
                ResponseEnvelope::failure(envelope.call_id, e.to_failure_message()),
            )
            .await;
        }
    }

    async fn dispatch_resume(
        &self,
        resume: StreamResumeEnvelope,
        metadata: HashMap<String, String>,
        responder: Responder,
    ) {
        if !self.lifecycle.is_admitting() {
            tracing::debug!(stream_id = %resume.stream_id, "ignoring resume while not running");
            return;
        }

        if self.streams.resume(&resume, responder.clone()).await == ResumeOutcome::Replayed {
            return;
        }

        // Unknown stream or expired buffer: synthesize a fresh observe
        // invocation. Its call id is the old stream id, which is how the
        // client recognizes the restarted stream.
        let Some(actor) = self.registry.resolve(&resume.actor_id.id) else {
            let message = DispatchError::ActorNotFound {
                id: resume.actor_id.id.clone(),
            }
            .to_failure_message();
            self.respond(&responder, ResponseEnvelope::failure(resume.stream_id, message))
                .await;
            return;
        };

        let envelope =
            InvocationEnvelope::new(resume.stream_id, resume.actor_id.clone(), resume.target.clone());
        let mut ctx = InvocationContext::new().with_metadata(metadata);
        self.run_stream_invocation(&envelope, actor, &mut ctx, responder)
            .await;
    }

    async fn respond(&self, responder: &Responder, response: ResponseEnvelope) {
        let frame = match encode_envelope(&Envelope::Response(response)) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode response envelope");
                return;
            }
        };
        if responder.send(frame).await.is_err() {
            // Connection torn down mid-call; the tear-down is the signal.
            tracing::debug!("response dropped, transport gone");
        }
    }
}

/// Terminal handler for unary targets: decode, execute, collect.
struct UnaryTerminal;

#[async_trait]
impl Handler for UnaryTerminal {
    async fn call(
        &self,
        envelope: &InvocationEnvelope,
        actor: &Arc<dyn RemoteActor>,
        _ctx: &mut InvocationContext,
    ) -> Result<ResponseEnvelope, DispatchError> {
        let mut args = Arguments::json(envelope.arguments.clone());
        let mut sink = ResultSink::new();
        actor
            .execute(
                &envelope.target,
                &envelope.generic_substitutions,
                &mut args,
                &mut sink,
            )
            .await?;
        Ok(sink.into_response(envelope.call_id))
    }
}

/// Terminal handler for `observe*` targets: open the stream.
struct StreamTerminal {
    streams: Arc<StreamRegistry>,
    responder: Responder,
}

#[async_trait]
impl Handler for StreamTerminal {
    async fn call(
        &self,
        envelope: &InvocationEnvelope,
        actor: &Arc<dyn RemoteActor>,
        _ctx: &mut InvocationContext,
    ) -> Result<ResponseEnvelope, DispatchError> {
        let mut args = Arguments::json(envelope.arguments.clone());
        let source = actor.observe(&envelope.target, &mut args).await?;
        self.streams
            .open(
                envelope.call_id,
                actor.clone(),
                envelope.actor_id.id.clone(),
                envelope.target.clone(),
                envelope.stream_filter.as_ref(),
                source,
                self.responder.clone(),
            )
            .await?;
        // Never sent; stream frames carry the results.
        Ok(ResponseEnvelope::success(envelope.call_id, Vec::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::StateStream;
    use crate::error::ActorError;
    use crate::lifecycle::InflightTracker;
    use crate::middleware::{Middleware, Next};
    use crate::stream::StreamBufferConfig;
    use crate::transport::ChannelResponder;
    use crate::wire::{ActorId, Filter, StreamEndReason};
    use futures_util::StreamExt;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    struct CalcActor;

    #[async_trait]
    impl RemoteActor for CalcActor {
        fn type_name(&self) -> &'static str {
            "Calc"
        }

        async fn execute(
            &self,
            target: &str,
            substitutions: &[String],
            args: &mut Arguments,
            sink: &mut ResultSink,
        ) -> Result<(), ActorError> {
            if let Some(substitution) = substitutions.first() {
                return Err(ActorError::UnsupportedSubstitution {
                    substitution: substitution.clone(),
                });
            }
            match target {
                "add" => {
                    let a: i64 = args.next().map_err(|e| ActorError::method(e.to_string()))?;
                    let b: i64 = args.next().map_err(|e| ActorError::method(e.to_string()))?;
                    args.finish().map_err(|e| ActorError::method(e.to_string()))?;
                    sink.complete(&(a + b))
                        .map_err(|e| ActorError::method(e.to_string()))?;
                    Ok(())
                }
                "fail" => {
                    sink.fail("arithmetic declined");
                    Ok(())
                }
                other => Err(ActorError::UnknownTarget {
                    target: other.to_string(),
                }),
            }
        }

        async fn observe(
            &self,
            target: &str,
            _args: &mut Arguments,
        ) -> Result<StateStream, ActorError> {
            match target {
                "observeTotal" => Ok(futures::stream::iter(
                    [b"1".to_vec(), b"2".to_vec()].map(Ok),
                )
                .boxed()),
                other => Err(ActorError::UnknownTarget {
                    target: other.to_string(),
                }),
            }
        }
    }

    struct Fixture {
        dispatcher: Dispatcher,
        lifecycle: Arc<LifecycleManager>,
    }

    fn fixture(chain: MiddlewareChain) -> Fixture {
        let registry = Arc::new(ActorRegistry::new());
        registry.expose("calc", Arc::new(CalcActor)).unwrap();
        let streams = Arc::new(StreamRegistry::new(StreamBufferConfig::default()));
        let lifecycle = Arc::new(LifecycleManager::new(
            Arc::new(InflightTracker::new()),
            streams.clone(),
        ));
        Fixture {
            dispatcher: Dispatcher::new(registry, chain, streams, lifecycle.clone()),
            lifecycle,
        }
    }

    fn invocation(target: &str, args: Vec<&[u8]>) -> InvocationEnvelope {
        let mut envelope = InvocationEnvelope::new(
            Uuid::new_v4(),
            ActorId::named("calc").unwrap(),
            target,
        );
        envelope.arguments = args.into_iter().map(<[u8]>::to_vec).collect();
        envelope
    }

    async fn recv(rx: &mut mpsc::Receiver<Vec<u8>>) -> Envelope {
        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("frame timeout")
            .expect("channel closed");
        decode_envelope(&frame).unwrap()
    }

    #[tokio::test]
    async fn rpc_happy_path_emits_exactly_one_success() {
        let Fixture { dispatcher, .. } = fixture(MiddlewareChain::new());
        let (tx, mut rx) = mpsc::channel(8);
        let envelope = invocation("add", vec![b"2", b"3"]);
        let call_id = envelope.call_id;

        dispatcher
            .dispatch_envelope(
                Envelope::Invocation(envelope),
                HashMap::new(),
                ChannelResponder::new(tx),
            )
            .await;

        match recv(&mut rx).await {
            Envelope::Response(response) => {
                assert_eq!(response.call_id, call_id);
                assert_eq!(response.result.as_deref(), Some(b"5".as_ref()));
                assert!(response.error_message.is_none());
            }
            other => panic!("expected response, got {}", other.type_name()),
        }
        assert!(rx.try_recv().is_err(), "exactly one response per call");
    }

    #[tokio::test]
    async fn unknown_actor_yields_the_exact_not_found_message() {
        let Fixture { dispatcher, .. } = fixture(MiddlewareChain::new());
        let (tx, mut rx) = mpsc::channel(8);
        let mut envelope = invocation("anything", vec![]);
        envelope.actor_id = ActorId::named("missing").unwrap();

        dispatcher
            .dispatch_envelope(
                Envelope::Invocation(envelope),
                HashMap::new(),
                ChannelResponder::new(tx),
            )
            .await;

        match recv(&mut rx).await {
            Envelope::Response(response) => {
                assert_eq!(
                    response.error_message.as_deref(),
                    Some("Actor 'missing' not found")
                );
                assert!(response.result.is_none());
            }
            other => panic!("expected response, got {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn decode_diagnostics_become_failure_responses() {
        let Fixture { dispatcher, .. } = fixture(MiddlewareChain::new());
        let (tx, mut rx) = mpsc::channel(8);
        let envelope = invocation("add", vec![b"\"two\"", b"3"]);

        dispatcher
            .dispatch_envelope(
                Envelope::Invocation(envelope),
                HashMap::new(),
                ChannelResponder::new(tx),
            )
            .await;

        match recv(&mut rx).await {
            Envelope::Response(response) => {
                assert!(!response.is_success());
                assert!(
                    response
                        .error_message
                        .as_deref()
                        .unwrap()
                        .contains("does not match the expected type")
                );
            }
            other => panic!("expected response, got {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn unsupported_generic_substitution_fails() {
        let Fixture { dispatcher, .. } = fixture(MiddlewareChain::new());
        let (tx, mut rx) = mpsc::channel(8);
        let mut envelope = invocation("add", vec![b"2", b"3"]);
        envelope.generic_substitutions = vec!["Complex".to_string()];

        dispatcher
            .dispatch_envelope(
                Envelope::Invocation(envelope),
                HashMap::new(),
                ChannelResponder::new(tx),
            )
            .await;

        match recv(&mut rx).await {
            Envelope::Response(response) => {
                assert!(
                    response
                        .error_message
                        .as_deref()
                        .unwrap()
                        .contains("Complex")
                );
            }
            other => panic!("expected response, got {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn actor_reported_failure_is_a_failure_response() {
        let Fixture { dispatcher, .. } = fixture(MiddlewareChain::new());
        let (tx, mut rx) = mpsc::channel(8);
        dispatcher
            .dispatch_envelope(
                Envelope::Invocation(invocation("fail", vec![])),
                HashMap::new(),
                ChannelResponder::new(tx),
            )
            .await;
        match recv(&mut rx).await {
            Envelope::Response(response) => {
                assert_eq!(response.error_message.as_deref(), Some("arithmetic declined"));
            }
            other => panic!("expected response, got {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn draining_server_refuses_admission() {
        let Fixture {
            dispatcher,
            lifecycle,
        } = fixture(MiddlewareChain::new());
        lifecycle.shutdown().await;

        let (tx, mut rx) = mpsc::channel(8);
        dispatcher
            .dispatch_envelope(
                Envelope::Invocation(invocation("add", vec![b"2", b"3"])),
                HashMap::new(),
                ChannelResponder::new(tx),
            )
            .await;
        match recv(&mut rx).await {
            Envelope::Response(response) => {
                assert_eq!(
                    response.error_message.as_deref(),
                    Some("Server is shutting down")
                );
            }
            other => panic!("expected response, got {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn stream_target_emits_stream_frames_and_no_response() {
        let Fixture { dispatcher, .. } = fixture(MiddlewareChain::new());
        let (tx, mut rx) = mpsc::channel(16);
        let envelope = invocation("observeTotal", vec![]);
        let call_id = envelope.call_id;

        dispatcher
            .dispatch_envelope(
                Envelope::Invocation(envelope),
                HashMap::new(),
                ChannelResponder::new(tx),
            )
            .await;

        match recv(&mut rx).await {
            Envelope::StreamStart(start) => assert_eq!(start.call_id, call_id),
            other => panic!("expected streamStart, got {}", other.type_name()),
        }
        let mut sequences = Vec::new();
        loop {
            match recv(&mut rx).await {
                Envelope::StreamData(data) => sequences.push(data.sequence_number),
                Envelope::StreamEnd(end) => {
                    assert_eq!(end.reason, StreamEndReason::Completed);
                    break;
                }
                Envelope::Response(_) => panic!("stream targets must emit zero responses"),
                other => panic!("unexpected {}", other.type_name()),
            }
        }
        assert_eq!(sequences, vec![1, 2]);
    }

    #[tokio::test]
    async fn stream_invocation_rejected_by_middleware_gets_failure_response() {
        struct DenyAll;

        #[async_trait]
        impl Middleware for DenyAll {
            async fn handle(
                &self,
                _envelope: &InvocationEnvelope,
                _actor: &Arc<dyn RemoteActor>,
                _ctx: &mut InvocationContext,
                _next: Next<'_>,
            ) -> Result<ResponseEnvelope, DispatchError> {
                Err(DispatchError::Authorization("denied".to_string()))
            }

            fn name(&self) -> &'static str {
                "deny-all"
            }
        }

        let Fixture { dispatcher, .. } =
            fixture(MiddlewareChain::new().with(Arc::new(DenyAll)));
        let (tx, mut rx) = mpsc::channel(8);
        dispatcher
            .dispatch_envelope(
                Envelope::Invocation(invocation("observeTotal", vec![])),
                HashMap::new(),
                ChannelResponder::new(tx),
            )
            .await;
        match recv(&mut rx).await {
            Envelope::Response(response) => {
                assert!(
                    response
                        .error_message
                        .as_deref()
                        .unwrap()
                        .starts_with("authorization denied")
                );
            }
            other => panic!("expected response, got {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn invalid_stream_filter_fails_before_stream_start() {
        let Fixture { dispatcher, .. } = fixture(MiddlewareChain::new());
        let (tx, mut rx) = mpsc::channel(8);
        let mut envelope = invocation("observeTotal", vec![]);
        envelope.stream_filter = Some(Filter::Predefined {
            name: "bogus".to_string(),
            params: HashMap::new(),
        });
        dispatcher
            .dispatch_envelope(
                Envelope::Invocation(envelope),
                HashMap::new(),
                ChannelResponder::new(tx),
            )
            .await;
        match recv(&mut rx).await {
            Envelope::Response(response) => {
                assert!(
                    response
                        .error_message
                        .as_deref()
                        .unwrap()
                        .contains("unknown predefined filter")
                );
            }
            other => panic!("expected response, got {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn resume_of_unknown_stream_restarts_fresh() {
        let Fixture { dispatcher, .. } = fixture(MiddlewareChain::new());
        let (tx, mut rx) = mpsc::channel(16);
        let old_stream = Uuid::new_v4();

        dispatcher
            .dispatch_envelope(
                Envelope::StreamResume(StreamResumeEnvelope {
                    stream_id: old_stream,
                    last_sequence: 42,
                    actor_id: ActorId::named("calc").unwrap(),
                    target: "observeTotal".to_string(),
                }),
                HashMap::new(),
                ChannelResponder::new(tx),
            )
            .await;

        match recv(&mut rx).await {
            Envelope::StreamStart(start) => {
                assert_eq!(start.call_id, old_stream, "restart correlates by old stream id");
                assert_ne!(start.stream_id, old_stream);
            }
            other => panic!("expected streamStart, got {}", other.type_name()),
        }
        match recv(&mut rx).await {
            Envelope::StreamData(data) => {
                assert_eq!(data.sequence_number, 1, "restart sequences begin at 1");
            }
            other => panic!("expected streamData, got {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn undecodable_frames_are_dropped_silently() {
        let Fixture { dispatcher, .. } = fixture(MiddlewareChain::new());
        let (tx, mut rx) = mpsc::channel(8);
        dispatcher
            .handle_message(TransportMessage::new(
                b"{ garbage".to_vec(),
                ChannelResponder::new(tx),
            ))
            .await;
        assert!(rx.try_recv().is_err());
    }
}
