//! Middleware pipeline around the dispatch of one invocation.
//!
//! A chain is an ordered list of layers wrapping a terminal handler;
//! layer 0 sees the outermost wrapping. A layer that returns `Err` stops
//! the descent — layers above it observe the error through `next` and may
//! recover or rethrow. An empty chain delegates straight to the handler.
//!
//! Recommended order, outermost first: validation → rate-limit →
//! authentication → authorization → tracing → handler.

pub mod observe;
pub mod security;

use crate::actor::RemoteActor;
use crate::error::DispatchError;
use crate::wire::{InvocationEnvelope, ResponseEnvelope, TraceContext};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

pub use observe::{
    InMemoryMetrics, InMemorySpanExporter, LoggingLayer, MetricsCollector, MetricsLayer, Span,
    SpanExporter, SpanStatus, TracingLayer,
};
pub use security::{
    AccessPolicy, ApiKeyAuthenticator, AuthenticationLayer, Authenticator, AuthorizationLayer,
    RateLimitConfig, RateLimitLayer, RateLimitScope, ValidationConfig, ValidationLayer,
};

/// Authenticated identity attached to an invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub id: String,
    pub kind: String,
    pub roles: Vec<String>,
}

impl Principal {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            roles: Vec::new(),
        }
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Mutable per-invocation scratch threaded through the chain. Lives for
/// exactly one invocation.
#[derive(Debug, Default)]
pub struct InvocationContext {
    /// Set by the authentication layer.
    pub principal: Option<Principal>,
    /// Transport metadata (headers, query parameters) plus whatever
    /// layers record for each other.
    pub metadata: HashMap<String, String>,
    /// Active trace context; the tracing layer replaces it with the child
    /// span's context so the handler propagates the right parent.
    pub trace: Option<TraceContext>,
}

impl InvocationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Terminal end of the chain: actually runs the target.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(
        &self,
        envelope: &InvocationEnvelope,
        actor: &Arc<dyn RemoteActor>,
        ctx: &mut InvocationContext,
    ) -> Result<ResponseEnvelope, DispatchError>;
}

/// One wrapping layer.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(
        &self,
        envelope: &InvocationEnvelope,
        actor: &Arc<dyn RemoteActor>,
        ctx: &mut InvocationContext,
        next: Next<'_>,
    ) -> Result<ResponseEnvelope, DispatchError>;

    fn name(&self) -> &'static str;
}

/// The remainder of the chain below the current layer.
pub struct Next<'a> {
    layers: &'a [Arc<dyn Middleware>],
    handler: &'a dyn Handler,
}

impl<'a> Next<'a> {
    /// Descend one level: the next layer if any, else the terminal
    /// handler.
    pub async fn run(
        self,
        envelope: &InvocationEnvelope,
        actor: &Arc<dyn RemoteActor>,
        ctx: &mut InvocationContext,
    ) -> Result<ResponseEnvelope, DispatchError> {
        match self.layers.split_first() {
            Some((layer, rest)) => {
                layer
                    .handle(
                        envelope,
                        actor,
                        ctx,
                        Next {
                            layers: rest,
                            handler: self.handler,
                        },
                    )
                    .await
            }
            None => self.handler.call(envelope, actor, ctx).await,
        }
    }
}

/// Ordered middleware stack.
#[derive(Default, Clone)]
pub struct MiddlewareChain {
    layers: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, layer: Arc<dyn Middleware>) -> Self {
        self.layers.push(layer);
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Run the full chain around `handler`.
    pub async fn execute(
        &self,
        envelope: &InvocationEnvelope,
        actor: &Arc<dyn RemoteActor>,
        ctx: &mut InvocationContext,
        handler: &dyn Handler,
    ) -> Result<ResponseEnvelope, DispatchError> {
        Next {
            layers: &self.layers,
            handler,
        }
        .run(envelope, actor, ctx)
        .await
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::error::ActorError;
    use crate::invoke::{Arguments, ResultSink};
    use crate::wire::ActorId;
    use uuid::Uuid;

    pub struct NoopActor;

    #[async_trait]
    impl RemoteActor for NoopActor {
        fn type_name(&self) -> &'static str {
            "Noop"
        }

        async fn execute(
            &self,
            target: &str,
            _substitutions: &[String],
            _args: &mut Arguments,
            _sink: &mut ResultSink,
        ) -> Result<(), ActorError> {
            Err(ActorError::UnknownTarget {
                target: target.to_string(),
            })
        }
    }

    pub fn noop_actor() -> Arc<dyn RemoteActor> {
        Arc::new(NoopActor)
    }

    pub fn envelope(target: &str) -> InvocationEnvelope {
        InvocationEnvelope::new(Uuid::new_v4(), ActorId::named("noop").unwrap(), target)
    }

    /// Handler answering success with a fixed payload.
    pub struct OkHandler {
        pub calls: std::sync::atomic::AtomicUsize,
    }

    impl OkHandler {
        pub fn new() -> Self {
            Self {
                calls: std::sync::atomic::AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Handler for OkHandler {
        async fn call(
            &self,
            envelope: &InvocationEnvelope,
            _actor: &Arc<dyn RemoteActor>,
            _ctx: &mut InvocationContext,
        ) -> Result<ResponseEnvelope, DispatchError> {
            self.calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(ResponseEnvelope::success(envelope.call_id, b"ok".to_vec()))
        }
    }

    /// Handler that always throws a method error.
    pub struct FailingHandler;

    #[async_trait]
    impl Handler for FailingHandler {
        async fn call(
            &self,
            _envelope: &InvocationEnvelope,
            _actor: &Arc<dyn RemoteActor>,
            _ctx: &mut InvocationContext,
        ) -> Result<ResponseEnvelope, DispatchError> {
            Err(DispatchError::Method("handler exploded".to_string()))
        }
    }
}
