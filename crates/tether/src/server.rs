//! Server assembly: registry + dispatcher + lifecycle + transports.
//!
//! Every transport adapter feeds the same intake channel; the pump spawns
//! one tracked task per inbound frame, so the drain/deadline machinery in
//! [`LifecycleManager`] sees every invocation regardless of how it
//! arrived.

use crate::actor::{ActorRegistry, RemoteActor};
use crate::dispatch::Dispatcher;
use crate::error::WireError;
use crate::lifecycle::{HealthStatus, InflightStats, InflightTracker, LifecycleManager};
use crate::middleware::MiddlewareChain;
use crate::stream::{StreamBufferConfig, StreamRegistry};
use crate::transport::http::{HttpServerState, router};
use crate::transport::{TransportMessage, tcp};
use crate::wire::ActorId;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Server-wide policy knobs.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub stream_buffer: StreamBufferConfig,
    /// Deadline for [`Server::graceful_shutdown`].
    pub graceful_timeout: Duration,
    /// Intake channel depth shared by all transports.
    pub intake_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            stream_buffer: StreamBufferConfig::default(),
            graceful_timeout: Duration::from_secs(30),
            intake_buffer: 256,
        }
    }
}

/// Builder for [`Server`].
#[derive(Default)]
pub struct ServerBuilder {
    chain: MiddlewareChain,
    config: Option<ServerConfig>,
}

impl ServerBuilder {
    /// Append a middleware layer; the first added is outermost.
    pub fn layer(mut self, layer: Arc<dyn crate::middleware::Middleware>) -> Self {
        self.chain = self.chain.with(layer);
        self
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Assemble the server and start its intake pump and buffer sweeper.
    pub fn build(self) -> Server {
        let config = self.config.unwrap_or_default();
        let registry = Arc::new(ActorRegistry::new());
        let streams = Arc::new(StreamRegistry::new(config.stream_buffer.clone()));
        let tracker = Arc::new(InflightTracker::new());
        let lifecycle = Arc::new(LifecycleManager::new(tracker.clone(), streams.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            self.chain,
            streams.clone(),
            lifecycle.clone(),
        ));

        let (intake_tx, mut intake_rx) = mpsc::channel::<TransportMessage>(config.intake_buffer);

        let pump_dispatcher = dispatcher.clone();
        let pump_tracker = tracker.clone();
        let pump_shutdown = lifecycle.shutdown_token();
        tracker.spawn_background(async move {
            loop {
                tokio::select! {
                    _ = pump_shutdown.cancelled() => break,
                    message = intake_rx.recv() => match message {
                        Some(message) => {
                            let dispatcher = pump_dispatcher.clone();
                            pump_tracker.spawn_call(async move {
                                dispatcher.handle_message(message).await;
                            });
                        }
                        None => break,
                    }
                }
            }
        });

        let sweep_buffers = streams.buffers();
        let sweep_interval = config.stream_buffer.sweep_interval;
        let sweep_shutdown = lifecycle.shutdown_token();
        tracker.spawn_background(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = sweep_shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = sweep_buffers.sweep();
                        if evicted > 0 {
                            tracing::debug!(evicted, "swept idle stream buffers");
                        }
                    }
                }
            }
        });

        Server {
            registry,
            dispatcher,
            lifecycle,
            tracker,
            intake: intake_tx,
            config,
        }
    }
}

/// A running actor host.
pub struct Server {
    registry: Arc<ActorRegistry>,
    dispatcher: Arc<Dispatcher>,
    lifecycle: Arc<LifecycleManager>,
    tracker: Arc<InflightTracker>,
    intake: mpsc::Sender<TransportMessage>,
    config: ServerConfig,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    /// Register an actor under an exposed name.
    pub fn expose(
        &self,
        name: &str,
        actor: Arc<dyn RemoteActor>,
    ) -> Result<ActorId, WireError> {
        self.registry.expose(name, actor)
    }

    pub fn unexpose(&self, name: &str) -> bool {
        self.registry.unexpose(name)
    }

    /// The shared intake; in-memory connections and external adapters
    /// push frames here.
    pub fn intake(&self) -> mpsc::Sender<TransportMessage> {
        self.intake.clone()
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    pub fn lifecycle(&self) -> Arc<LifecycleManager> {
        self.lifecycle.clone()
    }

    /// Serve websocket + HTTP one-shot + health on `addr`.
    pub async fn serve_http(&self, addr: &str) -> std::io::Result<SocketAddr> {
        let app = router(HttpServerState {
            intake: self.intake.clone(),
            lifecycle: self.lifecycle.clone(),
        });
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let shutdown = self.lifecycle.shutdown_token();
        self.tracker.spawn_background(async move {
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(e) = serve.await {
                tracing::error!(error = %e, "http server failed");
            }
        });
        tracing::info!(%local_addr, "serving http/websocket");
        Ok(local_addr)
    }

    /// Serve framed TCP on `addr`.
    pub async fn serve_tcp(&self, addr: &str) -> std::io::Result<SocketAddr> {
        tcp::listen(addr, self.intake.clone(), self.lifecycle.shutdown_token()).await
    }

    /// Drain with the configured deadline, then stop.
    pub async fn graceful_shutdown(&self) {
        self.lifecycle
            .graceful_shutdown(self.config.graceful_timeout)
            .await;
    }

    /// Drain with an explicit deadline, then stop.
    pub async fn graceful_shutdown_with(&self, timeout: Duration) {
        self.lifecycle.graceful_shutdown(timeout).await;
    }

    /// Immediate stop.
    pub async fn shutdown(&self) {
        self.lifecycle.shutdown().await;
    }

    pub fn health(&self) -> HealthStatus {
        self.lifecycle.health()
    }

    pub fn stats(&self) -> InflightStats {
        self.tracker.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ActorError;
    use crate::invoke::{Arguments, ResultSink};
    use crate::transport::memory::MemoryConnection;
    use crate::wire::{
        Envelope, InvocationEnvelope, decode_envelope, encode_envelope,
    };
    use async_trait::async_trait;
    use uuid::Uuid;

    struct Greeter;

    #[async_trait]
    impl RemoteActor for Greeter {
        fn type_name(&self) -> &'static str {
            "Greeter"
        }

        async fn execute(
            &self,
            target: &str,
            _substitutions: &[String],
            args: &mut Arguments,
            sink: &mut ResultSink,
        ) -> Result<(), ActorError> {
            match target {
                "greet" => {
                    let name: String =
                        args.next().map_err(|e| ActorError::method(e.to_string()))?;
                    sink.complete(&format!("hello {name}"))
                        .map_err(|e| ActorError::method(e.to_string()))?;
                    Ok(())
                }
                other => Err(ActorError::UnknownTarget {
                    target: other.to_string(),
                }),
            }
        }
    }

    #[tokio::test]
    async fn memory_connection_round_trip() {
        let server = Server::builder().build();
        server.expose("greeter", Arc::new(Greeter)).unwrap();

        let (connection, mut inbound) = MemoryConnection::connect(server.intake());
        let mut envelope = InvocationEnvelope::new(
            Uuid::new_v4(),
            crate::wire::ActorId::named("greeter").unwrap(),
            "greet",
        );
        envelope.arguments = vec![b"\"world\"".to_vec()];
        let call_id = envelope.call_id;

        connection
            .send(encode_envelope(&Envelope::Invocation(envelope)).unwrap())
            .await
            .unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(1), inbound.recv())
            .await
            .unwrap()
            .unwrap();
        match decode_envelope(&frame).unwrap() {
            Envelope::Response(response) => {
                assert_eq!(response.call_id, call_id);
                assert_eq!(response.result.as_deref(), Some(br#""hello world""#.as_ref()));
            }
            other => panic!("expected response, got {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn shutdown_refuses_new_work_and_reports_unhealthy() {
        let server = Server::builder().build();
        server.expose("greeter", Arc::new(Greeter)).unwrap();
        server.shutdown().await;

        assert_eq!(server.health().status, "unhealthy");
    }

    #[tokio::test]
    async fn stats_count_completed_invocations() {
        let server = Server::builder().build();
        server.expose("greeter", Arc::new(Greeter)).unwrap();

        let (connection, mut inbound) = MemoryConnection::connect(server.intake());
        for _ in 0..3 {
            let mut envelope = InvocationEnvelope::new(
                Uuid::new_v4(),
                crate::wire::ActorId::named("greeter").unwrap(),
                "greet",
            );
            envelope.arguments = vec![b"\"x\"".to_vec()];
            connection
                .send(encode_envelope(&Envelope::Invocation(envelope)).unwrap())
                .await
                .unwrap();
            let _ = tokio::time::timeout(Duration::from_secs(1), inbound.recv())
                .await
                .unwrap()
                .unwrap();
        }

        let stats = server.stats();
        assert_eq!(stats.completed, 3);
        assert_eq!(stats.per_actor.get("greeter"), Some(&3));
    }
}
