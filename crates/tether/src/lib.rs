//! tether — location-transparent remote invocation and realtime state
//! streaming for named actors.
//!
//! A process exposes actors under stable names; remote callers invoke
//! methods and subscribe to per-actor state streams over websocket,
//! framed TCP, or stateless HTTP, all speaking the same JSON envelope
//! protocol. Streams carry monotone sequence numbers, are filtered
//! server-side, and survive reconnects through a bounded replay buffer.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tether::server::Server;
//! # struct Calc;
//! # #[async_trait::async_trait]
//! # impl tether::actor::RemoteActor for Calc {
//! #     fn type_name(&self) -> &'static str { "Calc" }
//! #     async fn execute(
//! #         &self,
//! #         _t: &str,
//! #         _s: &[String],
//! #         _a: &mut tether::invoke::Arguments,
//! #         _r: &mut tether::invoke::ResultSink,
//! #     ) -> Result<(), tether::error::ActorError> { Ok(()) }
//! # }
//!
//! # async fn run() -> anyhow::Result<()> {
//! let server = Server::builder().build();
//! server.expose("calc", Arc::new(Calc))?;
//! server.serve_http("127.0.0.1:8080").await?;
//! # Ok(())
//! # }
//! ```

pub mod actor;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod invoke;
pub mod lifecycle;
pub mod middleware;
pub mod server;
pub mod state;
pub mod stream;
pub mod transport;
pub mod wire;

pub use actor::{ActorRegistry, RemoteActor, StateStream};
pub use dispatch::Dispatcher;
pub use error::{ActorError, DecodeError, DispatchError, StateError, TransportError, WireError};
pub use invoke::{Arguments, ResultSink};
pub use lifecycle::{HealthStatus, InflightTracker, LifecycleManager, ServerPhase};
pub use middleware::{InvocationContext, Middleware, MiddlewareChain, Principal};
pub use server::{Server, ServerBuilder, ServerConfig};
pub use stream::{StreamBufferConfig, StreamRegistry};
pub use wire::{
    ActorId, Envelope, Filter, InvocationEnvelope, ResponseEnvelope, StreamDataEnvelope,
    StreamEndEnvelope, StreamEndReason, StreamErrorEnvelope, StreamResumeEnvelope,
    StreamStartEnvelope, TraceContext, decode_envelope, encode_envelope,
};
