//! tether-broker — durable connection fan-out for serverless tether
//! deployments.
//!
//! Where a long-lived server drains actor streams in-process, a
//! serverless deployment records each subscription in a connection index
//! ([`storage`]), posts frames through a management API ([`sender`]), and
//! converts the persistent state KV's change log into per-connection
//! stream frames ([`tailer`]). The [`gateway`] module adapts API-gateway
//! websocket events onto the same dispatch kernel.

pub mod broker;
pub mod error;
pub mod gateway;
pub mod sender;
pub mod storage;
pub mod tailer;

pub use broker::{BroadcastReport, ConnectionBroker};
pub use error::{BrokerError, SendError};
pub use gateway::{GatewayAdapter, GatewayEvent, GatewayResponse, RequestContext};
pub use sender::{ConnectionInfo, ConnectionSender, InMemoryConnectionSender};
pub use storage::{ConnectionStorage, InMemoryConnectionStorage, Subscription};
pub use tailer::{ChangeEvent, ChangeFeed, ChangeKind, StateTailer};
