//! tether-client — connector for tether actor hosts.
//!
//! Dial a host over websocket, framed TCP, or in-process memory; invoke
//! unary targets and subscribe to `observe*` state streams with
//! duplicate protection and reconnect-resumption.

mod client;
pub mod error;
pub mod stream;

pub use client::Client;
pub use error::ClientError;
pub use stream::{ResumeHandle, StreamEvent, Subscription};
