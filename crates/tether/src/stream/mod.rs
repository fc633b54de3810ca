//! Server-side state streaming: replay buffers, filters, and the stream
//! registry that drives `observe*` invocations.

pub mod buffer;
pub mod filter;
pub mod registry;

pub use buffer::{BufferedFrame, StreamBufferConfig, StreamBuffers};
pub use filter::FilterState;
pub use registry::{ResumeOutcome, StreamRegistry};
