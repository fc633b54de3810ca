//! Bounded per-stream replay window.
//!
//! Each live stream owns a sliding ring of `(sequence, payload)` frames.
//! Capacity is enforced by evicting the oldest frame; a buffer idle
//! longer than its TTL is dropped wholesale, either lazily on lookup or
//! by the periodic sweep.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::Instant;
use uuid::Uuid;

/// Replay window policy. The defaults are enforced even when callers do
/// not configure anything.
#[derive(Debug, Clone)]
pub struct StreamBufferConfig {
    /// Frames retained per stream.
    pub capacity: usize,
    /// Idle lifetime of a buffer.
    pub ttl: Duration,
    /// How often the background sweep runs.
    pub sweep_interval: Duration,
}

impl Default for StreamBufferConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// One buffered frame, kept with its original emission timestamp so a
/// replay carries the same `timestamp` the live frame did.
#[derive(Debug, Clone)]
pub struct BufferedFrame {
    pub sequence: u64,
    pub data: Vec<u8>,
    pub enqueued_at: OffsetDateTime,
}

struct Ring {
    frames: VecDeque<BufferedFrame>,
    last_activity: Instant,
}

/// All replay buffers of one server, keyed by stream id.
pub struct StreamBuffers {
    rings: Mutex<HashMap<Uuid, Ring>>,
    config: StreamBufferConfig,
}

impl StreamBuffers {
    pub fn new(config: StreamBufferConfig) -> Self {
        Self {
            rings: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &StreamBufferConfig {
        &self.config
    }

    /// Append one emitted frame, evicting the oldest past capacity.
    pub fn append(&self, stream_id: Uuid, sequence: u64, data: Vec<u8>) {
        let mut rings = self.rings.lock();
        let ring = rings.entry(stream_id).or_insert_with(|| Ring {
            frames: VecDeque::with_capacity(self.config.capacity),
            last_activity: Instant::now(),
        });
        if ring.frames.len() == self.config.capacity {
            ring.frames.pop_front();
        }
        ring.frames.push_back(BufferedFrame {
            sequence,
            data,
            enqueued_at: OffsetDateTime::now_utc(),
        });
        ring.last_activity = Instant::now();
    }

    /// Frames with `sequence > after`, in order.
    ///
    /// Returns `None` when the stream has no buffer, or when the buffer's
    /// idle age exceeds the TTL — in which case the buffer is removed on
    /// the spot.
    pub fn collect_after(&self, stream_id: Uuid, after: u64) -> Option<Vec<BufferedFrame>> {
        let mut rings = self.rings.lock();
        let ring = rings.get(&stream_id)?;
        if ring.last_activity.elapsed() > self.config.ttl {
            rings.remove(&stream_id);
            return None;
        }
        Some(
            ring.frames
                .iter()
                .filter(|frame| frame.sequence > after)
                .cloned()
                .collect(),
        )
    }

    /// Drop a buffer on stream completion.
    pub fn remove(&self, stream_id: Uuid) {
        self.rings.lock().remove(&stream_id);
    }

    /// Drop every buffer (server shutdown).
    pub fn clear(&self) {
        self.rings.lock().clear();
    }

    /// Evict buffers idle longer than the TTL. Returns how many went.
    pub fn sweep(&self) -> usize {
        let mut rings = self.rings.lock();
        let before = rings.len();
        let ttl = self.config.ttl;
        rings.retain(|_, ring| ring.last_activity.elapsed() <= ttl);
        before - rings.len()
    }

    pub fn len(&self) -> usize {
        self.rings.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
