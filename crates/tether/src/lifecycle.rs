//! In-flight tracking and the server lifecycle machine.
//!
//! Phases move forward only: `Running` → `Draining` → `Stopped`. Draining
//! stops admitting envelopes and polls the in-flight set every 100 ms up
//! to the shutdown deadline; whatever is still running then is aborted,
//! live streams end with `cancelled`, and the shutdown token closes the
//! transports.

use crate::stream::StreamRegistry;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Server lifecycle phase. Transitions are monotone forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerPhase {
    Running,
    Draining,
    Stopped,
}

impl ServerPhase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Running,
            1 => Self::Draining,
            _ => Self::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Running => 0,
            Self::Draining => 1,
            Self::Stopped => 2,
        }
    }
}

struct CallEntry {
    actor: String,
    method: String,
    started: Instant,
}

#[derive(Default)]
struct StatsInner {
    completed: u64,
    total_duration: Duration,
    max_duration: Duration,
    per_actor: HashMap<String, u64>,
}

/// Aggregate invocation statistics.
#[derive(Debug, Clone, Default)]
pub struct InflightStats {
    pub inflight: usize,
    pub completed: u64,
    pub mean_duration: Duration,
    pub max_duration: Duration,
    pub per_actor: HashMap<String, u64>,
}

/// Tracks running invocations and the server's background tasks.
#[derive(Default)]
pub struct InflightTracker {
    calls: Mutex<HashMap<Uuid, CallEntry>>,
    stats: Mutex<StatsInner>,
    call_tasks: Mutex<HashMap<Uuid, AbortHandle>>,
    background: Mutex<HashMap<Uuid, AbortHandle>>,
}

impl InflightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a call entering dispatch. Dropping the guard completes it.
    pub fn begin(
        self: &Arc<Self>,
        call_id: Uuid,
        actor: impl Into<String>,
        method: impl Into<String>,
    ) -> CallGuard {
        let actor = actor.into();
        {
            let mut stats = self.stats.lock();
            *stats.per_actor.entry(actor.clone()).or_insert(0) += 1;
        }
        self.calls.lock().insert(
            call_id,
            CallEntry {
                actor,
                method: method.into(),
                started: Instant::now(),
            },
        );
        CallGuard {
            tracker: self.clone(),
            call_id,
        }
    }

    fn complete(&self, call_id: Uuid) {
        let Some(entry) = self.calls.lock().remove(&call_id) else {
            return;
        };
        let elapsed = entry.started.elapsed();
        let mut stats = self.stats.lock();
        stats.completed += 1;
        stats.total_duration += elapsed;
        if elapsed > stats.max_duration {
            stats.max_duration = elapsed;
        }
        tracing::trace!(%call_id, actor = %entry.actor, method = %entry.method, ?elapsed, "call completed");
    }

    pub fn inflight_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn stats(&self) -> InflightStats {
        let stats = self.stats.lock();
        let mean = if stats.completed > 0 {
            stats.total_duration / stats.completed as u32
        } else {
            Duration::ZERO
        };
        InflightStats {
            inflight: self.calls.lock().len(),
            completed: stats.completed,
            mean_duration: mean,
            max_duration: stats.max_duration,
            per_actor: stats.per_actor.clone(),
        }
    }

    /// Spawn one dispatch task; aborted wholesale when the server stops.
    pub fn spawn_call<F>(self: &Arc<Self>, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = Uuid::new_v4();
        let tracker = self.clone();
        let handle = tokio::spawn(async move {
            future.await;
            tracker.call_tasks.lock().remove(&token);
        });
        self.call_tasks.lock().insert(token, handle.abort_handle());
    }

    /// Spawn a long-lived server task (intake pump, buffer sweeper);
    /// cancelled on stop. Returns the task's tracking id.
    pub fn spawn_background<F>(self: &Arc<Self>, future: F) -> Uuid
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = Uuid::new_v4();
        let handle = tokio::spawn(future);
        self.background.lock().insert(token, handle.abort_handle());
        token
    }

    pub fn cancel_background_task(&self, token: Uuid) {
        if let Some(handle) = self.background.lock().remove(&token) {
            handle.abort();
        }
    }

    fn abort_calls(&self) -> usize {
        let handles: Vec<AbortHandle> = self.call_tasks.lock().drain().map(|(_, h)| h).collect();
        let aborted = handles.len();
        for handle in handles {
            handle.abort();
        }
        self.calls.lock().clear();
        aborted
    }

    fn abort_background(&self) {
        for (_, handle) in self.background.lock().drain() {
            handle.abort();
        }
    }
}

/// RAII completion for one tracked call.
pub struct CallGuard {
    tracker: Arc<InflightTracker>,
    call_id: Uuid,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.tracker.complete(self.call_id);
    }
}

/// Health probe document served at `GET /health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(rename = "inflightRequests")]
    pub inflight_requests: usize,
    #[serde(rename = "activeStreams")]
    pub active_streams: usize,
    /// Seconds since the server started.
    pub uptime: u64,
}

/// Owns the phase machine, the tracker, and the shutdown token.
pub struct LifecycleManager {
    phase: AtomicU8,
    tracker: Arc<InflightTracker>,
    streams: Arc<StreamRegistry>,
    shutdown: CancellationToken,
    started: Instant,
}

impl LifecycleManager {
    pub fn new(tracker: Arc<InflightTracker>, streams: Arc<StreamRegistry>) -> Self {
        Self {
            phase: AtomicU8::new(ServerPhase::Running.as_u8()),
            tracker,
            streams,
            shutdown: CancellationToken::new(),
            started: Instant::now(),
        }
    }

    pub fn phase(&self) -> ServerPhase {
        ServerPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    /// Whether the admission point accepts new envelopes.
    pub fn is_admitting(&self) -> bool {
        self.phase() == ServerPhase::Running
    }

    pub fn tracker(&self) -> Arc<InflightTracker> {
        self.tracker.clone()
    }

    /// Token cancelled when the server stops; transports and pumps listen
    /// on it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop admitting, wait up to `timeout` for in-flight calls to drain,
    /// then force-stop whatever remains.
    pub async fn graceful_shutdown(&self, timeout: Duration) {
        let current = self.phase();
        if current == ServerPhase::Stopped {
            return;
        }
        self.phase
            .store(ServerPhase::Draining.as_u8(), Ordering::SeqCst);
        tracing::info!(?timeout, "draining");

        let deadline = Instant::now() + timeout;
        while self.tracker.inflight_count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
        self.stop_now();
    }

    /// Immediate stop; equivalent to `graceful_shutdown(0)`.
    pub async fn shutdown(&self) {
        self.graceful_shutdown(Duration::ZERO).await;
    }

    fn stop_now(&self) {
        self.phase
            .store(ServerPhase::Stopped.as_u8(), Ordering::SeqCst);
        let aborted = self.tracker.abort_calls();
        if aborted > 0 {
            tracing::warn!(aborted, "cancelled in-flight calls at shutdown");
        }
        self.streams.cancel_all();
        self.tracker.abort_background();
        self.shutdown.cancel();
        tracing::info!("stopped");
    }

    pub fn health(&self) -> HealthStatus {
        let status = match self.phase() {
            ServerPhase::Running => "healthy",
            ServerPhase::Draining => "draining",
            ServerPhase::Stopped => "unhealthy",
        };
        HealthStatus {
            status,
            timestamp: OffsetDateTime::now_utc(),
            inflight_requests: self.tracker.inflight_count(),
            active_streams: self.streams.active_count(),
            uptime: self.started.elapsed().as_secs(),
        }
    }
}
