//! Observability layers: span creation and propagation, invocation
//! metrics, and structured logging with redaction.

use crate::actor::RemoteActor;
use crate::error::DispatchError;
use crate::middleware::{InvocationContext, Middleware, Next};
use crate::wire::{InvocationEnvelope, ResponseEnvelope, TraceContext};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::Instant;

/// Span outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanStatus {
    Ok,
    Error,
}

/// One finished server span.
#[derive(Debug, Clone)]
pub struct Span {
    pub trace_id: u128,
    pub span_id: u64,
    pub parent_span_id: Option<u64>,
    pub name: String,
    pub attributes: HashMap<String, String>,
    pub status: SpanStatus,
    pub error_message: Option<String>,
    pub started_at: OffsetDateTime,
    pub duration: Duration,
}

/// Receives finished spans.
pub trait SpanExporter: Send + Sync {
    fn export(&self, span: Span);
}

/// Collects spans in memory; the exporter used by the test suites.
#[derive(Default)]
pub struct InMemorySpanExporter {
    spans: Mutex<Vec<Span>>,
}

impl InMemorySpanExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finished(&self) -> Vec<Span> {
        self.spans.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.spans.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SpanExporter for InMemorySpanExporter {
    fn export(&self, span: Span) {
        self.spans.lock().push(span);
    }
}

/// Starts a server span per invocation.
///
/// The envelope's trace context becomes the parent; without one a root is
/// created at the edge. The child context replaces `ctx.trace` so
/// downstream layers and the handler propagate the right parent. Handler
/// success ends the span `ok`; a thrown error is recorded and the span
/// ends `error`.
pub struct TracingLayer {
    exporter: Arc<dyn SpanExporter>,
}

impl TracingLayer {
    pub fn new(exporter: Arc<dyn SpanExporter>) -> Self {
        Self { exporter }
    }
}

#[async_trait]
impl Middleware for TracingLayer {
    async fn handle(
        &self,
        envelope: &InvocationEnvelope,
        actor: &Arc<dyn RemoteActor>,
        ctx: &mut InvocationContext,
        next: Next<'_>,
    ) -> Result<ResponseEnvelope, DispatchError> {
        let child = match envelope.trace_context.as_ref().or(ctx.trace.as_ref()) {
            Some(parent) => parent.child(),
            None => TraceContext::root(),
        };
        ctx.trace = Some(child);

        let name = format!("{}.{}", envelope.actor_id.id, envelope.target);
        let mut attributes = HashMap::new();
        attributes.insert("actor.id".to_string(), envelope.actor_id.id.clone());
        attributes.insert("actor.target".to_string(), envelope.target.clone());

        let started_at = OffsetDateTime::now_utc();
        let started = Instant::now();
        let result = next.run(envelope, actor, ctx).await;
        let duration = started.elapsed();

        let (status, error_message) = match &result {
            Ok(_) => (SpanStatus::Ok, None),
            Err(e) => (SpanStatus::Error, Some(e.to_string())),
        };
        self.exporter.export(Span {
            trace_id: child.trace_id,
            span_id: child.span_id,
            parent_span_id: child.parent_span_id,
            name,
            attributes,
            status,
            error_message,
            started_at,
            duration,
        });
        result
    }

    fn name(&self) -> &'static str {
        "tracing"
    }
}

/// Receives invocation metrics.
pub trait MetricsCollector: Send + Sync {
    /// Count one invocation, tagged by actor type, method, and outcome
    /// (`success`, `failure`, or `error`).
    fn record_invocation(&self, actor_type: &str, method: &str, outcome: &str);
    fn record_duration(&self, actor_type: &str, method: &str, duration: Duration);
    /// Payload volume; direction is `in` (arguments) or `out` (result).
    fn record_payload_size(&self, direction: &str, bytes: usize);
}

/// In-memory collector for tests and embedded inspection.
#[derive(Default)]
pub struct InMemoryMetrics {
    counters: Mutex<HashMap<(String, String, String), u64>>,
    durations: Mutex<Vec<(String, String, Duration)>>,
    payload_bytes: Mutex<HashMap<String, usize>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invocation_count(&self, actor_type: &str, method: &str, outcome: &str) -> u64 {
        self.counters
            .lock()
            .get(&(
                actor_type.to_string(),
                method.to_string(),
                outcome.to_string(),
            ))
            .copied()
            .unwrap_or(0)
    }

    pub fn recorded_durations(&self) -> Vec<(String, String, Duration)> {
        self.durations.lock().clone()
    }

    pub fn payload_bytes(&self, direction: &str) -> usize {
        self.payload_bytes
            .lock()
            .get(direction)
            .copied()
            .unwrap_or(0)
    }
}

impl MetricsCollector for InMemoryMetrics {
    fn record_invocation(&self, actor_type: &str, method: &str, outcome: &str) {
        *self
            .counters
            .lock()
            .entry((
                actor_type.to_string(),
                method.to_string(),
                outcome.to_string(),
            ))
            .or_insert(0) += 1;
    }

    fn record_duration(&self, actor_type: &str, method: &str, duration: Duration) {
        self.durations
            .lock()
            .push((actor_type.to_string(), method.to_string(), duration));
    }

    fn record_payload_size(&self, direction: &str, bytes: usize) {
        *self
            .payload_bytes
            .lock()
            .entry(direction.to_string())
            .or_insert(0) += bytes;
    }
}

/// Counts invocations, times them, and sizes their payloads.
pub struct MetricsLayer {
    collector: Arc<dyn MetricsCollector>,
}

impl MetricsLayer {
    pub fn new(collector: Arc<dyn MetricsCollector>) -> Self {
        Self { collector }
    }
}

#[async_trait]
impl Middleware for MetricsLayer {
    async fn handle(
        &self,
        envelope: &InvocationEnvelope,
        actor: &Arc<dyn RemoteActor>,
        ctx: &mut InvocationContext,
        next: Next<'_>,
    ) -> Result<ResponseEnvelope, DispatchError> {
        let inbound: usize = envelope.arguments.iter().map(Vec::len).sum();
        self.collector.record_payload_size("in", inbound);

        let started = Instant::now();
        let result = next.run(envelope, actor, ctx).await;
        self.collector
            .record_duration(actor.type_name(), &envelope.target, started.elapsed());

        let outcome = match &result {
            Ok(response) if response.is_success() => "success",
            Ok(_) => "failure",
            Err(_) => "error",
        };
        self.collector
            .record_invocation(actor.type_name(), &envelope.target, outcome);
        if let Ok(response) = &result {
            if let Some(result_bytes) = &response.result {
                self.collector.record_payload_size("out", result_bytes.len());
            }
        }
        result
    }

    fn name(&self) -> &'static str {
        "metrics"
    }
}

const REDACTED: &str = "[REDACTED]";

/// Structured invocation logging.
///
/// Metadata keys from the configured redaction set are masked
/// case-insensitively before anything is emitted.
pub struct LoggingLayer {
    redact: Vec<String>,
}

impl LoggingLayer {
    pub fn new<I, S>(redact_keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            redact: redact_keys
                .into_iter()
                .map(|key| key.into().to_lowercase())
                .collect(),
        }
    }

    fn redacted(&self, metadata: &HashMap<String, String>) -> HashMap<String, String> {
        metadata
            .iter()
            .map(|(key, value)| {
                if self.redact.contains(&key.to_lowercase()) {
                    (key.clone(), REDACTED.to_string())
                } else {
                    (key.clone(), value.clone())
                }
            })
            .collect()
    }
}

#[async_trait]
impl Middleware for LoggingLayer {
    async fn handle(
        &self,
        envelope: &InvocationEnvelope,
        actor: &Arc<dyn RemoteActor>,
        ctx: &mut InvocationContext,
        next: Next<'_>,
    ) -> Result<ResponseEnvelope, DispatchError> {
        let result = next.run(envelope, actor, ctx).await;
        let metadata = self.redacted(&ctx.metadata);
        match &result {
            Ok(response) if response.is_success() => {
                tracing::info!(
                    actor = %envelope.actor_id.id,
                    target = %envelope.target,
                    call_id = %envelope.call_id,
                    metadata = ?metadata,
                    "invocation succeeded"
                );
            }
            Ok(response) => {
                tracing::warn!(
                    actor = %envelope.actor_id.id,
                    target = %envelope.target,
                    call_id = %envelope.call_id,
                    error = response.error_message.as_deref().unwrap_or(""),
                    metadata = ?metadata,
                    "invocation failed"
                );
            }
            Err(e) => {
                tracing::warn!(
                    actor = %envelope.actor_id.id,
                    target = %envelope.target,
                    call_id = %envelope.call_id,
                    error = %e,
                    metadata = ?metadata,
                    "invocation rejected"
                );
            }
        }
        result
    }

    fn name(&self) -> &'static str {
        "logging"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::MiddlewareChain;
    use crate::middleware::testutil::{FailingHandler, OkHandler, envelope, noop_actor};

    // ── Tracing ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn creates_a_root_span_when_the_envelope_has_no_context() {
        let exporter = Arc::new(InMemorySpanExporter::new());
        let chain = MiddlewareChain::new().with(Arc::new(TracingLayer::new(exporter.clone())));
        let mut ctx = InvocationContext::new();
        chain
            .execute(&envelope("ping"), &noop_actor(), &mut ctx, &OkHandler::new())
            .await
            .unwrap();

        let spans = exporter.finished();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].name, "noop.ping");
        assert_eq!(spans[0].status, SpanStatus::Ok);
        assert!(spans[0].parent_span_id.is_none());
        assert_eq!(
            spans[0].attributes.get("actor.id").map(String::as_str),
            Some("noop")
        );
        assert_eq!(
            spans[0].attributes.get("actor.target").map(String::as_str),
            Some("ping")
        );
    }

    #[tokio::test]
    async fn continues_the_envelope_trace_as_a_child() {
        let exporter = Arc::new(InMemorySpanExporter::new());
        let chain = MiddlewareChain::new().with(Arc::new(TracingLayer::new(exporter.clone())));
        let parent = TraceContext::root();
        let mut env = envelope("ping");
        env.trace_context = Some(parent);
        let mut ctx = InvocationContext::new();
        chain
            .execute(&env, &noop_actor(), &mut ctx, &OkHandler::new())
            .await
            .unwrap();

        let spans = exporter.finished();
        assert_eq!(spans[0].trace_id, parent.trace_id);
        assert_eq!(spans[0].parent_span_id, Some(parent.span_id));
        // The child context is left for the handler to propagate.
        assert_eq!(ctx.trace.unwrap().parent_span_id, Some(parent.span_id));
    }

    #[tokio::test]
    async fn a_thrown_error_ends_the_span_with_error_status() {
        let exporter = Arc::new(InMemorySpanExporter::new());
        let chain = MiddlewareChain::new().with(Arc::new(TracingLayer::new(exporter.clone())));
        let mut ctx = InvocationContext::new();
        let _ = chain
            .execute(&envelope("ping"), &noop_actor(), &mut ctx, &FailingHandler)
            .await;

        let spans = exporter.finished();
        assert_eq!(spans[0].status, SpanStatus::Error);
        assert!(
            spans[0]
                .error_message
                .as_deref()
                .unwrap()
                .contains("handler exploded")
        );
    }

    // ── Metrics ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn counts_outcomes_and_durations() {
        let metrics = Arc::new(InMemoryMetrics::new());
        let chain = MiddlewareChain::new().with(Arc::new(MetricsLayer::new(metrics.clone())));
        let mut ctx = InvocationContext::new();

        chain
            .execute(&envelope("ping"), &noop_actor(), &mut ctx, &OkHandler::new())
            .await
            .unwrap();
        let _ = chain
            .execute(&envelope("ping"), &noop_actor(), &mut ctx, &FailingHandler)
            .await;

        assert_eq!(metrics.invocation_count("Noop", "ping", "success"), 1);
        assert_eq!(metrics.invocation_count("Noop", "ping", "error"), 1);
        assert_eq!(metrics.recorded_durations().len(), 2);
    }

    #[tokio::test]
    async fn records_payload_sizes_both_ways() {
        let metrics = Arc::new(InMemoryMetrics::new());
        let chain = MiddlewareChain::new().with(Arc::new(MetricsLayer::new(metrics.clone())));
        let mut env = envelope("ping");
        env.arguments = vec![vec![0; 10], vec![0; 5]];
        let mut ctx = InvocationContext::new();
        chain
            .execute(&env, &noop_actor(), &mut ctx, &OkHandler::new())
            .await
            .unwrap();

        assert_eq!(metrics.payload_bytes("in"), 15);
        assert_eq!(metrics.payload_bytes("out"), 2); // b"ok"
    }

    // ── Logging ────────────────────────────────────────────────────────────

    #[test]
    fn redaction_is_case_insensitive() {
        let layer = LoggingLayer::new(["Authorization", "x-api-key"]);
        let mut metadata = HashMap::new();
        metadata.insert("AUTHORIZATION".to_string(), "Bearer hunter2".to_string());
        metadata.insert("X-Api-Key".to_string(), "hunter2".to_string());
        metadata.insert("request-id".to_string(), "r-1".to_string());

        let cleaned = layer.redacted(&metadata);
        assert_eq!(cleaned["AUTHORIZATION"], REDACTED);
        assert_eq!(cleaned["X-Api-Key"], REDACTED);
        assert_eq!(cleaned["request-id"], "r-1");
    }

    #[tokio::test]
    async fn logging_layer_passes_results_through_unchanged() {
        let chain = MiddlewareChain::new().with(Arc::new(LoggingLayer::new(["x-api-key"])));
        let mut ctx = InvocationContext::new();
        let response = chain
            .execute(&envelope("ping"), &noop_actor(), &mut ctx, &OkHandler::new())
            .await
            .unwrap();
        assert!(response.is_success());

        let err = chain
            .execute(&envelope("ping"), &noop_actor(), &mut ctx, &FailingHandler)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Method(_)));
    }
}
