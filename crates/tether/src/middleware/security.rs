//! Security layers: authentication, authorization, rate limiting, and
//! envelope validation.

use crate::actor::RemoteActor;
use crate::error::DispatchError;
use crate::middleware::{InvocationContext, Middleware, Next, Principal};
use crate::wire::{InvocationEnvelope, ResponseEnvelope};
use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;

/// Resolves credentials carried by an invocation to a [`Principal`].
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(
        &self,
        envelope: &InvocationEnvelope,
        metadata: &HashMap<String, String>,
    ) -> Result<Principal, String>;
}

/// Static API-key lookup over the transport metadata.
///
/// Accepts either an `x-api-key` entry or an `authorization: Bearer ...`
/// entry; keys compare verbatim.
pub struct ApiKeyAuthenticator {
    keys: HashMap<String, Principal>,
}

impl ApiKeyAuthenticator {
    pub fn new(keys: HashMap<String, Principal>) -> Self {
        Self { keys }
    }

    fn extract(metadata: &HashMap<String, String>) -> Option<&str> {
        if let Some(key) = metadata.get("x-api-key") {
            return Some(key.as_str());
        }
        metadata
            .get("authorization")
            .and_then(|value| value.strip_prefix("Bearer "))
    }
}

#[async_trait]
impl Authenticator for ApiKeyAuthenticator {
    async fn authenticate(
        &self,
        _envelope: &InvocationEnvelope,
        metadata: &HashMap<String, String>,
    ) -> Result<Principal, String> {
        let key = Self::extract(metadata).ok_or_else(|| "missing credentials".to_string())?;
        self.keys
            .get(key)
            .cloned()
            .ok_or_else(|| "unknown credentials".to_string())
    }
}

/// Stores the authenticated principal into the invocation context.
pub struct AuthenticationLayer {
    authenticator: Arc<dyn Authenticator>,
}

impl AuthenticationLayer {
    pub fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        Self { authenticator }
    }
}

#[async_trait]
impl Middleware for AuthenticationLayer {
    async fn handle(
        &self,
        envelope: &InvocationEnvelope,
        actor: &Arc<dyn RemoteActor>,
        ctx: &mut InvocationContext,
        next: Next<'_>,
    ) -> Result<ResponseEnvelope, DispatchError> {
        let principal = self
            .authenticator
            .authenticate(envelope, &ctx.metadata)
            .await
            .map_err(DispatchError::Authentication)?;
        tracing::debug!(principal = %principal.id, "authenticated");
        ctx.principal = Some(principal);
        next.run(envelope, actor, ctx).await
    }

    fn name(&self) -> &'static str {
        "authentication"
    }
}

#[derive(Debug, Clone)]
struct AccessRule {
    role: String,
    /// `None` matches any actor type.
    actor_type: Option<String>,
    /// `None` matches any method.
    method: Option<String>,
}

/// Role-based rules over `(actor type, method)`.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    rules: Vec<AccessRule>,
}

impl AccessPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow `role` on `(actor_type, method)`; `None` wildcards a side.
    pub fn allow(
        mut self,
        role: impl Into<String>,
        actor_type: Option<&str>,
        method: Option<&str>,
    ) -> Self {
        self.rules.push(AccessRule {
            role: role.into(),
            actor_type: actor_type.map(str::to_string),
            method: method.map(str::to_string),
        });
        self
    }

    pub fn authorizes(&self, principal: &Principal, actor_type: &str, method: &str) -> bool {
        self.rules.iter().any(|rule| {
            principal.has_role(&rule.role)
                && rule
                    .actor_type
                    .as_deref()
                    .is_none_or(|t| t == actor_type)
                && rule.method.as_deref().is_none_or(|m| m == method)
        })
    }
}

/// Denies invocations the policy does not allow.
pub struct AuthorizationLayer {
    policy: AccessPolicy,
}

impl AuthorizationLayer {
    pub fn new(policy: AccessPolicy) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl Middleware for AuthorizationLayer {
    async fn handle(
        &self,
        envelope: &InvocationEnvelope,
        actor: &Arc<dyn RemoteActor>,
        ctx: &mut InvocationContext,
        next: Next<'_>,
    ) -> Result<ResponseEnvelope, DispatchError> {
        let principal = ctx.principal.as_ref().ok_or_else(|| {
            DispatchError::Authorization("no authenticated principal".to_string())
        })?;
        if !self
            .policy
            .authorizes(principal, actor.type_name(), &envelope.target)
        {
            return Err(DispatchError::Authorization(format!(
                "principal '{}' may not call {}.{}",
                principal.id,
                actor.type_name(),
                envelope.target
            )));
        }
        next.run(envelope, actor, ctx).await
    }

    fn name(&self) -> &'static str {
        "authorization"
    }
}

/// Token-bucket parameters.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub requests_per_second: f64,
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 100.0,
            burst: 20,
        }
    }
}

/// Which bucket an invocation draws from.
///
/// Per-principal keys use `Principal.id` alone. Placed before the
/// authentication layer (the recommended order) no principal exists yet
/// and the layer falls back to the global bucket; order it after
/// authentication to get true per-principal limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitScope {
    Global,
    PerPrincipal,
}

struct TokenBucket {
    tokens: f64,
    refilled_at: Instant,
}

impl TokenBucket {
    fn full(burst: u32) -> Self {
        Self {
            tokens: f64::from(burst),
            refilled_at: Instant::now(),
        }
    }

    fn try_acquire(&mut self, config: &RateLimitConfig) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.refilled_at).as_secs_f64();
        self.tokens =
            (self.tokens + elapsed * config.requests_per_second).min(f64::from(config.burst));
        self.refilled_at = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

const GLOBAL_BUCKET: &str = "\u{0}global";

/// Token-bucket rate limiting keyed globally or per principal.
pub struct RateLimitLayer {
    config: RateLimitConfig,
    scope: RateLimitScope,
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl RateLimitLayer {
    pub fn new(config: RateLimitConfig, scope: RateLimitScope) -> Self {
        Self {
            config,
            scope,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn acquire(&self, key: &str) -> bool {
        let mut buckets = self.buckets.lock();
        buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::full(self.config.burst))
            .try_acquire(&self.config)
    }
}

#[async_trait]
impl Middleware for RateLimitLayer {
    async fn handle(
        &self,
        envelope: &InvocationEnvelope,
        actor: &Arc<dyn RemoteActor>,
        ctx: &mut InvocationContext,
        next: Next<'_>,
    ) -> Result<ResponseEnvelope, DispatchError> {
        let key = match (self.scope, ctx.principal.as_ref()) {
            (RateLimitScope::PerPrincipal, Some(principal)) => principal.id.as_str(),
            _ => GLOBAL_BUCKET,
        };
        if !self.acquire(key) {
            return Err(DispatchError::RateLimited(format!(
                "bucket exhausted for '{}'",
                envelope.actor_id.id
            )));
        }
        next.run(envelope, actor, ctx).await
    }

    fn name(&self) -> &'static str {
        "rate-limit"
    }
}

/// Envelope shape limits.
#[derive(Debug, Clone)]
pub struct ValidationConfig {
    pub max_argument_bytes: usize,
    pub max_arguments: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_argument_bytes: 1024 * 1024,
            max_arguments: 64,
        }
    }
}

/// Rejects malformed invocations before anything else runs: target
/// identifiers are alphanumeric plus underscore, argument counts and
/// per-argument payload sizes are bounded.
pub struct ValidationLayer {
    config: ValidationConfig,
    target_pattern: Regex,
}

impl ValidationLayer {
    pub fn new(config: ValidationConfig) -> Self {
        Self {
            config,
            // Compile-time constant pattern; cannot fail.
            target_pattern: Regex::new("^[A-Za-z0-9_]+$").unwrap(),
        }
    }
}

impl Default for ValidationLayer {
    fn default() -> Self {
        Self::new(ValidationConfig::default())
    }
}

#[async_trait]
impl Middleware for ValidationLayer {
    async fn handle(
        &self,
        envelope: &InvocationEnvelope,
        actor: &Arc<dyn RemoteActor>,
        ctx: &mut InvocationContext,
        next: Next<'_>,
    ) -> Result<ResponseEnvelope, DispatchError> {
        if !self.target_pattern.is_match(&envelope.target) {
            return Err(DispatchError::Validation(format!(
                "invalid target identifier '{}'",
                envelope.target
            )));
        }
        if envelope.arguments.len() > self.config.max_arguments {
            return Err(DispatchError::Validation(format!(
                "too many arguments: {} > {}",
                envelope.arguments.len(),
                self.config.max_arguments
            )));
        }
        if let Some(oversized) = envelope
            .arguments
            .iter()
            .position(|arg| arg.len() > self.config.max_argument_bytes)
        {
            return Err(DispatchError::Validation(format!(
                "argument {} exceeds {} bytes",
                oversized, self.config.max_argument_bytes
            )));
        }
        next.run(envelope, actor, ctx).await
    }

    fn name(&self) -> &'static str {
        "validation"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::MiddlewareChain;
    use crate::middleware::testutil::{OkHandler, envelope, noop_actor};
    use std::time::Duration;

    fn api_keys() -> Arc<dyn Authenticator> {
        let mut keys = HashMap::new();
        keys.insert(
            "secret-1".to_string(),
            Principal::new("alice", "user").with_roles(["reader", "writer"]),
        );
        keys.insert(
            "secret-2".to_string(),
            Principal::new("bob", "service").with_roles(["reader"]),
        );
        Arc::new(ApiKeyAuthenticator::new(keys))
    }

    // ── Authentication ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn api_key_header_authenticates_and_sets_principal() {
        let chain =
            MiddlewareChain::new().with(Arc::new(AuthenticationLayer::new(api_keys())));
        let mut ctx = InvocationContext::new();
        ctx.metadata
            .insert("x-api-key".to_string(), "secret-1".to_string());
        chain
            .execute(&envelope("ping"), &noop_actor(), &mut ctx, &OkHandler::new())
            .await
            .unwrap();
        assert_eq!(ctx.principal.as_ref().unwrap().id, "alice");
    }

    #[tokio::test]
    async fn bearer_token_is_accepted() {
        let chain =
            MiddlewareChain::new().with(Arc::new(AuthenticationLayer::new(api_keys())));
        let mut ctx = InvocationContext::new();
        ctx.metadata
            .insert("authorization".to_string(), "Bearer secret-2".to_string());
        chain
            .execute(&envelope("ping"), &noop_actor(), &mut ctx, &OkHandler::new())
            .await
            .unwrap();
        assert_eq!(ctx.principal.as_ref().unwrap().id, "bob");
    }

    #[tokio::test]
    async fn missing_and_unknown_credentials_fail() {
        let chain =
            MiddlewareChain::new().with(Arc::new(AuthenticationLayer::new(api_keys())));
        let mut ctx = InvocationContext::new();
        let err = chain
            .execute(&envelope("ping"), &noop_actor(), &mut ctx, &OkHandler::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Authentication(_)));

        ctx.metadata
            .insert("x-api-key".to_string(), "wrong".to_string());
        let err = chain
            .execute(&envelope("ping"), &noop_actor(), &mut ctx, &OkHandler::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Authentication(_)));
    }

    // ── Authorization ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn policy_scopes_roles_to_actor_type_and_method() {
        let policy = AccessPolicy::new()
            .allow("reader", Some("Noop"), Some("ping"))
            .allow("writer", Some("Noop"), None);
        let chain = MiddlewareChain::new().with(Arc::new(AuthorizationLayer::new(policy)));

        let mut ctx = InvocationContext::new();
        ctx.principal = Some(Principal::new("bob", "service").with_roles(["reader"]));
        assert!(
            chain
                .execute(&envelope("ping"), &noop_actor(), &mut ctx, &OkHandler::new())
                .await
                .is_ok()
        );

        let err = chain
            .execute(&envelope("purge"), &noop_actor(), &mut ctx, &OkHandler::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Authorization(_)));

        // The writer wildcard covers every method on the type.
        ctx.principal = Some(Principal::new("alice", "user").with_roles(["writer"]));
        assert!(
            chain
                .execute(&envelope("purge"), &noop_actor(), &mut ctx, &OkHandler::new())
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn unauthenticated_invocations_are_denied() {
        let policy = AccessPolicy::new().allow("reader", None, None);
        let chain = MiddlewareChain::new().with(Arc::new(AuthorizationLayer::new(policy)));
        let mut ctx = InvocationContext::new();
        let err = chain
            .execute(&envelope("ping"), &noop_actor(), &mut ctx, &OkHandler::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Authorization(_)));
    }

    // ── Rate limiting ──────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn burst_then_refill() {
        let layer = Arc::new(RateLimitLayer::new(
            RateLimitConfig {
                requests_per_second: 1.0,
                burst: 2,
            },
            RateLimitScope::Global,
        ));
        let chain = MiddlewareChain::new().with(layer);
        let handler = OkHandler::new();
        let mut ctx = InvocationContext::new();

        for _ in 0..2 {
            chain
                .execute(&envelope("ping"), &noop_actor(), &mut ctx, &handler)
                .await
                .unwrap();
        }
        let err = chain
            .execute(&envelope("ping"), &noop_actor(), &mut ctx, &handler)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::RateLimited(_)));

        tokio::time::advance(Duration::from_secs(1)).await;
        chain
            .execute(&envelope("ping"), &noop_actor(), &mut ctx, &handler)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn per_principal_buckets_are_isolated() {
        let layer = Arc::new(RateLimitLayer::new(
            RateLimitConfig {
                requests_per_second: 0.001,
                burst: 1,
            },
            RateLimitScope::PerPrincipal,
        ));
        let chain = MiddlewareChain::new().with(layer);
        let handler = OkHandler::new();

        let mut alice = InvocationContext::new();
        alice.principal = Some(Principal::new("alice", "user"));
        let mut bob = InvocationContext::new();
        bob.principal = Some(Principal::new("bob", "user"));

        chain
            .execute(&envelope("ping"), &noop_actor(), &mut alice, &handler)
            .await
            .unwrap();
        assert!(
            chain
                .execute(&envelope("ping"), &noop_actor(), &mut alice, &handler)
                .await
                .is_err()
        );
        // Bob's bucket is untouched by Alice's exhaustion.
        chain
            .execute(&envelope("ping"), &noop_actor(), &mut bob, &handler)
            .await
            .unwrap();
    }

    // ── Validation ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn target_identifier_must_be_alphanumeric_or_underscore() {
        let chain = MiddlewareChain::new().with(Arc::new(ValidationLayer::default()));
        let handler = OkHandler::new();
        let mut ctx = InvocationContext::new();

        assert!(
            chain
                .execute(&envelope("observe_items2"), &noop_actor(), &mut ctx, &handler)
                .await
                .is_ok()
        );
        for bad in ["add item", "add-item", "add.item", ""] {
            let err = chain
                .execute(&envelope(bad), &noop_actor(), &mut ctx, &handler)
                .await
                .unwrap_err();
            assert!(matches!(err, DispatchError::Validation(_)), "{bad:?}");
        }
    }

    #[tokio::test]
    async fn argument_count_and_size_limits() {
        let chain = MiddlewareChain::new().with(Arc::new(ValidationLayer::new(
            ValidationConfig {
                max_argument_bytes: 8,
                max_arguments: 2,
            },
        )));
        let handler = OkHandler::new();
        let mut ctx = InvocationContext::new();

        let mut too_many = envelope("ping");
        too_many.arguments = vec![vec![1], vec![2], vec![3]];
        assert!(
            chain
                .execute(&too_many, &noop_actor(), &mut ctx, &handler)
                .await
                .is_err()
        );

        let mut too_big = envelope("ping");
        too_big.arguments = vec![vec![0; 9]];
        assert!(
            chain
                .execute(&too_big, &noop_actor(), &mut ctx, &handler)
                .await
                .is_err()
        );

        let mut fine = envelope("ping");
        fine.arguments = vec![vec![0; 8], vec![1]];
        assert!(
            chain
                .execute(&fine, &noop_actor(), &mut ctx, &handler)
                .await
                .is_ok()
        );
    }
}
