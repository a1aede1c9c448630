//! Route Resolution
//!
//! Drives a single request through a route's candidates and then its fallback
//! chain until one instance succeeds.
//!
//! # Resolution Loop
//!
//! ```text
//! route.enabled? ── no ──> RouteDisabled
//!       │
//!       v
//! ┌──> StrategySelector.select(remaining route models)
//! │         │                         │
//! │         │ pick                    │ NoEligibleCandidates
//! │         v                         v
//! │   try_admit + invoke          fallback chain (in order, skip open circuits)
//! │     │        │                    │
//! │   success  failure/timeout        │ all failed
//! │     │        │                    v
//! │     v        └── record ──┐   Exhausted { attempts }
//! │   return                  │
//! └───────────────────────────┘
//! ```
//!
//! Every candidate is tried at most once per request, so a resolution makes
//! at most `route.models.len() + chain.len()` attempts. Cancellation stops the
//! loop after recording the in-flight attempt as a failure. The same holds
//! when the resolve future itself is dropped mid-attempt.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::config::{ResolverConfig, Route, RouteModel, Strategy};
use super::fallback::{FallbackGraph, FallbackStore};
use super::health::InstanceHealthTracker;
use super::strategy::{Candidate, SelectionError, StrategySelector};

// ============================================================================
// Invocation Interface
// ============================================================================

/// Failure reported by the instance-invocation collaborator
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum InvocationError {
    /// Could not reach the instance
    #[error("connection error: {0}")]
    Connection(String),

    /// The instance answered with an error status
    #[error("upstream returned {status}: {message}")]
    Status {
        /// HTTP-style status code
        status: u16,
        /// Upstream message
        message: String,
    },

    /// Any other upstream failure
    #[error("upstream error: {0}")]
    Upstream(String),
}

/// Calls a model instance. The routing core never dials providers itself.
#[async_trait]
pub trait InstanceInvoker: Send + Sync {
    /// Whatever the collaborator returns on success
    type Output: Send;

    /// Send the request to `model_name`
    async fn invoke(
        &self,
        model_name: &str,
        ctx: &RequestContext,
    ) -> Result<Self::Output, InvocationError>;
}

/// Per-request state shared with the invoker
#[derive(Clone, Debug)]
pub struct RequestContext {
    /// Correlation ID for logs
    pub request_id: Uuid,

    /// Cancelled when the client goes away
    pub cancellation: CancellationToken,

    /// Overrides the configured per-attempt timeout
    pub attempt_timeout: Option<Duration>,

    /// When the request entered the gateway
    pub received_at: Instant,
}

impl RequestContext {
    /// Fresh context with a random request ID
    #[must_use]
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4(),
            cancellation: CancellationToken::new(),
            attempt_timeout: None,
            received_at: Instant::now(),
        }
    }

    /// Use an existing cancellation token
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Bound each attempt by `timeout`
    #[must_use]
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Whether the client cancelled the request
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Attempt Trail
// ============================================================================

/// Which part of the resolution an attempt belonged to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStage {
    /// One of the route's own models
    Route,
    /// A fallback chain entry
    Fallback,
}

/// Why an attempt did not produce a response
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum AttemptFailure {
    /// The invoker returned an error
    Invocation(String),
    /// The attempt timeout elapsed
    Timeout,
    /// Skipped without calling: circuit open or probe already taken
    CircuitOpen,
    /// The client cancelled while the call was in flight
    Cancelled,
}

impl std::fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invocation(e) => write!(f, "{e}"),
            Self::Timeout => write!(f, "timed out"),
            Self::CircuitOpen => write!(f, "circuit open"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One entry of the attempt trail
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AttemptRecord {
    /// Instance name
    pub model: String,

    /// Route model or fallback
    pub stage: AttemptStage,

    /// What went wrong
    pub failure: AttemptFailure,
}

impl AttemptRecord {
    /// Whether the instance was actually called
    #[must_use]
    pub fn was_invoked(&self) -> bool {
        !matches!(self.failure, AttemptFailure::CircuitOpen)
    }
}

fn format_trail(attempts: &[AttemptRecord]) -> String {
    attempts
        .iter()
        .map(|a| format!("{} ({})", a.model, a.failure))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Successful resolution
#[derive(Debug)]
pub struct Resolution<T> {
    /// Instance that served the request
    pub model: String,

    /// Collaborator output
    pub output: T,

    /// Latency of the successful call
    pub latency: Duration,

    /// Stage the serving instance came from
    pub stage: AttemptStage,

    /// Failed or skipped attempts before the success
    pub attempts: Vec<AttemptRecord>,
}

impl<T> Resolution<T> {
    /// Whether a fallback served the request
    #[must_use]
    pub fn used_fallback(&self) -> bool {
        self.stage == AttemptStage::Fallback
    }
}

/// Terminal resolution failures
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// The route is turned off; never retried
    #[error("model '{slug}' is unavailable")]
    RouteDisabled {
        /// Route slug
        slug: String,
    },

    /// Every route model and fallback failed or was ineligible
    #[error("all candidates for '{slug}' failed: {}", format_trail(attempts))]
    Exhausted {
        /// Route slug
        slug: String,
        /// Ordered attempt trail
        attempts: Vec<AttemptRecord>,
    },

    /// The client cancelled the request
    #[error("request for '{slug}' cancelled after {} attempts", attempts.len())]
    Cancelled {
        /// Route slug
        slug: String,
        /// Attempts made before cancellation
        attempts: Vec<AttemptRecord>,
    },
}

impl ResolveError {
    /// Attempt trail, empty for `RouteDisabled`
    #[must_use]
    pub fn attempts(&self) -> &[AttemptRecord] {
        match self {
            Self::RouteDisabled { .. } => &[],
            Self::Exhausted { attempts, .. } | Self::Cancelled { attempts, .. } => attempts,
        }
    }
}

// ============================================================================
// Route Resolver
// ============================================================================

enum AttemptResult<T> {
    Success { output: T, latency: Duration },
    Failed(AttemptRecord),
    Cancelled(AttemptRecord),
}

/// Resolves requests against routes using shared health, strategy and
/// fallback state
#[derive(Debug, Clone)]
pub struct RouteResolver {
    health: Arc<InstanceHealthTracker>,
    selector: Arc<StrategySelector>,
    fallbacks: Arc<FallbackStore>,
    config: ResolverConfig,
}

impl RouteResolver {
    /// Create a resolver over shared state
    pub fn new(
        health: Arc<InstanceHealthTracker>,
        selector: Arc<StrategySelector>,
        fallbacks: Arc<FallbackStore>,
        config: ResolverConfig,
    ) -> Self {
        Self {
            health,
            selector,
            fallbacks,
            config,
        }
    }

    /// Health tracker the resolver reports outcomes to
    pub fn health(&self) -> &Arc<InstanceHealthTracker> {
        &self.health
    }

    /// Resolve one request against `route`
    pub async fn resolve<I>(
        &self,
        route: &Route,
        ctx: &RequestContext,
        invoker: &I,
    ) -> Result<Resolution<I::Output>, ResolveError>
    where
        I: InstanceInvoker + ?Sized,
    {
        if !route.enabled {
            tracing::debug!(route = %route.slug, request_id = %ctx.request_id, "Route disabled");
            return Err(ResolveError::RouteDisabled {
                slug: route.slug.clone(),
            });
        }

        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut tried: Vec<String> = Vec::new();
        let mut remaining = route_candidates(route);

        // Route models, chosen by strategy
        while !remaining.is_empty() {
            if ctx.is_cancelled() {
                return Err(cancelled(route, attempts));
            }

            let candidates: Vec<Candidate<'_>> = remaining
                .iter()
                .map(|&m| Candidate::new(m, self.health.snapshot(&m.model_name)))
                .collect();

            let index = match self.selector.select(&route.id, route.strategy, &candidates) {
                Ok(index) => index,
                Err(SelectionError::NoEligibleCandidates { considered }) => {
                    tracing::debug!(
                        route = %route.slug,
                        considered,
                        "No eligible route models, moving to fallback chain"
                    );
                    for entry in remaining.drain(..) {
                        tried.push(entry.model_name.clone());
                        attempts.push(AttemptRecord {
                            model: entry.model_name.clone(),
                            stage: AttemptStage::Route,
                            failure: AttemptFailure::CircuitOpen,
                        });
                    }
                    break;
                }
            };

            let entry = remaining.remove(index);
            tried.push(entry.model_name.clone());

            match self
                .attempt(&entry.model_name, AttemptStage::Route, ctx, invoker)
                .await
            {
                AttemptResult::Success { output, latency } => {
                    return Ok(Resolution {
                        model: entry.model_name.clone(),
                        output,
                        latency,
                        stage: AttemptStage::Route,
                        attempts,
                    });
                }
                AttemptResult::Failed(record) => attempts.push(record),
                AttemptResult::Cancelled(record) => {
                    attempts.push(record);
                    return Err(cancelled(route, attempts));
                }
            }
        }

        // Fallback chain, in configured order
        let graph = self.fallbacks.current();
        let chain = fallback_chain(route, &graph, &tried);
        if !chain.is_empty() {
            tracing::debug!(
                route = %route.slug,
                request_id = %ctx.request_id,
                chain = ?chain,
                "Route models exhausted, walking fallback chain"
            );
        }

        for model in chain {
            if ctx.is_cancelled() {
                return Err(cancelled(route, attempts));
            }

            match self
                .attempt(&model, AttemptStage::Fallback, ctx, invoker)
                .await
            {
                AttemptResult::Success { output, latency } => {
                    tracing::info!(
                        route = %route.slug,
                        model = %model,
                        failed_attempts = attempts.len(),
                        "Request served by fallback"
                    );
                    return Ok(Resolution {
                        model,
                        output,
                        latency,
                        stage: AttemptStage::Fallback,
                        attempts,
                    });
                }
                AttemptResult::Failed(record) => attempts.push(record),
                AttemptResult::Cancelled(record) => {
                    attempts.push(record);
                    return Err(cancelled(route, attempts));
                }
            }
        }

        tracing::warn!(
            route = %route.slug,
            request_id = %ctx.request_id,
            attempts = attempts.len(),
            trail = %format_trail(&attempts),
            "All candidates exhausted"
        );
        Err(ResolveError::Exhausted {
            slug: route.slug.clone(),
            attempts,
        })
    }

    async fn attempt<I>(
        &self,
        model: &str,
        stage: AttemptStage,
        ctx: &RequestContext,
        invoker: &I,
    ) -> AttemptResult<I::Output>
    where
        I: InstanceInvoker + ?Sized,
    {
        // Held across the call; dropping this future records a failure
        let Some(admission) = self.health.admit(model) else {
            tracing::debug!(model = %model, stage = ?stage, "Skipping instance with open circuit");
            return AttemptResult::Failed(AttemptRecord {
                model: model.to_string(),
                stage,
                failure: AttemptFailure::CircuitOpen,
            });
        };

        let timeout = ctx
            .attempt_timeout
            .unwrap_or_else(|| self.config.attempt_timeout());
        let started = Instant::now();

        let outcome = tokio::select! {
            biased;
            () = ctx.cancellation.cancelled() => Err(AttemptFailure::Cancelled),
            result = tokio::time::timeout(timeout, invoker.invoke(model, ctx)) => match result {
                Ok(Ok(output)) => Ok(output),
                Ok(Err(e)) => Err(AttemptFailure::Invocation(e.to_string())),
                Err(_) => Err(AttemptFailure::Timeout),
            },
        };

        let latency = started.elapsed();
        admission.complete(outcome.is_ok(), latency);

        match outcome {
            Ok(output) => AttemptResult::Success { output, latency },
            Err(failure) => {
                tracing::debug!(
                    model = %model,
                    stage = ?stage,
                    request_id = %ctx.request_id,
                    error = %failure,
                    latency_ms = latency.as_millis() as u64,
                    "Attempt failed"
                );
                let record = AttemptRecord {
                    model: model.to_string(),
                    stage,
                    failure,
                };
                if record.failure == AttemptFailure::Cancelled {
                    AttemptResult::Cancelled(record)
                } else {
                    AttemptResult::Failed(record)
                }
            }
        }
    }
}

fn cancelled(route: &Route, attempts: Vec<AttemptRecord>) -> ResolveError {
    tracing::info!(route = %route.slug, attempts = attempts.len(), "Request cancelled by client");
    ResolveError::Cancelled {
        slug: route.slug.clone(),
        attempts,
    }
}

/// Enabled route models. Under weighted round robin, zero-weight entries are
/// left out unless every entry has zero weight.
fn route_candidates(route: &Route) -> Vec<&RouteModel> {
    let enabled: Vec<&RouteModel> = route.enabled_models().collect();
    if route.strategy == Strategy::WeightedRoundRobin
        && enabled.iter().any(|m| m.weight.is_finite() && m.weight > 0.0)
    {
        return enabled
            .into_iter()
            .filter(|m| m.weight.is_finite() && m.weight > 0.0)
            .collect();
    }
    enabled
}

/// Route-level fallbacks, then the global chain for the route slug (or its
/// first enabled model when the slug has no entry). Route models and anything
/// already tried are removed, order preserved.
fn fallback_chain(route: &Route, graph: &FallbackGraph, tried: &[String]) -> Vec<String> {
    let mut seen: HashSet<&str> = route
        .models
        .iter()
        .map(|m| m.model_name.as_str())
        .chain(tried.iter().map(String::as_str))
        .collect();

    let mut chain: Vec<String> = Vec::new();
    for model in &route.fallback_models {
        if seen.insert(model.as_str()) {
            chain.push(model.clone());
        }
    }

    let key = if graph.contains(&route.slug) {
        Some(route.slug.as_str())
    } else {
        route.primary_model()
    };

    if let Some(key) = key {
        let exclude: Vec<&str> = seen.into_iter().collect();
        chain.extend(graph.resolve_chain(key, &exclude));
    }
    chain
}

// ============================================================================
// Tests
// ============================================================================
