//! Model Gateway
//!
//! The request-path entry point. Owns the shared routing state and runs
//! every inbound request through the same pipeline:
//!
//! ```text
//! handle(slug, ctx, invoker)
//!     │
//!     ├─> LoadShedGuard::decision()      ── shedding ──> Overloaded
//!     ├─> RouteRegistry::get_by_slug()   ── missing ───> UnknownRoute
//!     ├─> RouteResolver::resolve()       ── failure ───> RouteDisabled / Exhausted / Cancelled
//!     └─> RouteStats + GatewayMetrics
//! ```

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use super::config::{Route, RouterConfig};
use super::fallback::FallbackStore;
use super::health::{InstanceHealth, InstanceHealthTracker};
use super::load_shed::{LoadShedDecision, LoadShedGuard};
use super::metrics::GatewayMetrics;
use super::registry::{RegistryError, RouteRegistry};
use super::resolver::{
    AttemptRecord, InstanceInvoker, RequestContext, Resolution, ResolveError, RouteResolver,
};
use super::stats::{RouteStats, RouteTrafficStats};
use super::strategy::StrategySelector;

/// Errors surfaced to the caller of [`ModelGateway::handle`]
#[derive(Clone, Debug, Error)]
pub enum GatewayError {
    /// No route has the requested slug
    #[error("unknown model '{0}'")]
    UnknownRoute(String),

    /// Rejected before resolution was attempted
    #[error("gateway overloaded: {0}")]
    Overloaded(LoadShedDecision),

    /// Resolution failed
    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

impl GatewayError {
    /// Whether the request was rejected without trying any instance
    #[must_use]
    pub fn is_overload(&self) -> bool {
        matches!(self, Self::Overloaded(_))
    }

    /// Attempt trail, empty when nothing was attempted
    #[must_use]
    pub fn attempts(&self) -> &[AttemptRecord] {
        match self {
            Self::Resolve(e) => e.attempts(),
            Self::UnknownRoute(_) | Self::Overloaded(_) => &[],
        }
    }
}

/// Shared routing state plus the request pipeline
#[derive(Debug)]
pub struct ModelGateway {
    config: RouterConfig,
    health: Arc<InstanceHealthTracker>,
    selector: Arc<StrategySelector>,
    registry: RouteRegistry,
    resolver: RouteResolver,
    load_shed: LoadShedGuard,
    stats: RouteStats,
    metrics: GatewayMetrics,
}

impl ModelGateway {
    /// Gateway with an entropy-seeded random strategy
    pub fn new(config: RouterConfig) -> Self {
        Self::with_selector(config, StrategySelector::new())
    }

    /// Gateway using a specific selector (seeded for simulations and tests)
    pub fn with_selector(config: RouterConfig, selector: StrategySelector) -> Self {
        let health = Arc::new(InstanceHealthTracker::with_config(config.health.clone()));
        let selector = Arc::new(selector);
        let fallbacks = Arc::new(FallbackStore::new());
        let registry = RouteRegistry::new(fallbacks.clone(), config.reject_dangling_references);
        let resolver = RouteResolver::new(
            health.clone(),
            selector.clone(),
            fallbacks,
            config.resolver.clone(),
        );
        let load_shed = LoadShedGuard::new(health.clone(), config.load_shed.clone());
        let stats = RouteStats::new(config.stats_retention());

        tracing::info!(
            window_size = config.health.window_size,
            error_rate_threshold = config.health.error_rate_threshold,
            cooldown_ms = config.health.cooldown_ms,
            load_shed = config.load_shed.enabled,
            "Model gateway initialized"
        );

        Self {
            config,
            health,
            selector,
            registry,
            resolver,
            load_shed,
            stats,
            metrics: GatewayMetrics::new(),
        }
    }

    /// Run one request through admission, resolution and accounting
    pub async fn handle<I>(
        &self,
        slug: &str,
        ctx: &RequestContext,
        invoker: &I,
    ) -> Result<Resolution<I::Output>, GatewayError>
    where
        I: InstanceInvoker + ?Sized,
    {
        self.metrics.requests.inc();

        let decision = self.load_shed.decision();
        if decision.should_shed_load {
            self.metrics.overload_rejections.inc();
            tracing::warn!(route = %slug, request_id = %ctx.request_id, %decision, "Request rejected, shedding load");
            return Err(GatewayError::Overloaded(decision));
        }
        self.metrics.admitted.inc();

        let Some(route) = self.registry.get_by_slug(slug) else {
            self.metrics.unknown_routes.inc();
            tracing::debug!(route = %slug, "Unknown route");
            return Err(GatewayError::UnknownRoute(slug.to_string()));
        };

        match self.resolver.resolve(&route, ctx, invoker).await {
            Ok(resolution) => {
                self.metrics.record_attempts(&resolution.attempts);
                self.metrics
                    .record_resolved(resolution.latency, resolution.used_fallback());
                self.stats.record_request(
                    &route.id,
                    &resolution.model,
                    self.registry.provider_kind(&resolution.model),
                    resolution.latency,
                );
                Ok(resolution)
            }
            Err(e) => {
                self.metrics.record_attempts(e.attempts());
                match &e {
                    ResolveError::RouteDisabled { .. } => self.metrics.disabled_routes.inc(),
                    ResolveError::Exhausted { .. } => self.metrics.exhausted.inc(),
                    ResolveError::Cancelled { .. } => self.metrics.cancelled.inc(),
                }
                Err(e.into())
            }
        }
    }

    /// Route, model and fallback registry
    pub fn registry(&self) -> &RouteRegistry {
        &self.registry
    }

    /// Delete a route and drop its selection cursor and traffic stats
    pub fn delete_route(&self, id: &str) -> Result<Arc<Route>, RegistryError> {
        let route = self.registry.delete_route(id)?;
        self.selector.forget_route(&route.id);
        self.stats.remove_route(&route.id);
        Ok(route)
    }

    /// Health tracker shared with the resolver
    pub fn health(&self) -> &Arc<InstanceHealthTracker> {
        &self.health
    }

    /// Health of one instance
    pub fn instance_health(&self, model: &str) -> InstanceHealth {
        self.health.snapshot(model)
    }

    /// Health of every tracked instance
    pub fn all_instance_health(&self) -> Vec<InstanceHealth> {
        self.health.all_snapshots()
    }

    /// Current load-shed decision
    pub fn load_shed_decision(&self) -> LoadShedDecision {
        self.load_shed.decision()
    }

    /// Traffic of a route over the last `window`
    pub fn route_stats(&self, route_id: &str, window: Duration) -> RouteTrafficStats {
        self.stats.route_stats(route_id, window)
    }

    /// Tokens and cost reported by the billing collaborator
    pub fn record_usage(&self, route_id: &str, model: &str, tokens: u64, cost: f64) {
        self.stats.record_usage(route_id, model, tokens, cost);
    }

    /// Gateway counters
    pub fn metrics(&self) -> &GatewayMetrics {
        &self.metrics
    }

    /// Prometheus text exposition
    pub fn prometheus(&self) -> String {
        self.metrics
            .to_prometheus(&self.health.all_snapshots(), &self.load_shed.decision())
    }

    /// Active configuration
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }
}

// ============================================================================
// Tests
// ============================================================================
