//! Traffic Simulation
//!
//! Drives a configured gateway with synthetic traffic so routing, failover
//! and circuit-breaker behavior can be observed without real providers.
//! Each model gets an injected failure rate and latency; outcomes are drawn
//! from a seeded PRNG so a run is reproducible for a given seed.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use modelgate_core::routing::metrics::GatewayMetricsSummary;
use modelgate_core::routing::stats::RouteTrafficStats;
use modelgate_core::{
    GatewayError, InstanceHealth, InstanceInvoker, InvocationError, LoadShedDecision,
    ModelGateway, RequestContext, ResolveError,
};

/// Tokens reported per simulated completion
const SIMULATED_TOKENS: u64 = 256;

/// Injected behavior for the simulated providers
#[derive(Clone, Debug, Default)]
pub struct SimulationPlan {
    /// Failure probability per model (0.0 - 1.0)
    pub failure_rates: HashMap<String, f64>,
    /// Added latency per model
    pub latencies: HashMap<String, Duration>,
    /// Latency for models without an entry
    pub default_latency: Duration,
    /// PRNG seed
    pub seed: u64,
}

/// Invoker that fails and stalls according to a [`SimulationPlan`]
pub struct SimulatedInvoker {
    plan: SimulationPlan,
    rng: Mutex<StdRng>,
}

impl SimulatedInvoker {
    pub fn new(plan: SimulationPlan) -> Self {
        let rng = StdRng::seed_from_u64(plan.seed);
        Self {
            plan,
            rng: Mutex::new(rng),
        }
    }
}

#[async_trait]
impl InstanceInvoker for SimulatedInvoker {
    type Output = u64;

    async fn invoke(&self, model_name: &str, _ctx: &RequestContext) -> Result<u64, InvocationError> {
        let rate = self.plan.failure_rates.get(model_name).copied().unwrap_or(0.0);
        let fails = self.rng.lock().gen_bool(rate.clamp(0.0, 1.0));
        let latency = self
            .plan
            .latencies
            .get(model_name)
            .copied()
            .unwrap_or(self.plan.default_latency);

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if fails {
            Err(InvocationError::Status {
                status: 503,
                message: format!("injected failure from {model_name}"),
            })
        } else {
            Ok(SIMULATED_TOKENS)
        }
    }
}

/// Outcome tallies for one simulation run
#[derive(Debug, Default, Serialize)]
pub struct Outcomes {
    pub served: u64,
    pub served_by_fallback: u64,
    pub overloaded: u64,
    pub exhausted: u64,
    pub disabled: u64,
    pub unknown_route: u64,
    pub cancelled: u64,
    pub served_by: BTreeMap<String, u64>,
}

impl Outcomes {
    fn merge(&mut self, other: Outcomes) {
        self.served += other.served;
        self.served_by_fallback += other.served_by_fallback;
        self.overloaded += other.overloaded;
        self.exhausted += other.exhausted;
        self.disabled += other.disabled;
        self.unknown_route += other.unknown_route;
        self.cancelled += other.cancelled;
        for (model, count) in other.served_by {
            *self.served_by.entry(model).or_default() += count;
        }
    }
}

/// JSON report printed after a run
#[derive(Debug, Serialize)]
pub struct SimulationReport {
    pub route: String,
    pub requests: u64,
    pub concurrency: usize,
    pub elapsed_ms: u64,
    pub outcomes: Outcomes,
    pub instances: Vec<InstanceHealth>,
    pub load_shed: LoadShedDecision,
    pub metrics: GatewayMetricsSummary,
    pub traffic: Option<RouteTrafficStats>,
}

/// Send `requests` requests to `slug` from `concurrency` workers.
///
/// Workers stop early once `shutdown` fires; the in-flight request is
/// cancelled and counted.
pub async fn run(
    gateway: Arc<ModelGateway>,
    invoker: Arc<SimulatedInvoker>,
    slug: &str,
    requests: u64,
    concurrency: usize,
    shutdown: CancellationToken,
) -> SimulationReport {
    let started = Instant::now();
    let concurrency = concurrency.max(1);
    let per_worker = requests / concurrency as u64;
    let remainder = requests % concurrency as u64;

    tracing::info!(route = %slug, requests, concurrency, "Starting simulation");

    let mut workers = JoinSet::new();
    for worker in 0..concurrency {
        let quota = per_worker + u64::from((worker as u64) < remainder);
        let gateway = gateway.clone();
        let invoker = invoker.clone();
        let shutdown = shutdown.clone();
        let slug = slug.to_string();
        workers.spawn(async move {
            let mut outcomes = Outcomes::default();
            for _ in 0..quota {
                if shutdown.is_cancelled() {
                    break;
                }
                let ctx = RequestContext::new().with_cancellation(shutdown.child_token());
                match gateway.handle(&slug, &ctx, invoker.as_ref()).await {
                    Ok(resolution) => {
                        outcomes.served += 1;
                        if resolution.used_fallback() {
                            outcomes.served_by_fallback += 1;
                        }
                        if let Some(route) = gateway.registry().get_by_slug(&slug) {
                            gateway.record_usage(&route.id, &resolution.model, resolution.output, 0.0);
                        }
                        *outcomes.served_by.entry(resolution.model).or_default() += 1;
                    }
                    Err(GatewayError::Overloaded(_)) => outcomes.overloaded += 1,
                    Err(GatewayError::UnknownRoute(_)) => outcomes.unknown_route += 1,
                    Err(GatewayError::Resolve(ResolveError::RouteDisabled { .. })) => {
                        outcomes.disabled += 1;
                    }
                    Err(GatewayError::Resolve(ResolveError::Exhausted { .. })) => {
                        outcomes.exhausted += 1;
                    }
                    Err(GatewayError::Resolve(ResolveError::Cancelled { .. })) => {
                        outcomes.cancelled += 1;
                    }
                }
            }
            outcomes
        });
    }

    let mut outcomes = Outcomes::default();
    while let Some(result) = workers.join_next().await {
        match result {
            Ok(worker_outcomes) => outcomes.merge(worker_outcomes),
            Err(e) => tracing::error!(error = %e, "Simulation worker failed"),
        }
    }

    let elapsed = started.elapsed();
    tracing::info!(
        route = %slug,
        served = outcomes.served,
        exhausted = outcomes.exhausted,
        overloaded = outcomes.overloaded,
        elapsed_ms = elapsed.as_millis() as u64,
        "Simulation finished"
    );

    let traffic = gateway
        .registry()
        .get_by_slug(slug)
        .map(|route| gateway.route_stats(&route.id, elapsed + Duration::from_secs(1)));

    SimulationReport {
        route: slug.to_string(),
        requests,
        concurrency,
        elapsed_ms: elapsed.as_millis() as u64,
        outcomes,
        instances: gateway.all_instance_health(),
        load_shed: gateway.load_shed_decision(),
        metrics: gateway.metrics().summary(),
        traffic,
    }
}

/// Parse `MODEL=VALUE` pairs from the command line
pub fn parse_assignment<T>(raw: &str) -> Result<(String, T), String>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let (model, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected MODEL=VALUE, got '{raw}'"))?;
    let model = model.trim();
    if model.is_empty() {
        return Err(format!("missing model name in '{raw}'"));
    }
    let value = value
        .trim()
        .parse()
        .map_err(|e| format!("invalid value in '{raw}': {e}"))?;
    Ok((model.to_string(), value))
}
