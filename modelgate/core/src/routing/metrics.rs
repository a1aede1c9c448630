//! Gateway Metrics
//!
//! Process-wide counters for the admission and resolution path, plus a
//! Prometheus text export that also carries per-instance health gauges.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

use super::health::{CircuitState, InstanceHealth};
use super::load_shed::LoadShedDecision;
use super::resolver::{AttemptFailure, AttemptRecord};

// ============================================================================
// Counter
// ============================================================================

/// A simple atomic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Counter at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Add `n`
    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Histogram
// ============================================================================

/// Fixed-bucket latency histogram in milliseconds
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    total_count: AtomicU64,
    sum_ms: AtomicU64,
}

impl Histogram {
    /// Histogram with the given upper bounds
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            total_count: AtomicU64::new(0),
            sum_ms: AtomicU64::new(0),
        }
    }

    /// Buckets suited to model-call latencies
    pub fn latency_default() -> Self {
        Self::new(vec![
            10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0,
            60000.0,
        ])
    }

    /// Record one observation
    pub fn record(&self, value_ms: f64) {
        if let Some(idx) = self.buckets.iter().position(|&b| value_ms <= b) {
            self.counts[idx].fetch_add(1, Ordering::Relaxed);
        }
        self.total_count.fetch_add(1, Ordering::Relaxed);
        self.sum_ms.fetch_add(value_ms.max(0.0) as u64, Ordering::Relaxed);
    }

    /// Number of observations
    pub fn count(&self) -> u64 {
        self.total_count.load(Ordering::Relaxed)
    }

    /// Mean of all observations
    pub fn mean(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            0.0
        } else {
            self.sum_ms.load(Ordering::Relaxed) as f64 / count as f64
        }
    }

    fn write_prometheus(&self, out: &mut String, name: &str) {
        let mut cumulative = 0;
        for (bound, count) in self.buckets.iter().zip(&self.counts) {
            cumulative += count.load(Ordering::Relaxed);
            let _ = writeln!(out, "{name}_bucket{{le=\"{bound}\"}} {cumulative}");
        }
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {}", self.count());
        let _ = writeln!(out, "{name}_sum {}", self.sum_ms.load(Ordering::Relaxed));
        let _ = writeln!(out, "{name}_count {}", self.count());
    }
}

// ============================================================================
// Gateway Metrics
// ============================================================================

/// Counters for every outcome of [`ModelGateway::handle`](super::ModelGateway::handle)
#[derive(Debug)]
pub struct GatewayMetrics {
    /// Requests received
    pub requests: Counter,
    /// Requests that passed the load-shed gate
    pub admitted: Counter,
    /// Requests rejected by the load-shed gate
    pub overload_rejections: Counter,
    /// Requests for an unknown slug
    pub unknown_routes: Counter,
    /// Requests for a disabled route
    pub disabled_routes: Counter,
    /// Requests served
    pub resolved: Counter,
    /// Requests served by a fallback
    pub fallback_uses: Counter,
    /// Requests that exhausted every candidate
    pub exhausted: Counter,
    /// Requests cancelled by the client
    pub cancelled: Counter,
    /// Invoked attempts that failed
    pub attempt_failures: Counter,
    /// Attempts that timed out
    pub attempt_timeouts: Counter,
    /// Candidates skipped because their circuit was open
    pub circuit_skips: Counter,
    /// Latency of the serving call
    pub resolution_latency: Histogram,

    started_at: Instant,
}

impl GatewayMetrics {
    /// All counters at zero
    pub fn new() -> Self {
        Self {
            requests: Counter::new(),
            admitted: Counter::new(),
            overload_rejections: Counter::new(),
            unknown_routes: Counter::new(),
            disabled_routes: Counter::new(),
            resolved: Counter::new(),
            fallback_uses: Counter::new(),
            exhausted: Counter::new(),
            cancelled: Counter::new(),
            attempt_failures: Counter::new(),
            attempt_timeouts: Counter::new(),
            circuit_skips: Counter::new(),
            resolution_latency: Histogram::latency_default(),
            started_at: Instant::now(),
        }
    }

    /// Count each entry of an attempt trail
    pub fn record_attempts(&self, attempts: &[AttemptRecord]) {
        for attempt in attempts {
            match attempt.failure {
                AttemptFailure::CircuitOpen => self.circuit_skips.inc(),
                AttemptFailure::Timeout => {
                    self.attempt_timeouts.inc();
                    self.attempt_failures.inc();
                }
                AttemptFailure::Invocation(_) | AttemptFailure::Cancelled => {
                    self.attempt_failures.inc();
                }
            }
        }
    }

    /// Count a served request
    pub fn record_resolved(&self, latency: Duration, used_fallback: bool) {
        self.resolved.inc();
        if used_fallback {
            self.fallback_uses.inc();
        }
        self.resolution_latency.record(latency.as_secs_f64() * 1000.0);
    }

    /// Time since the metrics were created
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Plain-data copy of the counters
    pub fn summary(&self) -> GatewayMetricsSummary {
        GatewayMetricsSummary {
            uptime_seconds: self.uptime().as_secs(),
            requests: self.requests.get(),
            admitted: self.admitted.get(),
            overload_rejections: self.overload_rejections.get(),
            unknown_routes: self.unknown_routes.get(),
            disabled_routes: self.disabled_routes.get(),
            resolved: self.resolved.get(),
            fallback_uses: self.fallback_uses.get(),
            exhausted: self.exhausted.get(),
            cancelled: self.cancelled.get(),
            attempt_failures: self.attempt_failures.get(),
            attempt_timeouts: self.attempt_timeouts.get(),
            circuit_skips: self.circuit_skips.get(),
            mean_resolution_latency_ms: self.resolution_latency.mean(),
        }
    }

    /// Prometheus text exposition of the counters, the load-shed state and
    /// per-instance health
    pub fn to_prometheus(&self, health: &[InstanceHealth], shed: &LoadShedDecision) -> String {
        let mut out = String::new();

        let counters: [(&str, &str, &Counter); 12] = [
            ("gateway_requests_total", "Requests received", &self.requests),
            ("gateway_admitted_total", "Requests admitted past load shedding", &self.admitted),
            ("gateway_overload_rejections_total", "Requests rejected by load shedding", &self.overload_rejections),
            ("gateway_unknown_route_total", "Requests for unknown routes", &self.unknown_routes),
            ("gateway_route_disabled_total", "Requests for disabled routes", &self.disabled_routes),
            ("gateway_resolved_total", "Requests served", &self.resolved),
            ("gateway_fallback_total", "Requests served by a fallback model", &self.fallback_uses),
            ("gateway_exhausted_total", "Requests that exhausted every candidate", &self.exhausted),
            ("gateway_cancelled_total", "Requests cancelled by the client", &self.cancelled),
            ("gateway_attempt_failures_total", "Failed instance calls", &self.attempt_failures),
            ("gateway_attempt_timeouts_total", "Timed out instance calls", &self.attempt_timeouts),
            ("gateway_circuit_skips_total", "Candidates skipped with an open circuit", &self.circuit_skips),
        ];

        for (name, help, counter) in counters {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} counter");
            let _ = writeln!(out, "{name} {}\n", counter.get());
        }

        let _ = writeln!(out, "# HELP gateway_resolution_latency_ms Latency of the serving call");
        let _ = writeln!(out, "# TYPE gateway_resolution_latency_ms histogram");
        self.resolution_latency
            .write_prometheus(&mut out, "gateway_resolution_latency_ms");
        out.push('\n');

        let _ = writeln!(out, "# HELP gateway_shedding_load Whether new requests are rejected");
        let _ = writeln!(out, "# TYPE gateway_shedding_load gauge");
        let _ = writeln!(out, "gateway_shedding_load {}\n", u8::from(shed.should_shed_load));

        if !health.is_empty() {
            let _ = writeln!(out, "# HELP instance_health_score Derived 0-100 health score");
            let _ = writeln!(out, "# TYPE instance_health_score gauge");
            for h in health {
                let _ = writeln!(out, "instance_health_score{{model=\"{}\"}} {:.2}", h.instance, h.health_score);
            }
            out.push('\n');

            let _ = writeln!(out, "# HELP instance_error_rate Windowed error rate");
            let _ = writeln!(out, "# TYPE instance_error_rate gauge");
            for h in health {
                let _ = writeln!(out, "instance_error_rate{{model=\"{}\"}} {:.4}", h.instance, h.error_rate);
            }
            out.push('\n');

            let _ = writeln!(out, "# HELP instance_latency_ms Windowed latency");
            let _ = writeln!(out, "# TYPE instance_latency_ms gauge");
            for h in health {
                let _ = writeln!(
                    out,
                    "instance_latency_ms{{model=\"{}\",stat=\"avg\"}} {:.2}",
                    h.instance, h.average_latency
                );
                let _ = writeln!(
                    out,
                    "instance_latency_ms{{model=\"{}\",stat=\"p95\"}} {:.2}",
                    h.instance, h.p95_latency
                );
            }
            out.push('\n');

            let _ = writeln!(out, "# HELP instance_circuit_state 0 closed, 1 open, 2 half-open");
            let _ = writeln!(out, "# TYPE instance_circuit_state gauge");
            for h in health {
                let state = match h.circuit_state {
                    CircuitState::Closed => 0,
                    CircuitState::Open => 1,
                    CircuitState::HalfOpen => 2,
                };
                let _ = writeln!(out, "instance_circuit_state{{model=\"{}\"}} {state}", h.instance);
            }
            out.push('\n');

            let _ = writeln!(out, "# HELP instance_requests_total Completed calls per instance");
            let _ = writeln!(out, "# TYPE instance_requests_total counter");
            for h in health {
                let _ = writeln!(out, "instance_requests_total{{model=\"{}\"}} {}", h.instance, h.total_requests);
                let _ = writeln!(
                    out,
                    "instance_failures_total{{model=\"{}\"}} {}",
                    h.instance, h.failed_requests
                );
            }
        }

        out
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable counter snapshot
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GatewayMetricsSummary {
    pub uptime_seconds: u64,
    pub requests: u64,
    pub admitted: u64,
    pub overload_rejections: u64,
    pub unknown_routes: u64,
    pub disabled_routes: u64,
    pub resolved: u64,
    pub fallback_uses: u64,
    pub exhausted: u64,
    pub cancelled: u64,
    pub attempt_failures: u64,
    pub attempt_timeouts: u64,
    pub circuit_skips: u64,
    pub mean_resolution_latency_ms: f64,
}
