//! Load Shedding
//!
//! A coarse, system-wide admission gate evaluated before resolution. Per-instance
//! circuit breakers handle one bad backend at a time; this guard rejects new
//! requests outright when most backends are degraded at once.
//!
//! Shedding starts when either signal trips:
//!
//! - more than `open_circuit_fraction` of tracked instances have an open circuit
//! - the error rate across closed-circuit instances exceeds `error_rate_threshold`
//!   (only once at least `min_samples` samples exist)
//!
//! The error-rate signal only counts outcomes younger than `sample_horizon`.
//! Shedding stops new outcomes from being recorded, so without an age limit
//! the last failures before shedding began would keep it tripped forever.
//!
//! Decisions are cached for `recompute_interval` so the hot path does not walk
//! every instance on every request.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

use super::config::LoadShedConfig;
use super::health::{AggregateHealth, InstanceHealthTracker};

/// Which signal triggered shedding
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShedReason {
    /// Too many open circuits
    OpenCircuits,
    /// Global error rate too high
    ErrorRate,
}

/// Admission decision plus the aggregate signal it was derived from
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LoadShedDecision {
    /// Reject new requests
    pub should_shed_load: bool,

    /// Trigger, when shedding
    pub reason: Option<ShedReason>,

    /// Fraction of tracked instances with an open circuit
    pub open_fraction: f64,

    /// Windowed error rate across all instances
    pub global_error_rate: f64,

    /// Instances with recorded outcomes
    pub tracked_instances: usize,

    /// Instances with an open circuit
    pub open_circuits: usize,

    /// Samples behind `global_error_rate`
    pub window_samples: usize,
}

impl LoadShedDecision {
    /// Decision that admits everything
    #[must_use]
    pub fn admit() -> Self {
        Self {
            should_shed_load: false,
            reason: None,
            open_fraction: 0.0,
            global_error_rate: 0.0,
            tracked_instances: 0,
            open_circuits: 0,
            window_samples: 0,
        }
    }

    /// Evaluate `aggregate` against `config`
    #[must_use]
    pub fn evaluate(aggregate: &AggregateHealth, config: &LoadShedConfig) -> Self {
        let open_fraction = aggregate.open_fraction();
        let global_error_rate = aggregate.error_rate();

        let reason = if !config.enabled {
            None
        } else if aggregate.tracked_instances > 0 && open_fraction > config.open_circuit_fraction {
            Some(ShedReason::OpenCircuits)
        } else if aggregate.window_samples >= config.min_samples
            && global_error_rate > config.error_rate_threshold
        {
            Some(ShedReason::ErrorRate)
        } else {
            None
        };

        Self {
            should_shed_load: reason.is_some(),
            reason,
            open_fraction,
            global_error_rate,
            tracked_instances: aggregate.tracked_instances,
            open_circuits: aggregate.open_circuits,
            window_samples: aggregate.window_samples,
        }
    }
}

impl std::fmt::Display for LoadShedDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} circuits open, global error rate {:.1}%",
            self.open_circuits,
            self.tracked_instances,
            self.global_error_rate * 100.0
        )
    }
}

struct CachedDecision {
    computed_at: Instant,
    decision: LoadShedDecision,
}

/// System-wide admission gate over an [`InstanceHealthTracker`]
pub struct LoadShedGuard {
    health: Arc<InstanceHealthTracker>,
    config: LoadShedConfig,
    cached: Mutex<Option<CachedDecision>>,
}

impl LoadShedGuard {
    /// Create a guard reading from `health`
    pub fn new(health: Arc<InstanceHealthTracker>, config: LoadShedConfig) -> Self {
        Self {
            health,
            config,
            cached: Mutex::new(None),
        }
    }

    /// Current decision, recomputed when the cached one is older than the
    /// recompute interval
    pub fn decision(&self) -> LoadShedDecision {
        let mut cached = self.cached.lock();
        let now = Instant::now();

        if let Some(c) = cached.as_ref() {
            if now.saturating_duration_since(c.computed_at) < self.config.recompute_interval() {
                return c.decision.clone();
            }
        }

        let decision = LoadShedDecision::evaluate(
            &self.health.aggregate(self.config.sample_horizon()),
            &self.config,
        );
        let was_shedding = cached
            .as_ref()
            .is_some_and(|c| c.decision.should_shed_load);

        if decision.should_shed_load && !was_shedding {
            tracing::warn!(reason = ?decision.reason, %decision, "Load shedding started");
        } else if !decision.should_shed_load && was_shedding {
            tracing::info!(%decision, "Load shedding stopped");
        }

        *cached = Some(CachedDecision {
            computed_at: now,
            decision: decision.clone(),
        });
        decision
    }

    /// Whether new requests should be rejected
    pub fn should_shed(&self) -> bool {
        self.decision().should_shed_load
    }

    /// Drop the cached decision
    pub fn invalidate(&self) {
        *self.cached.lock() = None;
    }

    /// Active policy
    pub fn config(&self) -> &LoadShedConfig {
        &self.config
    }
}

impl std::fmt::Debug for LoadShedGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadShedGuard")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::health::CircuitState;
    use std::time::Duration;

    fn uncached() -> LoadShedConfig {
        LoadShedConfig {
            recompute_interval_ms: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_idle_system_admits() {
        let guard = LoadShedGuard::new(Arc::new(InstanceHealthTracker::new()), uncached());
        assert_eq!(guard.decision(), LoadShedDecision::admit());
    }

    #[test]
    fn test_sheds_when_most_circuits_open() {
        let health = Arc::new(InstanceHealthTracker::new());
        let guard = LoadShedGuard::new(health.clone(), uncached());

        health.force_state("a", CircuitState::Open);
        health.force_state("b", CircuitState::Open);
        health.record_outcome("c", true, Duration::from_millis(5));
        assert!(guard.should_shed());

        let decision = guard.decision();
        assert_eq!(decision.reason, Some(ShedReason::OpenCircuits));
        assert_eq!(decision.open_circuits, 2);

        health.force_state("b", CircuitState::Closed);
        // Exactly half open does not exceed 0.5
        assert!(!guard.should_shed());
    }

    #[test]
    fn test_sheds_on_global_error_rate() {
        let health = Arc::new(InstanceHealthTracker::with_config(crate::routing::HealthConfig {
            min_samples: usize::MAX,
            ..Default::default()
        }));
        let guard = LoadShedGuard::new(health.clone(), uncached());

        for i in 0..19 {
            health.record_outcome(&format!("m{}", i % 4), false, Duration::from_millis(1));
        }
        // Below the sample floor
        assert!(!guard.should_shed());

        health.record_outcome("m0", false, Duration::from_millis(1));
        let decision = guard.decision();
        assert!(decision.should_shed_load);
        assert_eq!(decision.reason, Some(ShedReason::ErrorRate));
    }

    #[test]
    fn test_error_rate_shedding_expires_with_horizon() {
        let health = Arc::new(InstanceHealthTracker::with_config(crate::routing::HealthConfig {
            min_samples: usize::MAX,
            ..Default::default()
        }));
        let guard = LoadShedGuard::new(
            health.clone(),
            LoadShedConfig {
                sample_horizon_ms: 30,
                ..uncached()
            },
        );

        for i in 0..20 {
            health.record_outcome(&format!("m{}", i % 4), false, Duration::from_millis(1));
        }
        assert_eq!(guard.decision().reason, Some(ShedReason::ErrorRate));

        // No traffic reaches the instances while shedding; old failures age out
        std::thread::sleep(Duration::from_millis(50));
        let decision = guard.decision();
        assert!(!decision.should_shed_load);
        assert_eq!(decision.window_samples, 0);
    }

    #[test]
    fn test_half_open_instances_do_not_hold_shedding() {
        let health = Arc::new(InstanceHealthTracker::with_config(crate::routing::HealthConfig {
            cooldown_ms: 20,
            ..Default::default()
        }));
        let guard = LoadShedGuard::new(health.clone(), uncached());

        for name in ["a", "b"] {
            for _ in 0..10 {
                health.record_outcome(name, false, Duration::from_millis(1));
            }
        }
        assert_eq!(guard.decision().reason, Some(ShedReason::OpenCircuits));

        std::thread::sleep(Duration::from_millis(40));
        let decision = guard.decision();
        assert!(!decision.should_shed_load);
        assert_eq!(decision.open_circuits, 0);
        assert_eq!(decision.global_error_rate, 0.0);
    }

    #[test]
    fn test_disabled_never_sheds() {
        let health = Arc::new(InstanceHealthTracker::new());
        health.force_state("a", CircuitState::Open);
        let guard = LoadShedGuard::new(
            health,
            LoadShedConfig {
                enabled: false,
                ..uncached()
            },
        );
        assert!(!guard.should_shed());
    }

    #[test]
    fn test_decision_is_cached() {
        let health = Arc::new(InstanceHealthTracker::new());
        let guard = LoadShedGuard::new(
            health.clone(),
            LoadShedConfig {
                recompute_interval_ms: 60_000,
                ..Default::default()
            },
        );

        assert!(!guard.should_shed());
        health.force_state("a", CircuitState::Open);
        assert!(!guard.should_shed());

        guard.invalidate();
        assert!(guard.should_shed());
    }
}
