//! Instance Health Tracking and Circuit Breaker
//!
//! Keeps a rolling window of call outcomes for every backend instance and
//! drives a per-instance circuit breaker from it.
//!
//! # Circuit Breaker
//!
//! ```text
//! +--------+  error rate > threshold  +------+   cooldown elapsed   +-----------+
//! | Closed | -----------------------> | Open | -------------------> | Half-Open |
//! +--------+   (>= min_samples)       +------+   (checked lazily)   +-----------+
//!     ^                                  ^                                |
//!     |         probe succeeded          |        probe failed            |
//!     +----------------------------------+--------------------------------+
//! ```
//!
//! - **Closed**: calls flow normally.
//! - **Open**: calls are short-circuited until the cooldown elapses.
//! - **Half-Open**: exactly one probe call is admitted; its outcome decides.
//!
//! # Thread Safety
//!
//! Each instance owns its own `parking_lot::Mutex`, looked up through a
//! `DashMap`. The window push, counter updates and breaker transition happen
//! under that one lock, so two concurrent failures cannot both trip the
//! breaker or restart the cooldown twice. Requests to different instances
//! never contend.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

use super::config::HealthConfig;

// ============================================================================
// Circuit State
// ============================================================================

/// Externally visible circuit breaker state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    #[default]
    Closed,
    /// Short-circuiting calls
    Open,
    /// Waiting on (or running) a single probe
    HalfOpen,
}

/// Result of asking whether a call may be sent to an instance
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed
    Allowed,
    /// Caller holds the single half-open probe
    Probe,
    /// Circuit open, or the probe is already taken
    Rejected,
}

impl Admission {
    /// Whether the call may proceed
    #[must_use]
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Self::Rejected)
    }
}

#[derive(Clone, Copy, Debug)]
enum Breaker {
    Closed,
    Open { opened_at: Instant },
    HalfOpen { probe_in_flight: bool },
}

impl Breaker {
    fn state(&self) -> CircuitState {
        match self {
            Self::Closed => CircuitState::Closed,
            Self::Open { .. } => CircuitState::Open,
            Self::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }
}

// ============================================================================
// Outcome Window
// ============================================================================

#[derive(Clone, Copy, Debug)]
struct Sample {
    success: bool,
    latency_ms: f64,
    recorded_at: Instant,
}

/// Fixed-capacity ring buffer of the most recent outcomes
#[derive(Debug)]
struct OutcomeWindow {
    samples: Vec<Sample>,
    next: usize,
    capacity: usize,
}

impl OutcomeWindow {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: Vec::with_capacity(capacity),
            next: 0,
            capacity,
        }
    }

    fn push(&mut self, sample: Sample) {
        if self.samples.len() < self.capacity {
            self.samples.push(sample);
        } else {
            self.samples[self.next] = sample;
        }
        self.next = (self.next + 1) % self.capacity;
    }

    fn len(&self) -> usize {
        self.samples.len()
    }

    fn failures(&self) -> usize {
        self.samples.iter().filter(|s| !s.success).count()
    }

    fn error_rate(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.failures() as f64 / self.samples.len() as f64
        }
    }

    fn average_latency(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(|s| s.latency_ms).sum::<f64>() / self.samples.len() as f64
    }

    /// Nearest-rank 95th percentile
    fn p95_latency(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut latencies: Vec<f64> = self.samples.iter().map(|s| s.latency_ms).collect();
        latencies.sort_by(f64::total_cmp);
        let rank = (latencies.len() as f64 * 0.95).ceil() as usize;
        latencies[rank.saturating_sub(1).min(latencies.len() - 1)]
    }

    /// `(samples, failures)` recorded at or after `since`
    fn recent(&self, since: Option<Instant>) -> (usize, usize) {
        self.samples
            .iter()
            .filter(|s| !matches!(since, Some(t) if s.recorded_at < t))
            .fold((0, 0), |(total, failed), s| {
                (total + 1, failed + usize::from(!s.success))
            })
    }

    fn clear(&mut self) {
        self.samples.clear();
        self.next = 0;
    }
}

/// Derived 0-100 score: error rate weighs 0.7, latency penalty 0.3.
///
/// Non-increasing in both error rate and latency.
#[must_use]
pub fn health_score(error_rate: f64, average_latency_ms: f64, latency_ceiling_ms: f64) -> f64 {
    let error_pct = (error_rate * 100.0).clamp(0.0, 100.0);
    let latency_penalty = if latency_ceiling_ms > 0.0 {
        (average_latency_ms / latency_ceiling_ms * 100.0).clamp(0.0, 100.0)
    } else {
        0.0
    };
    (100.0 - error_pct * 0.7 - latency_penalty * 0.3).clamp(0.0, 100.0)
}

// ============================================================================
// Per-Instance State
// ============================================================================

#[derive(Debug)]
struct InstanceState {
    window: OutcomeWindow,
    breaker: Breaker,
    total_requests: u64,
    failed_requests: u64,
    health_score: f64,
}

impl InstanceState {
    fn new(config: &HealthConfig) -> Self {
        Self {
            window: OutcomeWindow::new(config.window_size),
            breaker: Breaker::Closed,
            total_requests: 0,
            failed_requests: 0,
            health_score: 100.0,
        }
    }

    /// Lazily move an open circuit to half-open once the cooldown elapsed
    fn refresh(&mut self, now: Instant, cooldown: Duration, name: &str) {
        if let Breaker::Open { opened_at } = self.breaker {
            if now.saturating_duration_since(opened_at) >= cooldown {
                self.breaker = Breaker::HalfOpen {
                    probe_in_flight: false,
                };
                tracing::info!(model = %name, "Circuit breaker half-open, awaiting probe");
            }
        }
    }

    fn accepting(&self) -> bool {
        match self.breaker {
            Breaker::Closed => true,
            Breaker::Open { .. } => false,
            Breaker::HalfOpen { probe_in_flight } => !probe_in_flight,
        }
    }

    fn rescore(&mut self, config: &HealthConfig) {
        self.health_score = health_score(
            self.window.error_rate(),
            self.window.average_latency(),
            config.latency_ceiling_ms,
        );
    }
}

struct InstanceEntry {
    name: String,
    state: Mutex<InstanceState>,
}

// ============================================================================
// Health Snapshot
// ============================================================================

/// Point-in-time health of one instance, as consumed by selection and dashboards
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct InstanceHealth {
    /// Instance name
    pub instance: String,

    /// Lifetime completed calls
    pub total_requests: u64,

    /// Lifetime failed calls
    pub failed_requests: u64,

    /// Mean latency over the window (ms); 0 without samples
    pub average_latency: f64,

    /// 95th percentile latency over the window (ms)
    pub p95_latency: f64,

    /// Derived 0-100 score
    pub health_score: f64,

    /// Whether the breaker is open
    pub circuit_open: bool,

    /// Full breaker state
    pub circuit_state: CircuitState,

    /// Failed / total over the window
    pub error_rate: f64,

    /// Samples currently in the window
    pub window_samples: usize,

    /// Whether a call would be admitted right now
    pub accepting: bool,
}

impl InstanceHealth {
    /// Health of an instance that has never been called
    pub fn fresh(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            total_requests: 0,
            failed_requests: 0,
            average_latency: 0.0,
            p95_latency: 0.0,
            health_score: 100.0,
            circuit_open: false,
            circuit_state: CircuitState::Closed,
            error_rate: 0.0,
            window_samples: 0,
            accepting: true,
        }
    }

    fn from_state(name: &str, state: &InstanceState) -> Self {
        let circuit_state = state.breaker.state();
        Self {
            instance: name.to_string(),
            total_requests: state.total_requests,
            failed_requests: state.failed_requests,
            average_latency: state.window.average_latency(),
            p95_latency: state.window.p95_latency(),
            health_score: state.health_score,
            circuit_open: circuit_state == CircuitState::Open,
            circuit_state,
            error_rate: state.window.error_rate(),
            window_samples: state.window.len(),
            accepting: state.accepting(),
        }
    }
}

/// Aggregate signals across every tracked instance
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct AggregateHealth {
    /// Instances that have recorded at least one outcome
    pub tracked_instances: usize,

    /// Instances whose circuit is open
    pub open_circuits: usize,

    /// Samples across all windows
    pub window_samples: usize,

    /// Failed samples across all windows
    pub window_failures: usize,
}

impl AggregateHealth {
    /// Fraction of tracked instances with an open circuit
    #[must_use]
    pub fn open_fraction(&self) -> f64 {
        if self.tracked_instances == 0 {
            0.0
        } else {
            self.open_circuits as f64 / self.tracked_instances as f64
        }
    }

    /// Windowed error rate across all instances
    #[must_use]
    pub fn error_rate(&self) -> f64 {
        if self.window_samples == 0 {
            0.0
        } else {
            self.window_failures as f64 / self.window_samples as f64
        }
    }
}

// ============================================================================
// Health Tracker
// ============================================================================

/// Per-instance health state for every backend the resolver has called
pub struct InstanceHealthTracker {
    instances: DashMap<String, Arc<InstanceEntry>>,
    config: HealthConfig,
}

impl InstanceHealthTracker {
    /// Create a tracker with the default policy
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(HealthConfig::default())
    }

    /// Create a tracker with a custom policy
    #[must_use]
    pub fn with_config(config: HealthConfig) -> Self {
        Self {
            instances: DashMap::new(),
            config,
        }
    }

    /// Active policy
    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    fn entry(&self, instance: &str) -> Arc<InstanceEntry> {
        if let Some(entry) = self.instances.get(instance) {
            return entry.clone();
        }
        self.instances
            .entry(instance.to_string())
            .or_insert_with(|| {
                Arc::new(InstanceEntry {
                    name: instance.to_string(),
                    state: Mutex::new(InstanceState::new(&self.config)),
                })
            })
            .clone()
    }

    /// Record a completed call (success, failure, timeout or cancellation).
    ///
    /// Returns the breaker state after the update.
    pub fn record_outcome(&self, instance: &str, success: bool, latency: Duration) -> CircuitState {
        let entry = self.entry(instance);
        let mut state = entry.state.lock();
        let now = Instant::now();
        state.refresh(now, self.config.cooldown(), &entry.name);

        state.total_requests += 1;
        if !success {
            state.failed_requests += 1;
        }

        let sample = Sample {
            success,
            latency_ms: latency.as_secs_f64() * 1000.0,
            recorded_at: now,
        };

        match state.breaker {
            Breaker::Closed => {
                state.window.push(sample);
                if !success
                    && state.window.len() >= self.config.min_samples
                    && state.window.error_rate() > self.config.error_rate_threshold
                {
                    state.breaker = Breaker::Open { opened_at: now };
                    tracing::warn!(
                        model = %entry.name,
                        error_rate = state.window.error_rate(),
                        samples = state.window.len(),
                        "Circuit breaker opened"
                    );
                }
            }
            Breaker::HalfOpen { .. } => {
                if success {
                    state.window.clear();
                    state.window.push(sample);
                    state.breaker = Breaker::Closed;
                    tracing::info!(model = %entry.name, "Probe succeeded, circuit breaker closed");
                } else {
                    state.window.push(sample);
                    state.breaker = Breaker::Open { opened_at: now };
                    tracing::warn!(model = %entry.name, "Probe failed, circuit breaker reopened");
                }
            }
            Breaker::Open { .. } => {
                // Late completion of a call admitted before the circuit opened
                state.window.push(sample);
            }
        }

        state.rescore(&self.config);
        state.breaker.state()
    }

    /// Ask to send a call to `instance`.
    ///
    /// In half-open state the first caller receives [`Admission::Probe`] and
    /// every other caller is rejected until the probe's outcome is recorded.
    pub fn try_admit(&self, instance: &str) -> Admission {
        let Some(entry) = self.instances.get(instance).map(|e| e.clone()) else {
            return Admission::Allowed;
        };
        let mut state = entry.state.lock();
        state.refresh(Instant::now(), self.config.cooldown(), &entry.name);

        match state.breaker {
            Breaker::Closed => Admission::Allowed,
            Breaker::Open { .. } => Admission::Rejected,
            Breaker::HalfOpen {
                probe_in_flight: false,
            } => {
                state.breaker = Breaker::HalfOpen {
                    probe_in_flight: true,
                };
                tracing::debug!(model = %entry.name, "Admitting half-open probe");
                Admission::Probe
            }
            Breaker::HalfOpen {
                probe_in_flight: true,
            } => Admission::Rejected,
        }
    }

    /// Admit a call to `instance` and hold the admission until its outcome
    /// is recorded.
    ///
    /// Returns `None` when the circuit rejects the call.
    pub fn admit(&self, instance: &str) -> Option<AdmissionGuard<'_>> {
        let admission = self.try_admit(instance);
        admission.is_admitted().then(|| AdmissionGuard {
            tracker: self,
            instance: instance.to_string(),
            admission,
            started: Instant::now(),
            completed: false,
        })
    }

    /// Current health of `instance`; untracked instances report fresh health
    pub fn snapshot(&self, instance: &str) -> InstanceHealth {
        let Some(entry) = self.instances.get(instance).map(|e| e.clone()) else {
            return InstanceHealth::fresh(instance);
        };
        let mut state = entry.state.lock();
        state.refresh(Instant::now(), self.config.cooldown(), &entry.name);
        InstanceHealth::from_state(&entry.name, &state)
    }

    /// Snapshots of every tracked instance, sorted by name
    pub fn all_snapshots(&self) -> Vec<InstanceHealth> {
        let entries: Vec<Arc<InstanceEntry>> =
            self.instances.iter().map(|e| e.value().clone()).collect();
        let now = Instant::now();
        let mut snapshots: Vec<InstanceHealth> = entries
            .iter()
            .map(|entry| {
                let mut state = entry.state.lock();
                state.refresh(now, self.config.cooldown(), &entry.name);
                InstanceHealth::from_state(&entry.name, &state)
            })
            .collect();
        snapshots.sort_by(|a, b| a.instance.cmp(&b.instance));
        snapshots
    }

    /// Aggregate signals for load shedding.
    ///
    /// Only samples newer than `horizon` from instances with a closed circuit
    /// feed the error rate. Open and half-open instances are already out of
    /// rotation and count through `open_circuits` instead.
    pub fn aggregate(&self, horizon: Duration) -> AggregateHealth {
        let entries: Vec<Arc<InstanceEntry>> =
            self.instances.iter().map(|e| e.value().clone()).collect();
        let now = Instant::now();
        let since = now.checked_sub(horizon);

        let mut aggregate = AggregateHealth::default();
        for entry in entries {
            let mut state = entry.state.lock();
            state.refresh(now, self.config.cooldown(), &entry.name);
            aggregate.tracked_instances += 1;
            match state.breaker {
                Breaker::Open { .. } => aggregate.open_circuits += 1,
                Breaker::HalfOpen { .. } => {}
                Breaker::Closed => {
                    let (samples, failures) = state.window.recent(since);
                    aggregate.window_samples += samples;
                    aggregate.window_failures += failures;
                }
            }
        }
        aggregate
    }

    /// Force a breaker state (admin override and tests)
    pub fn force_state(&self, instance: &str, state: CircuitState) {
        let entry = self.entry(instance);
        let mut guard = entry.state.lock();
        guard.breaker = match state {
            CircuitState::Closed => Breaker::Closed,
            CircuitState::Open => Breaker::Open {
                opened_at: Instant::now(),
            },
            CircuitState::HalfOpen => Breaker::HalfOpen {
                probe_in_flight: false,
            },
        };
        tracing::info!(model = %entry.name, state = ?state, "Circuit breaker state forced");
    }

    /// Drop all history for `instance`
    pub fn reset(&self, instance: &str) {
        if let Some(entry) = self.instances.get(instance).map(|e| e.clone()) {
            *entry.state.lock() = InstanceState::new(&self.config);
        }
    }

    /// Stop tracking `instance`
    pub fn remove(&self, instance: &str) {
        self.instances.remove(instance);
    }

    /// Number of tracked instances
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }
}

impl Default for InstanceHealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InstanceHealthTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceHealthTracker")
            .field("instances", &self.instances.len())
            .field("config", &self.config)
            .finish()
    }
}

// ============================================================================
// Admission Guard
// ============================================================================

/// An admitted call that has not recorded its outcome yet.
///
/// Dropping the guard without [`AdmissionGuard::complete`] records a failure,
/// so a call abandoned mid-flight (its future dropped by a timeout or a
/// disconnected client) still releases a half-open probe and reopens the
/// circuit instead of leaving it waiting on a probe that never reports.
#[must_use = "dropping the guard records a failed call"]
pub struct AdmissionGuard<'a> {
    tracker: &'a InstanceHealthTracker,
    instance: String,
    admission: Admission,
    started: Instant,
    completed: bool,
}

impl AdmissionGuard<'_> {
    /// How the call was admitted
    pub fn admission(&self) -> Admission {
        self.admission
    }

    /// Record the call's outcome, returning the breaker state after it
    pub fn complete(mut self, success: bool, latency: Duration) -> CircuitState {
        self.completed = true;
        self.tracker.record_outcome(&self.instance, success, latency)
    }
}

impl Drop for AdmissionGuard<'_> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        let state = self
            .tracker
            .record_outcome(&self.instance, false, self.started.elapsed());
        tracing::debug!(
            model = %self.instance,
            admission = ?self.admission,
            state = ?state,
            "Call abandoned before completion, recorded as failure"
        );
    }
}

impl std::fmt::Debug for AdmissionGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionGuard")
            .field("instance", &self.instance)
            .field("admission", &self.admission)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================
