//! Selection Strategies
//!
//! Picks the first instance to try from a route's candidate pool.
//!
//! | Strategy               | Winner                                            |
//! |------------------------|---------------------------------------------------|
//! | `priority`             | highest priority, then lowest latency, then order |
//! | `least-latency`        | lowest average latency (no samples = 0 ms)        |
//! | `weighted-round-robin` | proportional to weight via a per-route cursor     |
//! | `random`               | uniform, seedable                                 |
//!
//! Disabled entries and instances that would not currently admit a call are
//! never eligible, whatever the strategy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

use super::config::{RouteModel, Strategy};
use super::health::InstanceHealth;

/// Fractional part of the golden ratio; consecutive multiples of it are
/// evenly spread over [0, 1).
const GOLDEN_RATIO_CONJUGATE: f64 = 0.618_033_988_749_894_9;

/// Selection failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectionError {
    /// Every entry is disabled or short-circuited
    #[error("no eligible candidates among {considered} route models")]
    NoEligibleCandidates {
        /// Number of entries that were considered
        considered: usize,
    },
}

/// A route entry paired with its current health
#[derive(Debug, Clone)]
pub struct Candidate<'a> {
    /// The route entry
    pub entry: &'a RouteModel,

    /// Health snapshot taken for this selection
    pub health: InstanceHealth,
}

impl<'a> Candidate<'a> {
    /// Pair an entry with its health
    pub fn new(entry: &'a RouteModel, health: InstanceHealth) -> Self {
        Self { entry, health }
    }

    /// Instance name
    pub fn model_name(&self) -> &'a str {
        &self.entry.model_name
    }

    /// Enabled and currently admitting calls
    #[must_use]
    pub fn is_eligible(&self) -> bool {
        self.entry.enabled && !self.health.circuit_open && self.health.accepting
    }
}

/// Stateful strategy engine shared by every request.
///
/// Holds one weighted-round-robin cursor per route and the PRNG used by the
/// random strategy.
pub struct StrategySelector {
    cursors: DashMap<String, Arc<AtomicU64>>,
    rng: Mutex<StdRng>,
}

impl StrategySelector {
    /// Selector with an entropy-seeded PRNG
    #[must_use]
    pub fn new() -> Self {
        Self {
            cursors: DashMap::new(),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Selector with a fixed PRNG seed (tests, simulations)
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self {
            cursors: DashMap::new(),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Pick one candidate for `route_key` using `strategy`.
    ///
    /// Returns the index of the chosen element of `candidates`.
    pub fn select(
        &self,
        route_key: &str,
        strategy: Strategy,
        candidates: &[Candidate<'_>],
    ) -> Result<usize, SelectionError> {
        let eligible: Vec<usize> = candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_eligible())
            .map(|(i, _)| i)
            .collect();

        if eligible.is_empty() {
            return Err(SelectionError::NoEligibleCandidates {
                considered: candidates.len(),
            });
        }

        let chosen = match strategy {
            Strategy::Priority => select_priority(candidates, &eligible),
            Strategy::LeastLatency => select_least_latency(candidates, &eligible),
            Strategy::WeightedRoundRobin => self.select_weighted(route_key, candidates, &eligible),
            Strategy::Random => self.select_random(&eligible),
        };

        tracing::trace!(
            route = %route_key,
            strategy = %strategy,
            model = %candidates[chosen].model_name(),
            eligible = eligible.len(),
            "Selected candidate"
        );

        Ok(chosen)
    }

    fn cursor(&self, route_key: &str) -> Arc<AtomicU64> {
        if let Some(cursor) = self.cursors.get(route_key) {
            return cursor.clone();
        }
        self.cursors
            .entry(route_key.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone()
    }

    fn select_weighted(&self, route_key: &str, candidates: &[Candidate<'_>], eligible: &[usize]) -> usize {
        let weight = |i: usize| {
            let w = candidates[i].entry.weight;
            if w.is_finite() && w > 0.0 {
                w
            } else {
                0.0
            }
        };

        let total: f64 = eligible.iter().map(|&i| weight(i)).sum();
        if total <= 0.0 {
            return self.select_random(eligible);
        }

        let tick = self.cursor(route_key).fetch_add(1, Ordering::Relaxed);
        let position = (tick as f64 * GOLDEN_RATIO_CONJUGATE).fract() * total;

        let mut cumulative = 0.0;
        let mut last_ticketed = eligible[0];
        for &i in eligible {
            let w = weight(i);
            if w == 0.0 {
                continue;
            }
            cumulative += w;
            last_ticketed = i;
            if position < cumulative {
                return i;
            }
        }
        // Float rounding at the top of the distribution
        last_ticketed
    }

    fn select_random(&self, eligible: &[usize]) -> usize {
        let pick = self.rng.lock().gen_range(0..eligible.len());
        eligible[pick]
    }

    /// Current weighted-round-robin cursor for a route
    pub fn cursor_position(&self, route_key: &str) -> u64 {
        self.cursors
            .get(route_key)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// Drop the cursor of a deleted route
    pub fn forget_route(&self, route_key: &str) {
        self.cursors.remove(route_key);
    }
}

impl Default for StrategySelector {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StrategySelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategySelector")
            .field("cursors", &self.cursors.len())
            .finish_non_exhaustive()
    }
}

fn select_priority(candidates: &[Candidate<'_>], eligible: &[usize]) -> usize {
    let mut best = eligible[0];
    for &i in &eligible[1..] {
        let (c, b) = (&candidates[i], &candidates[best]);
        let higher = c.entry.priority > b.entry.priority;
        let faster = c.entry.priority == b.entry.priority
            && c.health.average_latency < b.health.average_latency;
        if higher || faster {
            best = i;
        }
    }
    best
}

fn select_least_latency(candidates: &[Candidate<'_>], eligible: &[usize]) -> usize {
    let mut best = eligible[0];
    for &i in &eligible[1..] {
        if candidates[i].health.average_latency < candidates[best].health.average_latency {
            best = i;
        }
    }
    best
}
