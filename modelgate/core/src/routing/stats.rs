//! Route Traffic Stats
//!
//! Per-route request and usage events backing the route detail view. The
//! gateway records one request event per served resolution; token and cost
//! figures arrive separately from the billing collaborator through
//! [`RouteStats::record_usage`].
//!
//! Events older than the retention period are dropped lazily whenever a route
//! is written or queried.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

#[derive(Clone, Debug)]
enum EventKind {
    Request { latency_ms: f64 },
    Usage { tokens: u64, cost: f64 },
}

#[derive(Clone, Debug)]
struct TrafficEvent {
    at: DateTime<Utc>,
    model: String,
    provider: Option<String>,
    kind: EventKind,
}

/// Traffic of one model within a route over a window
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ModelTraffic {
    /// Instance name
    pub model: String,

    /// Provider kind, when the instance is registered
    pub provider: Option<String>,

    /// Requests served
    pub requests: u64,

    /// Mean latency of served requests (ms)
    pub avg_latency: f64,

    /// Tokens reported by billing
    pub tokens: u64,

    /// Cost reported by billing
    pub cost: f64,

    /// Share of the route's requests (0-100)
    pub percentage: f64,
}

/// Traffic of one route over a window
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RouteTrafficStats {
    /// Route id
    pub route_id: String,

    /// Start of the window
    pub window_start: DateTime<Utc>,

    /// End of the window (query time)
    pub window_end: DateTime<Utc>,

    /// Requests served
    pub total_requests: u64,

    /// Tokens reported by billing
    pub total_tokens: u64,

    /// Cost reported by billing
    pub total_cost: f64,

    /// Per-model breakdown, busiest first
    pub models: Vec<ModelTraffic>,
}

/// Windowed traffic statistics for every route
#[derive(Debug)]
pub struct RouteStats {
    routes: DashMap<String, Mutex<VecDeque<TrafficEvent>>>,
    retention: TimeDelta,
}

fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

fn before(at: DateTime<Utc>, delta: TimeDelta) -> DateTime<Utc> {
    at.checked_sub_signed(delta).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl RouteStats {
    /// Keep events for `retention`
    pub fn new(retention: Duration) -> Self {
        Self {
            routes: DashMap::new(),
            retention: to_delta(retention),
        }
    }

    /// Record a served request
    pub fn record_request(&self, route_id: &str, model: &str, provider: Option<&str>, latency: Duration) {
        self.push(
            route_id,
            TrafficEvent {
                at: Utc::now(),
                model: model.to_string(),
                provider: provider.map(str::to_string),
                kind: EventKind::Request {
                    latency_ms: latency.as_secs_f64() * 1000.0,
                },
            },
        );
    }

    /// Record tokens and cost reported by the billing collaborator for a
    /// request previously served by `model`
    pub fn record_usage(&self, route_id: &str, model: &str, tokens: u64, cost: f64) {
        self.push(
            route_id,
            TrafficEvent {
                at: Utc::now(),
                model: model.to_string(),
                provider: None,
                kind: EventKind::Usage { tokens, cost },
            },
        );
    }

    fn push(&self, route_id: &str, event: TrafficEvent) {
        let cutoff = before(event.at, self.retention);
        let entry = self
            .routes
            .entry(route_id.to_string())
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        let mut events = entry.lock();
        prune(&mut events, cutoff);
        events.push_back(event);
    }

    /// Stats for `route_id` over the last `window`
    pub fn route_stats(&self, route_id: &str, window: Duration) -> RouteTrafficStats {
        let window_end = Utc::now();
        let window_start = before(window_end, to_delta(window).min(self.retention));

        let mut stats = RouteTrafficStats {
            route_id: route_id.to_string(),
            window_start,
            window_end,
            total_requests: 0,
            total_tokens: 0,
            total_cost: 0.0,
            models: Vec::new(),
        };

        let Some(entry) = self.routes.get(route_id) else {
            return stats;
        };
        let mut events = entry.lock();
        prune(&mut events, before(window_end, self.retention));

        #[derive(Default)]
        struct Accumulator {
            provider: Option<String>,
            requests: u64,
            latency_sum: f64,
            tokens: u64,
            cost: f64,
        }

        let mut per_model: BTreeMap<&str, Accumulator> = BTreeMap::new();
        for event in events.iter().filter(|e| e.at >= window_start) {
            let acc = per_model.entry(event.model.as_str()).or_default();
            if acc.provider.is_none() {
                acc.provider.clone_from(&event.provider);
            }
            match event.kind {
                EventKind::Request { latency_ms } => {
                    acc.requests += 1;
                    acc.latency_sum += latency_ms;
                }
                EventKind::Usage { tokens, cost } => {
                    acc.tokens += tokens;
                    acc.cost += cost;
                }
            }
        }

        stats.total_requests = per_model.values().map(|a| a.requests).sum();
        stats.total_tokens = per_model.values().map(|a| a.tokens).sum();
        stats.total_cost = per_model.values().map(|a| a.cost).sum();

        stats.models = per_model
            .into_iter()
            .map(|(model, acc)| ModelTraffic {
                model: model.to_string(),
                provider: acc.provider,
                requests: acc.requests,
                avg_latency: if acc.requests > 0 {
                    acc.latency_sum / acc.requests as f64
                } else {
                    0.0
                },
                tokens: acc.tokens,
                cost: acc.cost,
                percentage: if stats.total_requests > 0 {
                    acc.requests as f64 / stats.total_requests as f64 * 100.0
                } else {
                    0.0
                },
            })
            .collect();
        stats
            .models
            .sort_by(|a, b| b.requests.cmp(&a.requests).then_with(|| a.model.cmp(&b.model)));
        stats
    }

    /// Forget a deleted route
    pub fn remove_route(&self, route_id: &str) {
        self.routes.remove(route_id);
    }

    /// Retained events for `route_id`
    pub fn event_count(&self, route_id: &str) -> usize {
        self.routes.get(route_id).map_or(0, |e| e.lock().len())
    }
}

impl Default for RouteStats {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}

fn prune(events: &mut VecDeque<TrafficEvent>, cutoff: DateTime<Utc>) {
    while events.front().is_some_and(|e| e.at < cutoff) {
        events.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_empty_route() {
        let stats = RouteStats::default();
        let result = stats.route_stats("r1", Duration::from_secs(60));
        assert_eq!(result.total_requests, 0);
        assert!(result.models.is_empty());
        assert!(result.window_start < result.window_end);
    }

    #[test]
    fn test_breakdown_and_percentages() {
        let stats = RouteStats::default();
        for _ in 0..3 {
            stats.record_request("r1", "gpt-4", Some("openai"), ms(100));
        }
        stats.record_request("r1", "llama", Some("ollama"), ms(300));
        stats.record_usage("r1", "gpt-4", 1200, 0.36);
        stats.record_usage("r1", "llama", 400, 0.0);
        stats.record_request("r2", "other", None, ms(1));

        let result = stats.route_stats("r1", Duration::from_secs(60));
        assert_eq!(result.total_requests, 4);
        assert_eq!(result.total_tokens, 1600);
        assert!((result.total_cost - 0.36).abs() < 1e-9);

        let gpt4 = &result.models[0];
        assert_eq!(gpt4.model, "gpt-4");
        assert_eq!(gpt4.provider.as_deref(), Some("openai"));
        assert_eq!(gpt4.requests, 3);
        assert!((gpt4.percentage - 75.0).abs() < 1e-9);
        assert!((gpt4.avg_latency - 100.0).abs() < 1e-6);

        let llama = &result.models[1];
        assert!((llama.percentage - 25.0).abs() < 1e-9);
        assert_eq!(llama.tokens, 400);
    }

    #[test]
    fn test_retention_prunes_old_events() {
        let stats = RouteStats::new(Duration::from_secs(60));
        stats.push(
            "r1",
            TrafficEvent {
                at: Utc::now() - TimeDelta::minutes(5),
                model: "old".into(),
                provider: None,
                kind: EventKind::Request { latency_ms: 1.0 },
            },
        );
        stats.record_request("r1", "new", None, ms(1));

        assert_eq!(stats.event_count("r1"), 1);
        let result = stats.route_stats("r1", Duration::from_secs(3600));
        assert_eq!(result.models.len(), 1);
        assert_eq!(result.models[0].model, "new");
    }

    #[test]
    fn test_window_excludes_older_events() {
        let stats = RouteStats::default();
        stats.push(
            "r1",
            TrafficEvent {
                at: Utc::now() - TimeDelta::minutes(10),
                model: "earlier".into(),
                provider: None,
                kind: EventKind::Request { latency_ms: 1.0 },
            },
        );
        stats.record_request("r1", "recent", None, ms(1));

        let result = stats.route_stats("r1", Duration::from_secs(60));
        assert_eq!(result.total_requests, 1);
        assert_eq!(stats.event_count("r1"), 2);

        stats.remove_route("r1");
        assert_eq!(stats.event_count("r1"), 0);
    }
}
