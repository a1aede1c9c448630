//! Concurrency Tests for Shared Routing State
//!
//! Many request tasks touch the same health records, cursors and fallback
//! snapshot at once. These tests hammer those paths from a multi-threaded
//! runtime and check that no update is lost and no transition happens twice.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;

use modelgate_core::routing::{
    Admission, Candidate, CircuitState, HealthConfig, InstanceHealthTracker, InstanceInvoker,
    InvocationError, LoadShedConfig, ModelGateway, RequestContext, Route, RouteModel,
    RouterConfig, Strategy, StrategySelector,
};

/// Succeeds for every model and counts calls
#[derive(Default)]
struct CountingInvoker {
    calls: AtomicUsize,
}

#[async_trait]
impl InstanceInvoker for CountingInvoker {
    type Output = ();

    async fn invoke(&self, _model_name: &str, _ctx: &RequestContext) -> Result<(), InvocationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_outcomes_are_not_lost() {
    let tracker = Arc::new(InstanceHealthTracker::with_config(HealthConfig {
        error_rate_threshold: 1.0,
        ..Default::default()
    }));

    let mut tasks = JoinSet::new();
    for worker in 0..8 {
        let tracker = tracker.clone();
        tasks.spawn(async move {
            for i in 0..500 {
                let success = (worker + i) % 4 != 0;
                tracker.record_outcome("shared", success, Duration::from_millis(5));
            }
        });
    }
    while let Some(result) = tasks.join_next().await {
        result.unwrap();
    }

    let health = tracker.snapshot("shared");
    assert_eq!(health.total_requests, 4000);
    assert_eq!(health.failed_requests, 1000);
    assert_eq!(health.window_samples, 100);
    assert_eq!(health.circuit_state, CircuitState::Closed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_failures_open_once() {
    let tracker = Arc::new(InstanceHealthTracker::new());
    let opened = Arc::new(AtomicUsize::new(0));

    let mut tasks = JoinSet::new();
    for _ in 0..16 {
        let tracker = tracker.clone();
        let opened = opened.clone();
        tasks.spawn(async move {
            for _ in 0..20 {
                if tracker.try_admit("dying") == Admission::Rejected {
                    continue;
                }
                let before = tracker.snapshot("dying").circuit_state;
                let after = tracker.record_outcome("dying", false, Duration::from_millis(1));
                if before == CircuitState::Closed && after == CircuitState::Open {
                    opened.fetch_add(1, Ordering::SeqCst);
                }
            }
        });
    }
    while let Some(result) = tasks.join_next().await {
        result.unwrap();
    }

    assert_eq!(tracker.snapshot("dying").circuit_state, CircuitState::Open);
    // `before` is read outside the lock, so several tasks may observe Closed
    assert!(opened.load(Ordering::SeqCst) >= 1);
    assert!(tracker.snapshot("dying").total_requests < 16 * 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_half_open_admits_single_probe() {
    let tracker = Arc::new(InstanceHealthTracker::new());
    tracker.force_state("recovering", CircuitState::HalfOpen);

    let mut tasks = JoinSet::new();
    for _ in 0..32 {
        let tracker = tracker.clone();
        tasks.spawn(async move { tracker.try_admit("recovering") });
    }

    let mut probes = 0;
    let mut rejected = 0;
    while let Some(result) = tasks.join_next().await {
        match result.unwrap() {
            Admission::Probe => probes += 1,
            Admission::Rejected => rejected += 1,
            Admission::Allowed => panic!("half-open circuit admitted a normal call"),
        }
    }
    assert_eq!(probes, 1);
    assert_eq!(rejected, 31);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_cursor_advances_once_per_pick() {
    let selector = Arc::new(StrategySelector::with_seed(1));
    let models = Arc::new(vec![
        RouteModel::new("a").with_weight(1.0),
        RouteModel::new("b").with_weight(1.0),
    ]);

    let mut tasks = JoinSet::new();
    for _ in 0..8 {
        let selector = selector.clone();
        let models = models.clone();
        tasks.spawn(async move {
            let tracker = InstanceHealthTracker::new();
            let mut picks = [0usize; 2];
            for _ in 0..1000 {
                let candidates: Vec<Candidate<'_>> = models
                    .iter()
                    .map(|m| Candidate::new(m, tracker.snapshot(&m.model_name)))
                    .collect();
                let chosen = selector
                    .select("split", Strategy::WeightedRoundRobin, &candidates)
                    .unwrap();
                picks[chosen] += 1;
            }
            picks
        });
    }

    let mut totals = [0usize; 2];
    while let Some(result) = tasks.join_next().await {
        let picks = result.unwrap();
        totals[0] += picks[0];
        totals[1] += picks[1];
    }

    assert_eq!(selector.cursor_position("split"), 8000);
    assert_eq!(totals[0] + totals[1], 8000);
    let share = totals[0] as f64 / 8000.0;
    assert!((share - 0.5).abs() < 0.02, "share was {share}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_during_fallback_updates() {
    let config = RouterConfig {
        load_shed: LoadShedConfig {
            enabled: false,
            ..Default::default()
        },
        ..Default::default()
    };
    let gateway = Arc::new(ModelGateway::with_selector(
        config,
        StrategySelector::with_seed(9),
    ));
    gateway
        .registry()
        .create_route(
            Route::new("r1", "chat")
                .with_strategy(Strategy::Random)
                .with_model(RouteModel::new("m1"))
                .with_model(RouteModel::new("m2")),
        )
        .unwrap();

    let invoker = Arc::new(CountingInvoker::default());
    let mut tasks = JoinSet::new();
    for _ in 0..32 {
        let gateway = gateway.clone();
        let invoker = invoker.clone();
        tasks.spawn(async move {
            for _ in 0..25 {
                gateway
                    .handle("chat", &RequestContext::new(), invoker.as_ref())
                    .await
                    .unwrap();
            }
        });
    }

    let writer = {
        let gateway = gateway.clone();
        tokio::spawn(async move {
            for i in 0..50 {
                let mut map = BTreeMap::new();
                map.insert("m1".to_string(), vec![format!("spare-{i}")]);
                gateway.registry().set_fallback_map(map).unwrap();
                tokio::task::yield_now().await;
            }
        })
    };

    while let Some(result) = tasks.join_next().await {
        result.unwrap();
    }
    writer.await.unwrap();

    assert_eq!(invoker.calls.load(Ordering::SeqCst), 800);
    assert_eq!(gateway.metrics().resolved.get(), 800);
    assert_eq!(gateway.registry().fallbacks().version(), 50);

    let stats = gateway.route_stats("r1", Duration::from_secs(60));
    assert_eq!(stats.total_requests, 800);
    let m1 = gateway.instance_health("m1").total_requests;
    let m2 = gateway.instance_health("m2").total_requests;
    assert_eq!(m1 + m2, 800);
}

#[tokio::test]
async fn test_interleaved_requests_get_distinct_weighted_picks() {
    let config = RouterConfig {
        load_shed: LoadShedConfig {
            enabled: false,
            ..Default::default()
        },
        ..Default::default()
    };
    let gateway = ModelGateway::with_selector(config, StrategySelector::with_seed(2));
    gateway
        .registry()
        .create_route(
            Route::new("r1", "split")
                .with_strategy(Strategy::WeightedRoundRobin)
                .with_model(RouteModel::new("a").with_weight(1.0))
                .with_model(RouteModel::new("b").with_weight(1.0)),
        )
        .unwrap();

    let invoker = CountingInvoker::default();
    let requests: Vec<_> = (0..200)
        .map(|_| RequestContext::new())
        .collect();
    let results = futures::future::join_all(
        requests
            .iter()
            .map(|ctx| gateway.handle("split", ctx, &invoker)),
    )
    .await;

    let mut a = 0;
    for result in results {
        if result.unwrap().model == "a" {
            a += 1;
        }
    }
    assert!((90..=110).contains(&a), "a served {a} of 200");
    assert_eq!(invoker.calls.load(Ordering::SeqCst), 200);
}
