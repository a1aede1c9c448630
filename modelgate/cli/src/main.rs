//! modelgate - Routing Configuration Tool
//!
//! Loads the gateway's routing configuration (routes, registered models and
//! the global fallback map), validates it exactly the way the gateway would
//! at startup, and can drive it with simulated traffic to observe failover
//! and circuit-breaker behavior.
//!
//! # Usage
//!
//! ```bash
//! # Validate the default config (~/.config/modelgate/gateway.toml)
//! modelgate validate
//!
//! # Print the effective configuration after env and CLI overrides
//! modelgate --config ./gateway.toml show-config
//!
//! # Send 1000 requests to "smart" with gpt-4 failing 60% of the time
//! modelgate simulate --route smart --requests 1000 --fail gpt-4=0.6 --latency gpt-4=40
//!
//! # Verbose logging
//! RUST_LOG=debug modelgate simulate --route smart
//! ```
//!
//! # Signals
//!
//! - `SIGINT`: Stop a running simulation and print the partial report

mod simulate;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use modelgate_core::routing::fallback::{DanglingReference, FallbackStats};
use modelgate_core::{
    default_config_path, load_config_from_path, ConfigOverrides, GatewayConfigFile, ModelGateway,
    StrategySelector,
};

use simulate::{parse_assignment, SimulatedInvoker, SimulationPlan};

/// modelgate - validate and exercise LLM gateway routing configuration
#[derive(Parser, Debug)]
#[command(name = "modelgate")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "MODELGATE_CONFIG", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "MODELGATE_LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Override the per-attempt timeout
    #[arg(long, value_name = "MS", global = true)]
    attempt_timeout_ms: Option<u64>,

    /// Override the circuit breaker cooldown
    #[arg(long, value_name = "MS", global = true)]
    cooldown_ms: Option<u64>,

    /// Disable load shedding
    #[arg(long, global = true)]
    no_load_shed: bool,

    /// Reject fallback maps that reference unregistered models
    #[arg(long, global = true)]
    strict_fallbacks: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load the configuration and report problems
    Validate,

    /// Print the effective configuration as JSON
    ShowConfig,

    /// Drive a route with simulated traffic and print a JSON report
    Simulate {
        /// Route slug to send requests to
        #[arg(short = 'r', long)]
        route: String,

        /// Total number of requests
        #[arg(short = 'n', long, default_value_t = 1000)]
        requests: u64,

        /// Concurrent request workers
        #[arg(short = 'j', long, default_value_t = 8)]
        concurrency: usize,

        /// Failure probability for a model, as MODEL=RATE (repeatable)
        #[arg(long = "fail", value_name = "MODEL=RATE", value_parser = parse_assignment::<f64>)]
        failures: Vec<(String, f64)>,

        /// Added latency for a model, as MODEL=MS (repeatable)
        #[arg(long = "latency", value_name = "MODEL=MS", value_parser = parse_assignment::<u64>)]
        latencies: Vec<(String, u64)>,

        /// Latency for models without a --latency entry
        #[arg(long, value_name = "MS", default_value_t = 0)]
        latency_ms: u64,

        /// PRNG seed for failure injection and random selection
        #[arg(long, default_value_t = 7)]
        seed: u64,

        /// Also print Prometheus metrics after the report
        #[arg(long)]
        prometheus: bool,
    },
}

/// Summary printed by `validate`
#[derive(Debug, Serialize)]
struct ValidationReport {
    config_file: Option<PathBuf>,
    source: String,
    routes: usize,
    enabled_routes: usize,
    models: usize,
    fallbacks: FallbackStats,
    dangling_references: Vec<DanglingReference>,
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("modelgate={level},modelgate_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn overrides(args: &Args) -> ConfigOverrides {
    let mut overrides = ConfigOverrides::new();
    if let Some(ms) = args.attempt_timeout_ms {
        overrides = overrides.with_attempt_timeout_ms(ms);
    }
    if let Some(ms) = args.cooldown_ms {
        overrides = overrides.with_cooldown_ms(ms);
    }
    if args.no_load_shed {
        overrides = overrides.with_load_shed_enabled(false);
    }
    if args.strict_fallbacks {
        overrides = overrides.with_reject_dangling_references(true);
    }
    overrides
}

/// Load file + env configuration and apply CLI overrides
fn load(args: &Args) -> Result<GatewayConfigFile> {
    let path = args.config.clone().or_else(default_config_path);
    if let Some(ref path) = path {
        info!(config_path = ?path, "Config file");
    }

    let mut config = load_config_from_path(path).context("Failed to load configuration")?;
    overrides(args).apply(&mut config);
    config
        .validate()
        .context("Configuration invalid after CLI overrides")?;

    info!(source = %config.source(), routes = config.routes.len(), "Configuration loaded");
    Ok(config)
}

/// Build a gateway from `config`, returning tolerated dangling references
fn build_gateway(
    config: &GatewayConfigFile,
    seed: Option<u64>,
) -> Result<(ModelGateway, Vec<DanglingReference>)> {
    let selector = seed.map_or_else(StrategySelector::new, StrategySelector::with_seed);
    let gateway = ModelGateway::with_selector(config.router.clone(), selector);
    let dangling = config
        .install(&gateway)
        .context("Failed to install routing configuration")?;
    for reference in &dangling {
        warn!(%reference, "Fallback references an unregistered model");
    }
    Ok((gateway, dangling))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{json}");
    Ok(())
}

fn validate(args: &Args) -> Result<()> {
    let config = load(args)?;
    let (gateway, dangling) = build_gateway(&config, None)?;
    let registry = gateway.registry();

    let report = ValidationReport {
        config_file: config.config_file_path.clone(),
        source: config.source().to_string(),
        routes: registry.route_count(),
        enabled_routes: registry.routes().iter().filter(|r| r.enabled).count(),
        models: registry.models().len(),
        fallbacks: registry.fallbacks().stats(),
        dangling_references: dangling,
    };
    print_json(&report)
}

#[allow(clippy::too_many_arguments)]
async fn simulate(
    args: &Args,
    route: &str,
    requests: u64,
    concurrency: usize,
    failures: &[(String, f64)],
    latencies: &[(String, u64)],
    latency_ms: u64,
    seed: u64,
    prometheus: bool,
) -> Result<()> {
    if let Some((model, rate)) = failures.iter().find(|(_, r)| !(0.0..=1.0).contains(r)) {
        anyhow::bail!("failure rate for {model} must be between 0 and 1, got {rate}");
    }

    let config = load(args)?;
    let (gateway, _) = build_gateway(&config, Some(seed))?;
    let gateway = Arc::new(gateway);

    let plan = SimulationPlan {
        failure_rates: failures.iter().cloned().collect(),
        latencies: latencies
            .iter()
            .map(|(model, ms)| (model.clone(), Duration::from_millis(*ms)))
            .collect(),
        default_latency: Duration::from_millis(latency_ms),
        seed,
    };

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling in-flight requests");
            signal_token.cancel();
        }
    });

    let report = simulate::run(
        gateway.clone(),
        Arc::new(SimulatedInvoker::new(plan)),
        route,
        requests,
        concurrency,
        shutdown,
    )
    .await;
    print_json(&report)?;

    if prometheus {
        print!("{}", gateway.prometheus());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    match &args.command {
        Command::Validate => validate(&args),
        Command::ShowConfig => {
            let config = load(&args)?;
            print_json(&config)
        }
        Command::Simulate {
            route,
            requests,
            concurrency,
            failures,
            latencies,
            latency_ms,
            seed,
            prometheus,
        } => {
            simulate(
                &args,
                route,
                *requests,
                *concurrency,
                failures,
                latencies,
                *latency_ms,
                *seed,
                *prometheus,
            )
            .await
        }
    }
}
