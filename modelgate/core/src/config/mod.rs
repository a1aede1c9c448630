//! TOML Configuration File Support
//!
//! Centralized configuration loading for the gateway, from a TOML file at
//! `~/.config/modelgate/gateway.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (when applicable)
//! 2. Environment variables (`MODELGATE_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # XDG Base Directory Compliance
//!
//! - `$XDG_CONFIG_HOME/modelgate/gateway.toml` (typically `~/.config/modelgate/gateway.toml`)
//!
//! # Example Configuration
//!
//! ```toml
//! [health]
//! window_size = 100
//! latency_ceiling_ms = 10000
//!
//! [circuit_breaker]
//! min_samples = 10
//! error_rate_threshold = 0.5
//! cooldown_ms = 30000
//!
//! [load_shed]
//! enabled = true
//! open_circuit_fraction = 0.5
//! error_rate_threshold = 0.8
//! sample_horizon_ms = 10000
//!
//! [resolver]
//! attempt_timeout_ms = 60000
//!
//! [fallback]
//! reject_dangling_references = false
//!
//! [fallback.map]
//! "gpt-4" = ["claude-sonnet", "gpt-3.5"]
//!
//! [[models]]
//! name = "gpt-4"
//! provider = { type = "openai", api_key_env = "OPENAI_API_KEY" }
//!
//! [[routes]]
//! id = "r1"
//! slug = "smart"
//! strategy = "priority"
//! fallback_models = ["claude-haiku"]
//! models = [
//!     { model_name = "gpt-4", priority = 10 },
//!     { model_name = "gpt-3.5", priority = 5 },
//! ]
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::routing::fallback::{DanglingReference, FallbackMap};
use crate::routing::{ModelGateway, ModelInstance, RegistryError, Route, RouterConfig};

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    /// Routes, models or fallback map rejected by the registry
    #[error("Invalid routing configuration: {0}")]
    RoutingError(#[from] RegistryError),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    #[default]
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Health section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthToml {
    /// Outcomes kept per instance
    pub window_size: Option<usize>,

    /// Average latency at which the latency penalty saturates
    pub latency_ceiling_ms: Option<f64>,
}

/// Circuit breaker section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerToml {
    /// Window samples required before the breaker may open
    pub min_samples: Option<usize>,

    /// Windowed error rate that must be exceeded to open
    pub error_rate_threshold: Option<f64>,

    /// Open-circuit cooldown in milliseconds
    pub cooldown_ms: Option<u64>,
}

/// Load shedding section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadShedToml {
    /// Whether load shedding is enabled
    pub enabled: Option<bool>,

    /// Fraction of open circuits that triggers shedding
    pub open_circuit_fraction: Option<f64>,

    /// Global error rate that triggers shedding
    pub error_rate_threshold: Option<f64>,

    /// Global samples required before the error rate counts
    pub min_samples: Option<usize>,

    /// Age limit for error-rate samples, in milliseconds
    pub sample_horizon_ms: Option<u64>,

    /// How long a decision is reused, in milliseconds
    pub recompute_interval_ms: Option<u64>,
}

/// Resolver section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverToml {
    /// Per-attempt timeout in milliseconds
    pub attempt_timeout_ms: Option<u64>,
}

/// Fallback section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackToml {
    /// Reject maps that reference unregistered models
    pub reject_dangling_references: Option<bool>,

    /// Global fallback map
    pub map: Option<FallbackMap>,
}

/// Stats section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsToml {
    /// Route traffic retention in milliseconds
    pub retention_ms: Option<u64>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayToml {
    /// Health window section
    pub health: HealthToml,

    /// Circuit breaker section
    pub circuit_breaker: CircuitBreakerToml,

    /// Load shedding section
    pub load_shed: LoadShedToml,

    /// Resolver section
    pub resolver: ResolverToml,

    /// Fallback section
    pub fallback: FallbackToml,

    /// Stats section
    pub stats: StatsToml,

    /// Registered model instances
    pub models: Vec<ModelInstance>,

    /// Route records
    pub routes: Vec<Route>,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Centralized configuration for the gateway
///
/// Consolidates all configuration from multiple sources and tracks where it
/// came from. Use [`load_config`] to load configuration with proper priority
/// handling.
#[derive(Clone, Debug, Default, Serialize)]
pub struct GatewayConfigFile {
    /// Routing engine policy
    pub router: RouterConfig,

    /// Registered model instances
    pub models: Vec<ModelInstance>,

    /// Route records
    pub routes: Vec<Route>,

    /// Global fallback map
    pub fallback_map: FallbackMap,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl GatewayConfigFile {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let health = &self.router.health;
        let shed = &self.router.load_shed;

        let fractions = [
            ("circuit_breaker.error_rate_threshold", health.error_rate_threshold),
            ("load_shed.open_circuit_fraction", shed.open_circuit_fraction),
            ("load_shed.error_rate_threshold", shed.error_rate_threshold),
        ];
        for (name, value) in fractions {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::ValidationError(format!(
                    "{name} must be between 0 and 1, got {value}"
                )));
            }
        }

        if health.window_size == 0 {
            return Err(ConfigError::ValidationError(
                "health.window_size must be greater than 0".into(),
            ));
        }
        if health.min_samples == 0 {
            return Err(ConfigError::ValidationError(
                "circuit_breaker.min_samples must be greater than 0".into(),
            ));
        }
        if health.min_samples > health.window_size {
            return Err(ConfigError::ValidationError(format!(
                "circuit_breaker.min_samples ({}) exceeds health.window_size ({})",
                health.min_samples, health.window_size
            )));
        }
        if !(health.latency_ceiling_ms.is_finite() && health.latency_ceiling_ms > 0.0) {
            return Err(ConfigError::ValidationError(
                "health.latency_ceiling_ms must be positive".into(),
            ));
        }
        if shed.sample_horizon_ms == 0 {
            return Err(ConfigError::ValidationError(
                "load_shed.sample_horizon_ms must be greater than 0".into(),
            ));
        }
        if self.router.resolver.attempt_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "resolver.attempt_timeout_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Load models, routes and the fallback map into `gateway`.
    ///
    /// Returns tolerated dangling fallback references.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::RoutingError`] for the first rejected record.
    pub fn install(&self, gateway: &ModelGateway) -> Result<Vec<DanglingReference>, ConfigError> {
        let registry = gateway.registry();
        for model in &self.models {
            registry.register_model(model.clone());
        }
        for route in &self.routes {
            registry.create_route(route.clone())?;
        }
        let warnings = registry.set_fallback_map(self.fallback_map.clone())?;

        tracing::info!(
            models = self.models.len(),
            routes = self.routes.len(),
            fallback_entries = self.fallback_map.len(),
            "Installed routing configuration"
        );
        Ok(warnings)
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/modelgate/gateway.toml` or
/// `~/.config/modelgate/gateway.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("modelgate").join("gateway.toml"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if
/// the resulting values are out of range. A missing config file is not an
/// error (defaults are used).
pub fn load_config() -> Result<GatewayConfigFile, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Arguments
///
/// * `path` - Optional path to the configuration file. If `None`, only defaults
///   and environment variables are used.
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed, or
/// if validation fails.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<GatewayConfigFile, ConfigError> {
    let mut config = GatewayConfigFile::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: GatewayToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                routes = config.routes.len(),
                models = config.models.len(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, |key| std::env::var(key).ok());

    if let Err(e) = config.validate() {
        tracing::warn!(error = %e, "Rejected configuration");
        return Err(e);
    }
    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut GatewayConfigFile, toml: GatewayToml) {
    let router = &mut config.router;

    if let Some(size) = toml.health.window_size {
        router.health.window_size = size;
    }
    if let Some(ceiling) = toml.health.latency_ceiling_ms {
        router.health.latency_ceiling_ms = ceiling;
    }

    if let Some(samples) = toml.circuit_breaker.min_samples {
        router.health.min_samples = samples;
    }
    if let Some(threshold) = toml.circuit_breaker.error_rate_threshold {
        router.health.error_rate_threshold = threshold;
    }
    if let Some(cooldown) = toml.circuit_breaker.cooldown_ms {
        router.health.cooldown_ms = cooldown;
    }

    if let Some(enabled) = toml.load_shed.enabled {
        router.load_shed.enabled = enabled;
    }
    if let Some(fraction) = toml.load_shed.open_circuit_fraction {
        router.load_shed.open_circuit_fraction = fraction;
    }
    if let Some(threshold) = toml.load_shed.error_rate_threshold {
        router.load_shed.error_rate_threshold = threshold;
    }
    if let Some(samples) = toml.load_shed.min_samples {
        router.load_shed.min_samples = samples;
    }
    if let Some(horizon) = toml.load_shed.sample_horizon_ms {
        router.load_shed.sample_horizon_ms = horizon;
    }
    if let Some(interval) = toml.load_shed.recompute_interval_ms {
        router.load_shed.recompute_interval_ms = interval;
    }

    if let Some(timeout) = toml.resolver.attempt_timeout_ms {
        router.resolver.attempt_timeout_ms = timeout;
    }

    if let Some(reject) = toml.fallback.reject_dangling_references {
        router.reject_dangling_references = reject;
    }
    if let Some(retention) = toml.stats.retention_ms {
        router.stats_retention_ms = retention;
    }

    if let Some(map) = toml.fallback.map {
        config.fallback_map = map;
    }
    config.models = toml.models;
    config.routes = toml.routes;
}

fn parse_env<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparseable environment variable");
            None
        }
    }
}

fn parse_env_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    lookup(key).map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
}

/// Apply environment variable overrides to the config
fn apply_env_config(config: &mut GatewayConfigFile, lookup: impl Fn(&str) -> Option<String>) {
    let router = &mut config.router;
    let mut touched = false;

    if let Some(size) = parse_env(&lookup, "MODELGATE_WINDOW_SIZE") {
        router.health.window_size = size;
        touched = true;
    }
    if let Some(ceiling) = parse_env(&lookup, "MODELGATE_LATENCY_CEILING_MS") {
        router.health.latency_ceiling_ms = ceiling;
        touched = true;
    }
    if let Some(samples) = parse_env(&lookup, "MODELGATE_MIN_SAMPLES") {
        router.health.min_samples = samples;
        touched = true;
    }
    if let Some(threshold) = parse_env(&lookup, "MODELGATE_ERROR_RATE_THRESHOLD") {
        router.health.error_rate_threshold = threshold;
        touched = true;
    }
    if let Some(cooldown) = parse_env(&lookup, "MODELGATE_COOLDOWN_MS") {
        router.health.cooldown_ms = cooldown;
        touched = true;
    }
    if let Some(enabled) = parse_env_bool(&lookup, "MODELGATE_LOAD_SHED") {
        router.load_shed.enabled = enabled;
        touched = true;
    }
    if let Some(fraction) = parse_env(&lookup, "MODELGATE_SHED_OPEN_FRACTION") {
        router.load_shed.open_circuit_fraction = fraction;
        touched = true;
    }
    if let Some(threshold) = parse_env(&lookup, "MODELGATE_SHED_ERROR_RATE") {
        router.load_shed.error_rate_threshold = threshold;
        touched = true;
    }
    if let Some(timeout) = parse_env(&lookup, "MODELGATE_ATTEMPT_TIMEOUT_MS") {
        router.resolver.attempt_timeout_ms = timeout;
        touched = true;
    }
    if let Some(reject) = parse_env_bool(&lookup, "MODELGATE_REJECT_DANGLING") {
        router.reject_dangling_references = reject;
        touched = true;
    }

    if touched {
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Per-attempt timeout override (milliseconds)
    pub attempt_timeout_ms: Option<u64>,

    /// Circuit cooldown override (milliseconds)
    pub cooldown_ms: Option<u64>,

    /// Circuit error-rate threshold override
    pub error_rate_threshold: Option<f64>,

    /// Load shedding switch override
    pub load_shed_enabled: Option<bool>,

    /// Strict dangling-reference override
    pub reject_dangling_references: Option<bool>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set attempt timeout override
    #[must_use]
    pub fn with_attempt_timeout_ms(mut self, ms: u64) -> Self {
        self.attempt_timeout_ms = Some(ms);
        self
    }

    /// Set cooldown override
    #[must_use]
    pub fn with_cooldown_ms(mut self, ms: u64) -> Self {
        self.cooldown_ms = Some(ms);
        self
    }

    /// Set circuit error-rate threshold override
    #[must_use]
    pub fn with_error_rate_threshold(mut self, threshold: f64) -> Self {
        self.error_rate_threshold = Some(threshold);
        self
    }

    /// Set load shedding override
    #[must_use]
    pub fn with_load_shed_enabled(mut self, enabled: bool) -> Self {
        self.load_shed_enabled = Some(enabled);
        self
    }

    /// Set strict dangling-reference override
    #[must_use]
    pub fn with_reject_dangling_references(mut self, reject: bool) -> Self {
        self.reject_dangling_references = Some(reject);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut GatewayConfigFile) {
        if self.attempt_timeout_ms.is_some()
            || self.cooldown_ms.is_some()
            || self.error_rate_threshold.is_some()
            || self.load_shed_enabled.is_some()
            || self.reject_dangling_references.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        let router = &mut config.router;
        if let Some(timeout) = self.attempt_timeout_ms {
            router.resolver.attempt_timeout_ms = timeout;
        }
        if let Some(cooldown) = self.cooldown_ms {
            router.health.cooldown_ms = cooldown;
        }
        if let Some(threshold) = self.error_rate_threshold {
            router.health.error_rate_threshold = threshold;
        }
        if let Some(enabled) = self.load_shed_enabled {
            router.load_shed.enabled = enabled;
        }
        if let Some(reject) = self.reject_dangling_references {
            router.reject_dangling_references = reject;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::Strategy;
    use std::collections::HashMap;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = GatewayConfigFile::default();

        assert_eq!(config.router.health.window_size, 100);
        assert_eq!(config.router.health.min_samples, 10);
        assert_eq!(config.router.health.cooldown(), Duration::from_secs(30));
        assert!(config.router.load_shed.enabled);
        assert!(!config.router.reject_dangling_references);
        assert!(config.routes.is_empty());
        assert_eq!(config.source(), ConfigSource::Default);
        config.validate().unwrap();
    }

    #[test]
    fn test_default_config_path() {
        if let Some(p) = default_config_path() {
            assert!(p.to_string_lossy().contains("modelgate"));
            assert!(p.to_string_lossy().contains("gateway.toml"));
        }
    }

    #[test]
    fn test_parse_full_toml() {
        let file = write_config(
            r#"
[health]
window_size = 50
latency_ceiling_ms = 5000

[circuit_breaker]
min_samples = 5
error_rate_threshold = 0.25
cooldown_ms = 1000

[load_shed]
enabled = false
open_circuit_fraction = 0.75
sample_horizon_ms = 5000

[resolver]
attempt_timeout_ms = 2000

[fallback]
reject_dangling_references = true

[fallback.map]
"gpt-4" = ["claude-haiku"]

[[models]]
name = "gpt-4"
provider = { type = "openai", api_key_env = "OPENAI_API_KEY" }

[[models]]
name = "claude-haiku"
provider = { type = "anthropic", api_key_env = "ANTHROPIC_API_KEY" }

[[routes]]
id = "r1"
slug = "smart"
strategy = "weighted-round-robin"
models = [
    { model_name = "gpt-4", weight = 3.0 },
    { model_name = "claude-haiku" },
]
"#,
        );

        let config = load_config_from_path(Some(file.path().to_path_buf())).unwrap();

        assert_eq!(config.router.health.window_size, 50);
        assert_eq!(config.router.health.min_samples, 5);
        assert_eq!(config.router.health.cooldown_ms, 1000);
        assert!(!config.router.load_shed.enabled);
        assert_eq!(config.router.load_shed.open_circuit_fraction, 0.75);
        assert_eq!(config.router.load_shed.sample_horizon_ms, 5000);
        assert_eq!(config.router.resolver.attempt_timeout_ms, 2000);
        assert!(config.router.reject_dangling_references);
        assert_eq!(config.fallback_map["gpt-4"], vec!["claude-haiku".to_string()]);
        assert_eq!(config.models.len(), 2);
        assert_eq!(config.models[1].provider.kind(), "anthropic");
        assert_eq!(config.routes[0].strategy, Strategy::WeightedRoundRobin);
        assert_eq!(config.routes[0].models[1].weight, 1.0);
        assert_eq!(config.source(), ConfigSource::File);
    }

    #[test]
    fn test_parse_empty_toml() {
        let file = write_config("");
        let config = load_config_from_path(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.router, RouterConfig::default());
        assert!(config.config_file_path.is_some());
    }

    #[test]
    fn test_missing_file_graceful() {
        let config =
            load_config_from_path(Some(PathBuf::from("/nonexistent/modelgate/gateway.toml")))
                .unwrap();
        assert!(config.config_file_path.is_none());
    }

    #[test]
    fn test_malformed_toml_error() {
        let file = write_config("[health\nwindow_size = ");
        let result = load_config_from_path(Some(file.path().to_path_buf()));
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_unknown_provider_type_rejected() {
        let file = write_config(
            r#"
[[models]]
name = "x"
provider = { type = "carrier-pigeon" }
"#,
        );
        let result = load_config_from_path(Some(file.path().to_path_buf()));
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_out_of_range_threshold_rejected() {
        let file = write_config("[circuit_breaker]\nerror_rate_threshold = 1.5\n");
        let result = load_config_from_path(Some(file.path().to_path_buf()));
        assert!(matches!(result, Err(ConfigError::ValidationError(ref m)) if m.contains("error_rate_threshold")));
    }

    #[test]
    fn test_zero_window_rejected() {
        let mut config = GatewayConfigFile::default();
        config.router.health.window_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_sample_horizon_rejected() {
        let file = write_config("[load_shed]\nsample_horizon_ms = 0\n");
        let result = load_config_from_path(Some(file.path().to_path_buf()));
        assert!(matches!(result, Err(ConfigError::ValidationError(ref m)) if m.contains("sample_horizon_ms")));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = GatewayConfigFile::default();
        apply_env_config(
            &mut config,
            env(&[
                ("MODELGATE_COOLDOWN_MS", "500"),
                ("MODELGATE_LOAD_SHED", "false"),
                ("MODELGATE_ATTEMPT_TIMEOUT_MS", "not-a-number"),
            ]),
        );

        assert_eq!(config.router.health.cooldown_ms, 500);
        assert!(!config.router.load_shed.enabled);
        assert_eq!(config.router.resolver.attempt_timeout_ms, 60_000);
        assert_eq!(config.source(), ConfigSource::Env);
    }

    #[test]
    fn test_no_env_keeps_source() {
        let mut config = GatewayConfigFile::default();
        apply_env_config(&mut config, env(&[]));
        assert_eq!(config.source(), ConfigSource::Default);
    }

    #[test]
    fn test_cli_overrides_env() {
        let mut config = GatewayConfigFile::default();
        apply_env_config(&mut config, env(&[("MODELGATE_COOLDOWN_MS", "500")]));

        ConfigOverrides::new()
            .with_cooldown_ms(50)
            .with_reject_dangling_references(true)
            .apply(&mut config);

        assert_eq!(config.router.health.cooldown_ms, 50);
        assert!(config.router.reject_dangling_references);
        assert_eq!(config.source(), ConfigSource::Cli);
    }

    #[test]
    fn test_config_overrides_empty_no_change() {
        let mut config = GatewayConfigFile::default();
        ConfigOverrides::new().apply(&mut config);
        assert_eq!(config.source(), ConfigSource::Default);
    }

    #[test]
    fn test_install_into_gateway() {
        let file = write_config(
            r#"
[fallback.map]
"smart" = ["ghost"]

[[routes]]
id = "r1"
slug = "smart"
models = [{ model_name = "gpt-4" }]
"#,
        );
        let config = load_config_from_path(Some(file.path().to_path_buf())).unwrap();
        let gateway = ModelGateway::new(config.router.clone());

        let warnings = config.install(&gateway).unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].missing, "ghost");
        assert!(gateway.registry().get_by_slug("smart").is_some());
    }

    #[test]
    fn test_install_rejects_duplicate_slug() {
        let mut config = GatewayConfigFile::default();
        config.routes = vec![
            Route::new("r1", "chat").with_model(crate::routing::RouteModel::new("a")),
            Route::new("r2", "chat").with_model(crate::routing::RouteModel::new("b")),
        ];
        let gateway = ModelGateway::new(config.router.clone());
        assert!(matches!(
            config.install(&gateway),
            Err(ConfigError::RoutingError(RegistryError::DuplicateSlug { .. }))
        ));
    }

    #[test]
    fn test_config_source_display() {
        assert_eq!(ConfigSource::Cli.to_string(), "CLI");
        assert_eq!(ConfigSource::Env.to_string(), "environment");
        assert_eq!(ConfigSource::File.to_string(), "config file");
        assert_eq!(ConfigSource::Default.to_string(), "default");
    }
}
