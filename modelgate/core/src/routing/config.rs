//! Routing Configuration
//!
//! Route records, registered model instances, and the policy knobs for
//! health tracking, circuit breaking, load shedding and resolution.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ============================================================================
// Selection Strategy
// ============================================================================

/// Traffic-shaping strategy used to pick the first candidate of a route
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Highest `priority` wins, ties broken by latency then list order
    #[default]
    Priority,
    /// Lowest observed average latency wins
    LeastLatency,
    /// Selection frequency proportional to `weight`
    WeightedRoundRobin,
    /// Uniform pick among eligible entries
    Random,
}

impl Strategy {
    /// Wire name of the strategy
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Priority => "priority",
            Self::LeastLatency => "least-latency",
            Self::WeightedRoundRobin => "weighted-round-robin",
            Self::Random => "random",
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who owns a route record
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteSource {
    /// Shipped with the gateway; immutable through the admin surface
    System,
    /// Created by an operator
    #[default]
    User,
}

// ============================================================================
// Routes
// ============================================================================

fn default_weight() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

/// One candidate instance within a route
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RouteModel {
    /// Registered model instance name (opaque key)
    pub model_name: String,

    /// Weighted-round-robin share; 0 disables selection on that path only
    #[serde(default = "default_weight")]
    pub weight: f64,

    /// Higher = preferred under the priority strategy
    #[serde(default)]
    pub priority: i32,

    /// Disabled entries are never candidates
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl RouteModel {
    /// Create an enabled entry with weight 1 and priority 0
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            weight: default_weight(),
            priority: 0,
            enabled: true,
        }
    }

    /// Set the weighted-round-robin weight
    #[must_use]
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// Set the priority
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Enable or disable the entry
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// A client-facing virtual model that fans out to real instances
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Route {
    /// Stable identifier
    pub id: String,

    /// Display name
    #[serde(default)]
    pub name: String,

    /// Client-facing model alias, globally unique
    pub slug: String,

    /// Free-form description
    #[serde(default)]
    pub description: String,

    /// Selection strategy for the route's own models
    #[serde(default)]
    pub strategy: Strategy,

    /// Disabled routes fail fast with `RouteDisabled`
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Ownership of the record
    #[serde(default)]
    pub source: RouteSource,

    /// Candidate pool, owned by the route
    #[serde(default)]
    pub models: Vec<RouteModel>,

    /// Ordered models tried after every route model failed
    #[serde(default)]
    pub fallback_models: Vec<String>,
}

impl Route {
    /// Create an enabled, user-owned route with no models
    pub fn new(id: impl Into<String>, slug: impl Into<String>) -> Self {
        let slug = slug.into();
        Self {
            id: id.into(),
            name: slug.clone(),
            slug,
            description: String::new(),
            strategy: Strategy::default(),
            enabled: true,
            source: RouteSource::User,
            models: Vec::new(),
            fallback_models: Vec::new(),
        }
    }

    /// Set the strategy
    #[must_use]
    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Append a candidate
    #[must_use]
    pub fn with_model(mut self, model: RouteModel) -> Self {
        self.models.push(model);
        self
    }

    /// Set the route-level fallback list
    #[must_use]
    pub fn with_fallbacks<I, S>(mut self, fallbacks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fallback_models = fallbacks.into_iter().map(Into::into).collect();
        self
    }

    /// Enable or disable the route
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the ownership source
    #[must_use]
    pub fn with_source(mut self, source: RouteSource) -> Self {
        self.source = source;
        self
    }

    /// Entries with `enabled == true`, in configured order
    pub fn enabled_models(&self) -> impl Iterator<Item = &RouteModel> {
        self.models.iter().filter(|m| m.enabled)
    }

    /// First enabled model, the key used for global fallback lookup when the
    /// slug itself has no fallback entry
    #[must_use]
    pub fn primary_model(&self) -> Option<&str> {
        self.enabled_models().next().map(|m| m.model_name.as_str())
    }

    /// Whether `model_name` is one of the route's own entries
    #[must_use]
    pub fn contains_model(&self, model_name: &str) -> bool {
        self.models.iter().any(|m| m.model_name == model_name)
    }
}

// ============================================================================
// Registered Model Instances
// ============================================================================

/// Provider-specific connection settings.
///
/// Only the dialing collaborator matches on this; the routing core treats the
/// instance name as an opaque key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProviderConfig {
    /// OpenAI or an OpenAI-compatible API
    #[serde(rename = "openai")]
    OpenAi {
        /// Override for the API base URL
        #[serde(default)]
        base_url: Option<String>,
        /// Environment variable holding the API key
        api_key_env: String,
        /// Optional organization header
        #[serde(default)]
        organization: Option<String>,
    },
    /// Anthropic API
    Anthropic {
        /// Environment variable holding the API key
        api_key_env: String,
        /// API version header
        #[serde(default)]
        api_version: Option<String>,
    },
    /// Azure OpenAI deployment
    Azure {
        /// Resource endpoint
        endpoint: String,
        /// Deployment name
        deployment: String,
        /// Environment variable holding the API key
        api_key_env: String,
        /// API version query parameter
        api_version: String,
    },
    /// Local Ollama instance
    Ollama {
        /// Host name
        host: String,
        /// Port
        port: u16,
    },
    /// Any other HTTP endpoint
    Custom {
        /// Base URL
        base_url: String,
        /// Optional auth header name
        #[serde(default)]
        auth_header: Option<String>,
    },
}

impl ProviderConfig {
    /// Short provider name used in stats output
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::OpenAi { .. } => "openai",
            Self::Anthropic { .. } => "anthropic",
            Self::Azure { .. } => "azure",
            Self::Ollama { .. } => "ollama",
            Self::Custom { .. } => "custom",
        }
    }
}

/// A registered backend model instance
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInstance {
    /// Instance name referenced by routes and fallback maps
    pub name: String,

    /// How the collaborator dials it
    pub provider: ProviderConfig,
}

impl ModelInstance {
    /// Create a registered instance
    pub fn new(name: impl Into<String>, provider: ProviderConfig) -> Self {
        Self {
            name: name.into(),
            provider,
        }
    }
}

// ============================================================================
// Health / Circuit Breaker Configuration
// ============================================================================

/// Configuration for per-instance health tracking and circuit breaking
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Number of most recent outcomes kept per instance
    pub window_size: usize,

    /// Average latency at which the latency penalty saturates
    pub latency_ceiling_ms: f64,

    /// Window samples required before the breaker may open
    pub min_samples: usize,

    /// Windowed error rate (0.0 - 1.0) that must be exceeded to open
    pub error_rate_threshold: f64,

    /// How long an open circuit short-circuits calls
    pub cooldown_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window_size: 100,
            latency_ceiling_ms: 10_000.0,
            min_samples: 10,
            error_rate_threshold: 0.5,
            cooldown_ms: 30_000,
        }
    }
}

impl HealthConfig {
    /// Open-circuit cooldown as a Duration
    #[must_use]
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

// ============================================================================
// Load Shedding Configuration
// ============================================================================

/// Thresholds for the system-wide admission gate
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoadShedConfig {
    /// Master switch
    pub enabled: bool,

    /// Shed when more than this fraction of tracked instances is open
    pub open_circuit_fraction: f64,

    /// Shed when the windowed global error rate exceeds this
    pub error_rate_threshold: f64,

    /// Global window samples required before the error-rate signal counts
    pub min_samples: usize,

    /// Only outcomes younger than this feed the global error rate
    pub sample_horizon_ms: u64,

    /// How long a computed decision is reused
    pub recompute_interval_ms: u64,
}

impl Default for LoadShedConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            open_circuit_fraction: 0.5,
            error_rate_threshold: 0.8,
            min_samples: 20,
            sample_horizon_ms: 10_000,
            recompute_interval_ms: 250,
        }
    }
}

impl LoadShedConfig {
    /// Decision reuse interval as a Duration
    #[must_use]
    pub fn recompute_interval(&self) -> Duration {
        Duration::from_millis(self.recompute_interval_ms)
    }

    /// Error-rate sample horizon as a Duration
    #[must_use]
    pub fn sample_horizon(&self) -> Duration {
        Duration::from_millis(self.sample_horizon_ms)
    }
}

// ============================================================================
// Resolver Configuration
// ============================================================================

/// Per-request resolution settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Upper bound on a single instance invocation
    pub attempt_timeout_ms: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_ms: 60_000,
        }
    }
}

impl ResolverConfig {
    /// Attempt timeout as a Duration
    #[must_use]
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

// ============================================================================
// Full Router Configuration
// ============================================================================

/// Complete policy configuration for the routing engine
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Health window and circuit breaker policy
    pub health: HealthConfig,

    /// Admission gate policy
    pub load_shed: LoadShedConfig,

    /// Resolution loop policy
    pub resolver: ResolverConfig,

    /// Reject fallback maps that reference unregistered models
    pub reject_dangling_references: bool,

    /// How long route traffic events are retained
    pub stats_retention_ms: u64,
}

impl RouterConfig {
    /// Retention period for route traffic events
    #[must_use]
    pub fn stats_retention(&self) -> Duration {
        if self.stats_retention_ms == 0 {
            Duration::from_secs(3600)
        } else {
            Duration::from_millis(self.stats_retention_ms)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_wire_names() {
        let parsed: Vec<Strategy> = serde_json::from_str(
            r#"["priority", "least-latency", "weighted-round-robin", "random"]"#,
        )
        .unwrap();
        assert_eq!(
            parsed,
            vec![
                Strategy::Priority,
                Strategy::LeastLatency,
                Strategy::WeightedRoundRobin,
                Strategy::Random
            ]
        );
        assert_eq!(Strategy::WeightedRoundRobin.to_string(), "weighted-round-robin");
    }

    #[test]
    fn test_route_model_defaults() {
        let model: RouteModel = serde_json::from_str(r#"{"model_name": "gpt-4"}"#).unwrap();
        assert_eq!(model.weight, 1.0);
        assert_eq!(model.priority, 0);
        assert!(model.enabled);
    }

    #[test]
    fn test_primary_model_skips_disabled() {
        let route = Route::new("r1", "chat")
            .with_model(RouteModel::new("gpt-4").with_enabled(false))
            .with_model(RouteModel::new("gpt-3.5"));

        assert_eq!(route.primary_model(), Some("gpt-3.5"));
        assert_eq!(route.enabled_models().count(), 1);
        assert!(route.contains_model("gpt-4"));
    }

    #[test]
    fn test_provider_config_is_tagged() {
        let instance: ModelInstance = serde_json::from_str(
            r#"{"name": "llama", "provider": {"type": "ollama", "host": "localhost", "port": 11434}}"#,
        )
        .unwrap();
        assert_eq!(instance.provider.kind(), "ollama");

        let bad = serde_json::from_str::<ProviderConfig>(r#"{"type": "ollama", "base_url": "x"}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn test_durations() {
        let health = HealthConfig::default();
        assert_eq!(health.cooldown(), Duration::from_secs(30));
        assert_eq!(RouterConfig::default().stats_retention(), Duration::from_secs(3600));
    }
}
