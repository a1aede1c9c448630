//! modelgate Core - Model Routing and Failover for an LLM Gateway
//!
//! For every inbound chat/completion request this crate picks one of several
//! backend model instances, honors the route's traffic-shaping strategy, and
//! recovers from instance failures via fallback chains, all while tracking
//! per-instance health so unhealthy or overloaded instances are avoided.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │             Collaborators (out of process scope)             │
//! │   Admin API      Persistence      Billing      Providers     │
//! └──────┬───────────────┬──────────────┬─────────────┬──────────┘
//!        │ mutations     │ config       │ usage       │ invoke
//! ┌──────┴───────────────┴──────────────┴─────────────┴──────────┐
//! │                        MODELGATE CORE                         │
//! │  ┌─────────────┐  ┌─────────────┐  ┌──────────────────────┐  │
//! │  │  Registry   │  │  Resolver   │  │  Health / LoadShed   │  │
//! │  │  + Fallback │  │  + Strategy │  │  + Stats / Metrics   │  │
//! │  └─────────────┘  └─────────────┘  └──────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`ModelGateway`]: request entry point owning all shared routing state
//! - [`RouteResolver`]: one request through route models and fallbacks
//! - [`InstanceInvoker`]: the opaque "call model instance X" collaborator
//! - [`InstanceHealthTracker`]: rolling health window and circuit breaker
//! - [`RouteRegistry`]: routes, registered instances and the fallback map
//!
//! # Quick Start
//!
//! ```ignore
//! use modelgate_core::{load_config, ModelGateway, RequestContext};
//!
//! let config = load_config()?;
//! let gateway = ModelGateway::new(config.router.clone());
//! config.install(&gateway)?;
//!
//! let resolution = gateway.handle("smart", &RequestContext::new(), &invoker).await?;
//! println!("served by {}", resolution.model);
//! ```
//!
//! # Module Overview
//!
//! - [`routing`]: selection, health, fallback, resolution, load shedding
//! - [`config`]: TOML + environment configuration loading

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod routing;

// Routing exports
pub use routing::{
    AttemptFailure, AttemptRecord, AttemptStage, CircuitState, FallbackError, FallbackGraph,
    FallbackMap, GatewayError, InstanceHealth, InstanceHealthTracker, InstanceInvoker,
    InvocationError, LoadShedDecision, LoadShedGuard, ModelGateway, ModelInstance,
    ProviderConfig, RegistryError, RequestContext, Resolution, ResolveError, Route, RouteModel,
    RouteRegistry, RouteResolver, RouteSource, RouteStats, RouterConfig, SelectionError,
    Strategy, StrategySelector,
};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, GatewayConfigFile, GatewayToml,
};
