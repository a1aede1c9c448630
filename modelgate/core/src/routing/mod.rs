#![allow(missing_docs)]
//! Model Routing and Failover
//!
//! Picks a backend instance for every inbound request, honors each route's
//! traffic-shaping strategy, and recovers from instance failures through
//! fallback chains while tracking per-instance health.
//!
//! # Architecture
//!
//! ```text
//! +------------------+
//! |   ModelGateway   |  <-- Entry point for all requests
//! +--------+---------+
//!          |
//!          v
//! +------------------+
//! |  LoadShedGuard   |  <-- Rejects new work when most backends are degraded
//! +--------+---------+
//!          |
//!          v
//! +------------------+      +------------------+
//! |  RouteResolver   | ---> |  FallbackGraph   |  <-- Validated, swapped atomically
//! +--------+---------+      +------------------+
//!          |
//!          v
//! +------------------+      +-----------------------+
//! | StrategySelector | ---> | InstanceHealthTracker |  <-- Rolling window + circuit breaker
//! +------------------+      +-----------------------+
//! ```
//!
//! # Design Principles
//!
//! 1. **Per-Instance Contention**: health updates lock one instance, never the world
//! 2. **Lock-Free Reads**: the fallback map is validated on write and read as a snapshot
//! 3. **Bounded Resolution**: every candidate is attempted at most once per request
//! 4. **Lazy Timers**: cooldowns are compared against a monotonic clock on access

pub mod config;
pub mod fallback;
pub mod health;
pub mod load_shed;
pub mod metrics;
pub mod registry;
pub mod resolver;
pub mod router;
pub mod stats;
pub mod strategy;

#[cfg(test)]
pub mod test_utils;

pub use config::*;
pub use fallback::*;
pub use health::*;
pub use load_shed::*;
pub use registry::*;
pub use resolver::*;
pub use router::*;
pub use stats::*;
pub use strategy::*;
