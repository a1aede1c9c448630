//! Route Registry
//!
//! The in-memory mutation surface the admin layer drives: routes, registered
//! model instances and the global fallback map. Persistence lives elsewhere;
//! this registry only enforces the invariants and publishes snapshots the
//! request path reads.
//!
//! Route invariants:
//! - `slug` is globally unique
//! - `slug` cannot change while the stored route is enabled
//! - `source = system` routes cannot be updated or deleted
//! - an enabled route has at least one model
//! - weights are finite and non-negative

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use super::config::{ModelInstance, Route, RouteSource};
use super::fallback::{DanglingReference, FallbackError, FallbackGraph, FallbackMap, FallbackStore};

/// Registry mutation failures
#[derive(Clone, Debug, PartialEq, Error)]
pub enum RegistryError {
    /// Another route already uses the slug
    #[error("slug '{slug}' is already used by route '{existing}'")]
    DuplicateSlug {
        /// Conflicting slug
        slug: String,
        /// Route that owns it
        existing: String,
    },

    /// A route with the id already exists
    #[error("route '{0}' already exists")]
    DuplicateRouteId(String),

    /// No route with the id
    #[error("route '{0}' not found")]
    RouteNotFound(String),

    /// System routes are read-only
    #[error("route '{0}' is a system route and cannot be modified")]
    SystemRoute(String),

    /// Slug change attempted on an enabled route
    #[error("cannot change slug of enabled route '{id}' from '{from}' to '{to}'")]
    SlugImmutable {
        /// Route id
        id: String,
        /// Stored slug
        from: String,
        /// Requested slug
        to: String,
    },

    /// Enabled route without models
    #[error("enabled route '{0}' must have at least one model")]
    EmptyRoute(String),

    /// Negative, NaN or infinite weight
    #[error("route '{slug}' model '{model}' has invalid weight {weight}")]
    InvalidWeight {
        /// Route slug
        slug: String,
        /// Model name
        model: String,
        /// Offending weight
        weight: f64,
    },

    /// Malformed route record
    #[error("invalid route: {0}")]
    InvalidRoute(String),

    /// No registered model with the name
    #[error("model '{0}' is not registered")]
    ModelNotFound(String),

    /// Fallback map rejected
    #[error(transparent)]
    Fallback(#[from] FallbackError),
}

#[derive(Debug, Default)]
struct RouteTable {
    by_id: HashMap<String, Arc<Route>>,
    id_by_slug: HashMap<String, String>,
}

impl RouteTable {
    fn slug_owner(&self, slug: &str) -> Option<&String> {
        self.id_by_slug.get(slug)
    }
}

fn validate_route(route: &Route) -> Result<(), RegistryError> {
    if route.id.trim().is_empty() {
        return Err(RegistryError::InvalidRoute("route id is empty".into()));
    }
    if route.slug.trim().is_empty() {
        return Err(RegistryError::InvalidRoute(format!(
            "route '{}' has an empty slug",
            route.id
        )));
    }
    if route.enabled && route.models.is_empty() {
        return Err(RegistryError::EmptyRoute(route.slug.clone()));
    }
    for model in &route.models {
        if !model.weight.is_finite() || model.weight < 0.0 {
            return Err(RegistryError::InvalidWeight {
                slug: route.slug.clone(),
                model: model.model_name.clone(),
                weight: model.weight,
            });
        }
    }
    Ok(())
}

/// Routes, registered instances and the fallback map
#[derive(Debug)]
pub struct RouteRegistry {
    routes: RwLock<RouteTable>,
    models: RwLock<BTreeMap<String, ModelInstance>>,
    fallbacks: Arc<FallbackStore>,
    reject_dangling: bool,
    /// Serializes admin mutations
    admin: Mutex<()>,
}

impl RouteRegistry {
    /// Empty registry publishing fallback snapshots to `fallbacks`
    pub fn new(fallbacks: Arc<FallbackStore>, reject_dangling: bool) -> Self {
        Self {
            routes: RwLock::new(RouteTable::default()),
            models: RwLock::new(BTreeMap::new()),
            fallbacks,
            reject_dangling,
            admin: Mutex::new(()),
        }
    }

    // ------------------------------------------------------------------------
    // Routes
    // ------------------------------------------------------------------------

    /// Add a route
    pub fn create_route(&self, route: Route) -> Result<Arc<Route>, RegistryError> {
        let _admin = self.admin.lock();
        validate_route(&route)?;
        self.warn_unregistered(&route);

        let mut table = self.routes.write();
        if table.by_id.contains_key(&route.id) {
            return Err(RegistryError::DuplicateRouteId(route.id));
        }
        if let Some(existing) = table.slug_owner(&route.slug) {
            return Err(RegistryError::DuplicateSlug {
                slug: route.slug,
                existing: existing.clone(),
            });
        }

        let route = Arc::new(route);
        table.id_by_slug.insert(route.slug.clone(), route.id.clone());
        table.by_id.insert(route.id.clone(), route.clone());
        tracing::info!(route = %route.slug, id = %route.id, strategy = %route.strategy, "Route created");
        Ok(route)
    }

    /// Replace the route with the same id
    pub fn update_route(&self, route: Route) -> Result<Arc<Route>, RegistryError> {
        let _admin = self.admin.lock();
        validate_route(&route)?;

        let mut table = self.routes.write();
        let existing = table
            .by_id
            .get(&route.id)
            .cloned()
            .ok_or_else(|| RegistryError::RouteNotFound(route.id.clone()))?;

        if existing.source == RouteSource::System {
            return Err(RegistryError::SystemRoute(route.id));
        }

        if existing.slug != route.slug {
            if existing.enabled {
                return Err(RegistryError::SlugImmutable {
                    id: route.id,
                    from: existing.slug.clone(),
                    to: route.slug,
                });
            }
            if let Some(owner) = table.slug_owner(&route.slug) {
                return Err(RegistryError::DuplicateSlug {
                    slug: route.slug,
                    existing: owner.clone(),
                });
            }
            table.id_by_slug.remove(&existing.slug);
            table.id_by_slug.insert(route.slug.clone(), route.id.clone());
        }

        self.warn_unregistered(&route);
        let route = Arc::new(route);
        table.by_id.insert(route.id.clone(), route.clone());
        tracing::info!(route = %route.slug, id = %route.id, enabled = route.enabled, "Route updated");
        Ok(route)
    }

    /// Remove a route.
    ///
    /// Crate-internal: [`ModelGateway::delete_route`](super::router::ModelGateway::delete_route)
    /// is the public entry point and also drops the route's cursor and stats.
    pub(crate) fn delete_route(&self, id: &str) -> Result<Arc<Route>, RegistryError> {
        let _admin = self.admin.lock();
        let mut table = self.routes.write();

        match table.by_id.get(id) {
            None => return Err(RegistryError::RouteNotFound(id.to_string())),
            Some(route) if route.source == RouteSource::System => {
                return Err(RegistryError::SystemRoute(id.to_string()));
            }
            Some(_) => {}
        }

        let route = table
            .by_id
            .remove(id)
            .ok_or_else(|| RegistryError::RouteNotFound(id.to_string()))?;
        table.id_by_slug.remove(&route.slug);
        tracing::info!(route = %route.slug, id = %route.id, "Route deleted");
        Ok(route)
    }

    /// Look up a route by its client-facing slug
    pub fn get_by_slug(&self, slug: &str) -> Option<Arc<Route>> {
        let table = self.routes.read();
        let id = table.id_by_slug.get(slug)?;
        table.by_id.get(id).cloned()
    }

    /// Look up a route by id
    pub fn get(&self, id: &str) -> Option<Arc<Route>> {
        self.routes.read().by_id.get(id).cloned()
    }

    /// All routes, sorted by slug
    pub fn routes(&self) -> Vec<Arc<Route>> {
        let mut routes: Vec<Arc<Route>> = self.routes.read().by_id.values().cloned().collect();
        routes.sort_by(|a, b| a.slug.cmp(&b.slug));
        routes
    }

    /// Number of routes
    pub fn route_count(&self) -> usize {
        self.routes.read().by_id.len()
    }

    fn warn_unregistered(&self, route: &Route) {
        let models = self.models.read();
        if models.is_empty() {
            return;
        }
        for entry in &route.models {
            if !models.contains_key(&entry.model_name) {
                tracing::warn!(
                    route = %route.slug,
                    model = %entry.model_name,
                    "Route references unregistered model"
                );
            }
        }
    }

    // ------------------------------------------------------------------------
    // Model Instances
    // ------------------------------------------------------------------------

    /// Register (or replace) a model instance
    pub fn register_model(&self, instance: ModelInstance) {
        let _admin = self.admin.lock();
        tracing::info!(model = %instance.name, provider = instance.provider.kind(), "Model registered");
        self.models.write().insert(instance.name.clone(), instance);
    }

    /// Unregister a model instance. References to it become dangling.
    pub fn remove_model(&self, name: &str) -> Result<ModelInstance, RegistryError> {
        let _admin = self.admin.lock();
        let removed = self
            .models
            .write()
            .remove(name)
            .ok_or_else(|| RegistryError::ModelNotFound(name.to_string()))?;

        let referenced = self.routes.read().by_id.values().any(|r| r.contains_model(name))
            || self
                .fallbacks
                .current()
                .map()
                .values()
                .any(|chain| chain.iter().any(|m| m == name));
        if referenced {
            tracing::warn!(model = %name, "Removed model is still referenced");
        } else {
            tracing::info!(model = %name, "Model removed");
        }
        Ok(removed)
    }

    /// Registered instance by name
    pub fn model(&self, name: &str) -> Option<ModelInstance> {
        self.models.read().get(name).cloned()
    }

    /// All registered instances, sorted by name
    pub fn models(&self) -> Vec<ModelInstance> {
        self.models.read().values().cloned().collect()
    }

    /// Provider kind of a registered instance
    pub fn provider_kind(&self, name: &str) -> Option<&'static str> {
        self.models.read().get(name).map(|m| m.provider.kind())
    }

    /// Names of all registered instances
    pub fn registered_names(&self) -> HashSet<String> {
        self.models.read().keys().cloned().collect()
    }

    // ------------------------------------------------------------------------
    // Fallback Map
    // ------------------------------------------------------------------------

    /// Validate and publish a new global fallback map.
    ///
    /// Returns tolerated dangling references. On error the previous map stays
    /// active.
    pub fn set_fallback_map(&self, map: FallbackMap) -> Result<Vec<DanglingReference>, RegistryError> {
        let _admin = self.admin.lock();
        let registered = self.registered_names();
        Ok(self.fallbacks.publish(map, &registered, self.reject_dangling)?)
    }

    /// Active fallback snapshot
    pub fn fallbacks(&self) -> Arc<FallbackGraph> {
        self.fallbacks.current()
    }
}
