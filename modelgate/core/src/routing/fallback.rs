//! Fallback Graph
//!
//! Global mapping from a primary model (or route slug) to the ordered list of
//! models tried once a route's own candidates are exhausted.
//!
//! # Architecture
//!
//! ```text
//! admin update ──> FallbackGraph::build() ──> cycle DFS + dangling check
//!                                                  │
//!                          rejected <──── Err ─────┤
//!                                                  │ Ok
//!                                                  v
//!                           FallbackStore::publish() (ArcSwap store)
//!                                                  │
//! request path ──> FallbackStore::current() ──> resolve_chain()   (lock-free)
//! ```
//!
//! Validation runs on write only. The request path reads an immutable
//! snapshot, so an update never blocks or tears an in-flight resolution.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Serialize;
use thiserror::Error;

/// Model name (or route slug) to ordered fallback model names
pub type FallbackMap = BTreeMap<String, Vec<String>>;

// ============================================================================
// Errors
// ============================================================================

/// A fallback entry that names an unregistered model
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DanglingReference {
    /// Map key whose list holds the reference
    pub from: String,

    /// The unregistered model name
    pub missing: String,
}

impl std::fmt::Display for DanglingReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "fallback for '{}' references unregistered model '{}'",
            self.from, self.missing
        )
    }
}

/// Errors raised while validating a fallback map
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum FallbackError {
    /// The map contains a cycle; `path` starts and ends on the same node
    #[error("fallback cycle detected: {}", path.join(" -> "))]
    Cycle {
        /// Nodes along the cycle
        path: Vec<String>,
    },

    /// A referenced model is not registered (strict mode only)
    #[error("{0}")]
    DanglingReference(DanglingReference),
}

// ============================================================================
// Validation
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    OnPath,
    Done,
}

/// Depth-first search from every node; a back-edge to a node still on the
/// current path is a cycle.
fn find_cycle(map: &FallbackMap) -> Option<Vec<String>> {
    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut path: Vec<&str> = Vec::new();

    for start in map.keys() {
        if marks.contains_key(start.as_str()) {
            continue;
        }

        // Stack of (node, index of next child to visit)
        let mut stack: Vec<(&str, usize)> = vec![(start.as_str(), 0)];
        marks.insert(start.as_str(), Mark::OnPath);
        path.push(start.as_str());

        while let Some(&(node, next_child)) = stack.last() {
            let children = map.get(node).map(Vec::as_slice).unwrap_or(&[]);
            if let Some(child) = children.get(next_child) {
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }
                match marks.get(child.as_str()).copied() {
                    Some(Mark::OnPath) => {
                        let from = path.iter().position(|n| *n == child.as_str()).unwrap_or(0);
                        let mut cycle: Vec<String> =
                            path[from..].iter().map(|n| (*n).to_string()).collect();
                        cycle.push(child.clone());
                        return Some(cycle);
                    }
                    Some(Mark::Done) => {}
                    None => {
                        marks.insert(child.as_str(), Mark::OnPath);
                        path.push(child.as_str());
                        stack.push((child.as_str(), 0));
                    }
                }
            } else {
                marks.insert(node, Mark::Done);
                path.pop();
                stack.pop();
            }
        }
    }

    None
}

fn find_dangling(map: &FallbackMap, registered: &HashSet<String>) -> Vec<DanglingReference> {
    map.iter()
        .flat_map(|(from, fallbacks)| {
            fallbacks
                .iter()
                .filter(|m| !registered.contains(*m))
                .map(move |m| DanglingReference {
                    from: from.clone(),
                    missing: m.clone(),
                })
        })
        .collect()
}

/// Validate `map` without building a graph.
///
/// Cycles and self-loops are always errors. Dangling references are returned
/// as warnings unless `reject_dangling` is set, in which case the first one is
/// an error. Pure: validating the same map twice gives the same result.
pub fn validate(
    map: &FallbackMap,
    registered: &HashSet<String>,
    reject_dangling: bool,
) -> Result<Vec<DanglingReference>, FallbackError> {
    if let Some(path) = find_cycle(map) {
        return Err(FallbackError::Cycle { path });
    }

    let dangling = find_dangling(map, registered);
    if reject_dangling {
        if let Some(first) = dangling.into_iter().next() {
            return Err(FallbackError::DanglingReference(first));
        }
        return Ok(Vec::new());
    }
    Ok(dangling)
}

// ============================================================================
// Fallback Graph
// ============================================================================

/// A validated, immutable fallback map
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FallbackGraph {
    map: FallbackMap,
    version: u64,
}

impl FallbackGraph {
    /// Graph with no entries
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Validate `map` and build a graph from it, returning any tolerated
    /// dangling references alongside.
    pub fn build(
        map: FallbackMap,
        registered: &HashSet<String>,
        reject_dangling: bool,
    ) -> Result<(Self, Vec<DanglingReference>), FallbackError> {
        let warnings = validate(&map, registered, reject_dangling)?;
        Ok((Self { map, version: 0 }, warnings))
    }

    /// Configured fallbacks for `primary`, verbatim
    #[must_use]
    pub fn chain(&self, primary: &str) -> &[String] {
        self.map.get(primary).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Fallbacks for `primary` in configured order, minus duplicates and
    /// anything in `already_tried`. Unknown keys yield an empty chain.
    #[must_use]
    pub fn resolve_chain(&self, primary: &str, already_tried: &[&str]) -> Vec<String> {
        let mut seen: HashSet<&str> = already_tried.iter().copied().collect();
        self.chain(primary)
            .iter()
            .filter(|m| seen.insert(m.as_str()))
            .cloned()
            .collect()
    }

    /// Whether `primary` has an entry
    #[must_use]
    pub fn contains(&self, primary: &str) -> bool {
        self.map.contains_key(primary)
    }

    /// The underlying map
    pub fn map(&self) -> &FallbackMap {
        &self.map
    }

    /// Publication counter; 0 for a graph never published
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Summary numbers for dashboards
    pub fn stats(&self) -> FallbackStats {
        FallbackStats {
            entries: self.map.len(),
            edges: self.map.values().map(Vec::len).sum(),
            longest_chain: self.map.values().map(Vec::len).max().unwrap_or(0),
            version: self.version,
        }
    }
}

/// Statistics about the active fallback map
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FallbackStats {
    /// Number of keys
    pub entries: usize,

    /// Total fallback references
    pub edges: usize,

    /// Longest single fallback list
    pub longest_chain: usize,

    /// Publication counter
    pub version: u64,
}

// ============================================================================
// Snapshot Publication
// ============================================================================

/// Holds the active [`FallbackGraph`] and swaps it atomically on update
#[derive(Debug)]
pub struct FallbackStore {
    current: ArcSwap<FallbackGraph>,
}

impl FallbackStore {
    /// Store holding an empty graph
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(FallbackGraph::empty()),
        }
    }

    /// Active snapshot
    pub fn current(&self) -> Arc<FallbackGraph> {
        self.current.load_full()
    }

    /// Validate and publish `map`. On error the previous graph stays active.
    pub fn publish(
        &self,
        map: FallbackMap,
        registered: &HashSet<String>,
        reject_dangling: bool,
    ) -> Result<Vec<DanglingReference>, FallbackError> {
        let (mut graph, warnings) = match FallbackGraph::build(map, registered, reject_dangling) {
            Ok(built) => built,
            Err(e) => {
                tracing::warn!(error = %e, "Rejected fallback map update");
                return Err(e);
            }
        };

        for warning in &warnings {
            tracing::warn!(from = %warning.from, missing = %warning.missing, "Dangling fallback reference");
        }

        // Admin updates are serialized by the registry, so load-then-store
        // does not race with another publisher.
        graph.version = self.current.load().version + 1;
        tracing::info!(
            version = graph.version,
            entries = graph.map.len(),
            "Published fallback map"
        );
        self.current.store(Arc::new(graph));
        Ok(warnings)
    }
}

impl Default for FallbackStore {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
