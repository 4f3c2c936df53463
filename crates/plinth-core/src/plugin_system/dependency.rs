use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;

use crate::plugin_system::descriptor::PluginDescriptor;

/// Why a descriptor could not be placed in the load order
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DependencyError {
    /// A required plugin is not among the known descriptors at all
    #[error("Required plugin not found: {0}")]
    MissingPlugin(String),

    /// The descriptor lies on a dependency cycle
    #[error("Circular dependency detected: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),

    /// The descriptor only waits on other descriptors that are themselves unresolved
    #[error("Depends on unresolved plugins: {}", .0.join(", "))]
    UnresolvedDependency(Vec<String>),
}

/// A descriptor left out of the load order, with the reason
#[derive(Debug, Clone)]
pub struct UnresolvedDescriptor {
    pub descriptor: Arc<PluginDescriptor>,
    pub error: DependencyError,
}

/// Outcome of ordering a set of descriptors
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Dependency-before-dependent order
    pub ordered: Vec<Arc<PluginDescriptor>>,
    /// Descriptors excluded from `ordered`, in discovery order
    pub unresolved: Vec<UnresolvedDescriptor>,
}

impl Resolution {
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }

    pub fn package_names(&self) -> Vec<&str> {
        self.ordered.iter().map(|d| d.package_name()).collect()
    }
}

/// Orders descriptors so that every plugin follows the plugins it depends on.
#[derive(Debug, Clone, Default)]
pub struct DependencyResolver {
    satisfied: HashSet<String>,
}

impl DependencyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Treat these package names as already available (e.g. plugins loaded
    /// by an earlier batch).
    pub fn with_satisfied<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.satisfied.extend(names.into_iter().map(Into::into));
        self
    }

    /// Repeated-pass topological sort.
    ///
    /// Each pass walks the remaining descriptors in discovery order and
    /// appends every one whose dependencies are all available; a descriptor
    /// placed earlier in the same pass counts as available. Passes stop once
    /// one makes no progress, and whatever remains is diagnosed.
    pub fn resolve(&self, descriptors: &[Arc<PluginDescriptor>]) -> Resolution {
        let mut available: HashSet<String> = self.satisfied.clone();
        let mut remaining: Vec<Arc<PluginDescriptor>> = descriptors.to_vec();
        let mut ordered = Vec::with_capacity(descriptors.len());

        loop {
            let before = remaining.len();
            remaining.retain(|descriptor| {
                let ready = descriptor
                    .dependencies()
                    .iter()
                    .all(|dep| available.contains(dep));
                if ready {
                    available.insert(descriptor.package_name().to_string());
                    ordered.push(Arc::clone(descriptor));
                }
                !ready
            });
            if remaining.is_empty() || remaining.len() == before {
                break;
            }
        }

        let unresolved = diagnose(&remaining, &available);
        if !unresolved.is_empty() {
            log::debug!(
                "Dependency resolution left {} plugin(s) unresolved: {:?}",
                unresolved.len(),
                unresolved.iter().map(|u| u.descriptor.package_name()).collect::<Vec<_>>()
            );
        }
        Resolution { ordered, unresolved }
    }
}

/// Explain each leftover descriptor: a missing plugin, a cycle it sits on,
/// or a dependency on other leftovers.
fn diagnose(remaining: &[Arc<PluginDescriptor>], available: &HashSet<String>) -> Vec<UnresolvedDescriptor> {
    let pending: HashMap<&str, &Arc<PluginDescriptor>> = remaining
        .iter()
        .map(|d| (d.package_name(), d))
        .collect();

    remaining
        .iter()
        .map(|descriptor| {
            let missing = descriptor
                .dependencies()
                .iter()
                .find(|dep| !available.contains(*dep) && !pending.contains_key(dep.as_str()));

            let error = if let Some(missing) = missing {
                DependencyError::MissingPlugin(missing.clone())
            } else if let Some(cycle) = find_cycle(descriptor.package_name(), &pending) {
                DependencyError::CyclicDependency(cycle)
            } else {
                DependencyError::UnresolvedDependency(
                    descriptor
                        .dependencies()
                        .iter()
                        .filter(|dep| pending.contains_key(dep.as_str()))
                        .cloned()
                        .collect(),
                )
            };
            UnresolvedDescriptor { descriptor: Arc::clone(descriptor), error }
        })
        .collect()
}

/// Depth-first search for a path leading from `start` back to itself,
/// following only pending descriptors. Returns `start -> ... -> start`.
fn find_cycle(start: &str, pending: &HashMap<&str, &Arc<PluginDescriptor>>) -> Option<Vec<String>> {
    fn visit<'a>(
        current: &'a str,
        start: &str,
        pending: &HashMap<&'a str, &'a Arc<PluginDescriptor>>,
        visited: &mut HashSet<&'a str>,
        path: &mut Vec<&'a str>,
    ) -> bool {
        let Some(descriptor) = pending.get(current) else {
            return false;
        };
        path.push(current);
        for dep in descriptor.dependencies() {
            if dep == start {
                return true;
            }
            let Some((&key, _)) = pending.get_key_value(dep.as_str()) else {
                continue;
            };
            if visited.insert(key) && visit(key, start, pending, visited, path) {
                return true;
            }
        }
        path.pop();
        false
    }

    let mut visited = HashSet::new();
    let mut path = Vec::new();
    if visit(start, start, pending, &mut visited, &mut path) {
        let mut cycle: Vec<String> = path.iter().map(|s| s.to_string()).collect();
        cycle.push(start.to_string());
        Some(cycle)
    } else {
        None
    }
}
