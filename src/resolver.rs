//! Dependency-ordered activation.
//!
//! Produces a total order over the registry in which every app comes after
//! all of its dependencies. Apps with no ordering constraint between them
//! keep their registration order.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};

use crate::error::{HostError, Result};
use crate::registry::AppRegistry;

/// Resolve the activation order of every registered app.
///
/// Fails without returning a partial order if a dependency is not registered
/// or the dependency graph has a cycle.
pub fn resolve_order(registry: &AppRegistry) -> Result<Vec<String>> {
    // Every edge must point at a registered app before ordering starts.
    for entry in registry.all() {
        for dep in entry.depends() {
            if !registry.contains(dep) {
                return Err(HostError::MissingDependency {
                    app: entry.name().to_string(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    let names: Vec<&str> = registry.names().collect();
    let mut pending = vec![0usize; names.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); names.len()];

    for (index, entry) in registry.all().enumerate() {
        let mut seen = HashSet::new();
        for dep in entry.depends() {
            // A repeated dependency is one edge.
            if !seen.insert(dep.as_str()) {
                continue;
            }
            let Some(dep_index) = registry.position(dep) else {
                continue;
            };
            pending[index] += 1;
            dependents[dep_index].push(index);
        }
    }

    // Kahn's algorithm; the min-heap keeps ties in registration order.
    let mut ready: BinaryHeap<Reverse<usize>> = pending
        .iter()
        .enumerate()
        .filter(|(_, count)| **count == 0)
        .map(|(index, _)| Reverse(index))
        .collect();

    let mut order = Vec::with_capacity(names.len());
    while let Some(Reverse(index)) = ready.pop() {
        order.push(names[index].to_string());
        for &dependent in &dependents[index] {
            pending[dependent] -= 1;
            if pending[dependent] == 0 {
                ready.push(Reverse(dependent));
            }
        }
    }

    if order.len() < names.len() {
        let cycle = find_cycle(registry, &pending);
        tracing::error!(cycle = ?cycle, "Dependency cycle between apps");
        return Err(HostError::CyclicDependency(cycle));
    }

    tracing::debug!(order = ?order, "Resolved app activation order");
    Ok(order)
}

/// Every app that depends on `name`, directly or transitively, in resolved
/// order. Apps not in a valid order (missing or cyclic dependencies) fall
/// back to registration order.
pub fn dependents_of(registry: &AppRegistry, name: &str) -> Vec<String> {
    let mut affected: HashSet<&str> = HashSet::new();
    let mut to_check = vec![name];

    while let Some(id) = to_check.pop() {
        for entry in registry.all() {
            if entry.depends().iter().any(|d| d == id) && affected.insert(entry.name()) {
                to_check.push(entry.name());
            }
        }
    }

    let order: Vec<String> = resolve_order(registry)
        .unwrap_or_else(|_| registry.names().map(str::to_string).collect());

    order
        .into_iter()
        .filter(|id| id != name && affected.contains(id.as_str()))
        .collect()
}

/// Find one cycle among the apps Kahn's algorithm could not place.
///
/// Returns the path with the first app repeated at the end.
fn find_cycle(registry: &AppRegistry, pending: &[usize]) -> Vec<String> {
    let stuck: Vec<&str> = registry
        .names()
        .enumerate()
        .filter(|(index, _)| pending[*index] > 0)
        .map(|(_, name)| name)
        .collect();

    let mut visited: HashSet<&str> = HashSet::new();
    for &start in &stuck {
        let mut path: Vec<&str> = Vec::new();
        if let Some(cycle) = walk(registry, start, &stuck, &mut visited, &mut path) {
            return cycle;
        }
    }

    // Kahn's algorithm only stalls on a cycle, so this is not reached.
    stuck.into_iter().map(str::to_string).collect()
}

fn walk<'a>(
    registry: &'a AppRegistry,
    id: &'a str,
    stuck: &[&str],
    visited: &mut HashSet<&'a str>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    if let Some(at) = path.iter().position(|p| *p == id) {
        let mut cycle: Vec<String> = path[at..].iter().map(|s| s.to_string()).collect();
        cycle.push(id.to_string());
        return Some(cycle);
    }
    if !visited.insert(id) {
        return None;
    }

    path.push(id);
    let entry = registry.get(id).ok()?;
    for dep in entry.depends() {
        if !stuck.contains(&dep.as_str()) {
            continue;
        }
        if let Some(cycle) = walk(registry, dep, stuck, visited, path) {
            return Some(cycle);
        }
    }
    path.pop();
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{App, AppInfo};

    struct Deps(Vec<&'static str>);

    impl App for Deps {
        fn info(&self) -> AppInfo {
            self.0
                .iter()
                .fold(AppInfo::new(1), |info, dep| info.depends_on(*dep))
        }
    }

    fn registry(apps: &[(&str, Vec<&'static str>)]) -> AppRegistry {
        let mut registry = AppRegistry::new();
        for (name, deps) in apps {
            registry.register(*name, Deps(deps.clone())).unwrap();
        }
        registry
    }

    fn assert_respects_edges(registry: &AppRegistry, order: &[String]) {
        for entry in registry.all() {
            let at = order.iter().position(|n| n == entry.name()).unwrap();
            for dep in entry.depends() {
                let dep_at = order.iter().position(|n| n == dep).unwrap();
                assert!(dep_at < at, "{} must come before {}", dep, entry.name());
            }
        }
    }

    #[test]
    fn test_no_edges_keeps_insertion_order() {
        let registry = registry(&[("tor", vec![]), ("apps", vec![]), ("bind", vec![])]);
        assert_eq!(resolve_order(&registry).unwrap(), vec!["tor", "apps", "bind"]);
    }

    #[test]
    fn test_dependencies_come_first() {
        let registry = registry(&[
            ("deluge", vec!["apps", "firewall"]),
            ("apps", vec!["system"]),
            ("firewall", vec!["system"]),
            ("system", vec![]),
        ]);

        let order = resolve_order(&registry).unwrap();
        assert_respects_edges(&registry, &order);
        assert_eq!(order, vec!["system", "apps", "firewall", "deluge"]);
    }

    #[test]
    fn test_ties_broken_by_insertion_order() {
        // b is free to go before c, which only a depends on.
        let registry = registry(&[("a", vec!["c"]), ("b", vec![]), ("c", vec![])]);
        assert_eq!(resolve_order(&registry).unwrap(), vec!["b", "c", "a"]);
    }

    #[test]
    fn test_diamond_order() {
        let registry = registry(&[
            ("top", vec!["left", "right"]),
            ("left", vec!["base"]),
            ("right", vec!["base"]),
            ("base", vec![]),
            ("loose", vec![]),
        ]);

        let order = resolve_order(&registry).unwrap();
        assert_respects_edges(&registry, &order);
        assert_eq!(order, vec!["base", "left", "right", "top", "loose"]);
    }

    #[test]
    fn test_repeated_dependency_counts_once() {
        let registry = registry(&[("a", vec!["b", "b"]), ("b", vec![])]);
        assert_eq!(resolve_order(&registry).unwrap(), vec!["b", "a"]);
    }

    #[test]
    fn test_missing_dependency() {
        let registry = registry(&[("deluge", vec!["apps"]), ("tor", vec![])]);

        match resolve_order(&registry) {
            Err(HostError::MissingDependency { app, dependency }) => {
                assert_eq!(app, "deluge");
                assert_eq!(dependency, "apps");
            }
            other => panic!("expected missing dependency, got {:?}", other),
        }
    }

    #[test]
    fn test_cycle_is_reported_with_path() {
        let registry = registry(&[
            ("free", vec![]),
            ("a", vec!["b"]),
            ("b", vec!["c"]),
            ("c", vec!["a"]),
        ]);

        match resolve_order(&registry) {
            Err(HostError::CyclicDependency(cycle)) => {
                assert_eq!(cycle, vec!["a", "b", "c", "a"]);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_cycle_behind_dependent_is_found() {
        // d is stuck only because it depends on the cycle.
        let registry = registry(&[("d", vec!["a"]), ("a", vec!["b"]), ("b", vec!["a"])]);

        match resolve_order(&registry) {
            Err(HostError::CyclicDependency(cycle)) => assert_eq!(cycle, vec!["a", "b", "a"]),
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let registry = registry(&[("a", vec!["a"])]);

        match resolve_order(&registry) {
            Err(HostError::CyclicDependency(cycle)) => assert_eq!(cycle, vec!["a", "a"]),
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_dependents_of() {
        let registry = registry(&[
            ("system", vec![]),
            ("apps", vec!["system"]),
            ("deluge", vec!["apps"]),
            ("tor", vec![]),
            ("transmission", vec!["apps"]),
        ]);

        assert_eq!(
            dependents_of(&registry, "system"),
            vec!["apps", "deluge", "transmission"]
        );
        assert_eq!(dependents_of(&registry, "apps"), vec!["deluge", "transmission"]);
        assert!(dependents_of(&registry, "tor").is_empty());
    }
}
