//! CP-004: Dependency DAG construction.
//!
//! Edges come from the expressions found in each instance's raw inputs: an
//! instance that reads `${api.url}` depends on `api`. The topological order is
//! computed with Kahn's algorithm; among ready instances the one declared
//! first goes first, so the order is deterministic.

use super::error::{EngineError, Result};
use super::resolver::collect_references;
use super::types::InstanceDecl;
use indexmap::IndexMap;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Validated, acyclic dependency graph over one scope's instances.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    order: Vec<String>,
    providers: IndexMap<String, Vec<String>>,
    dependents: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    /// Topological evaluation order.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Instances whose outputs `id` reads.
    pub fn providers_of(&self, id: &str) -> &[String] {
        self.providers.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Instances that read `id`'s outputs.
    pub fn dependents_of(&self, id: &str) -> &[String] {
        self.dependents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All (consumer, provider) edges, consumers in declaration order.
    pub fn edges(&self) -> impl Iterator<Item = (&str, &str)> {
        self.providers
            .iter()
            .flat_map(|(c, ps)| ps.iter().map(move |p| (c.as_str(), p.as_str())))
    }

    /// Every instance that depends on `id`, directly or transitively.
    pub fn transitive_dependents(&self, id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack: Vec<&str> = vec![id];
        while let Some(current) = stack.pop() {
            for dep in self.dependents_of(current) {
                if seen.insert(dep.clone()) {
                    stack.push(dep);
                }
            }
        }
        seen
    }
}

/// Build the dependency graph for a set of declared instances.
///
/// Fails with `UnknownReference` if an expression names an undeclared
/// instance and with `CyclicDependency` if the references form a cycle
/// (including an instance reading its own outputs).
pub fn build_graph(instances: &IndexMap<String, InstanceDecl>) -> Result<DependencyGraph> {
    let mut providers: IndexMap<String, Vec<String>> = IndexMap::new();

    for (id, decl) in instances {
        let mut deps: Vec<String> = Vec::new();
        for reference in collect_references(&decl.inputs) {
            if reference.is_env() {
                continue;
            }
            if !instances.contains_key(&reference.instance) {
                return Err(EngineError::UnknownReference {
                    instance: id.clone(),
                    expression: reference.expression,
                });
            }
            if !deps.contains(&reference.instance) {
                deps.push(reference.instance);
            }
        }
        providers.insert(id.clone(), deps);
    }

    let nodes: Vec<String> = instances.keys().cloned().collect();
    let order = topological_order(&nodes, &providers)?;

    let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
    for (consumer, deps) in &providers {
        for provider in deps {
            dependents
                .entry(provider.clone())
                .or_default()
                .push(consumer.clone());
        }
    }

    Ok(DependencyGraph {
        order,
        providers,
        dependents,
    })
}

/// Kahn's algorithm over `nodes` (in priority order) with `providers` edges.
///
/// Edges to nodes outside `nodes` are ignored. Ready nodes are taken in the
/// order they appear in `nodes`.
pub fn topological_order(
    nodes: &[String],
    providers: &IndexMap<String, Vec<String>>,
) -> Result<Vec<String>> {
    let index: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), i))
        .collect();
    let mut in_degree = vec![0usize; nodes.len()];
    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];

    for (consumer, deps) in providers {
        let Some(&c) = index.get(consumer.as_str()) else {
            continue;
        };
        for provider in deps {
            if let Some(&p) = index.get(provider.as_str()) {
                adjacency[p].push(c);
                in_degree[c] += 1;
            }
        }
    }

    let mut ready: BTreeSet<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(current) = ready.pop_first() {
        order.push(nodes[current].clone());
        for &next in &adjacency[current] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.insert(next);
            }
        }
    }

    if order.len() != nodes.len() {
        return Err(EngineError::CyclicDependency {
            members: cycle_members(nodes, &adjacency, &in_degree),
        });
    }

    Ok(order)
}

/// After Kahn stalls, the remaining nodes are cycle members plus nodes
/// downstream of a cycle. Peeling nodes with no remaining dependents leaves
/// only the nodes that sit on a cycle.
fn cycle_members(nodes: &[String], adjacency: &[Vec<usize>], in_degree: &[usize]) -> Vec<String> {
    let mut remaining: BTreeSet<usize> = (0..nodes.len()).filter(|&i| in_degree[i] > 0).collect();
    loop {
        let sinks: Vec<usize> = remaining
            .iter()
            .copied()
            .filter(|&i| !adjacency[i].iter().any(|n| remaining.contains(n)))
            .collect();
        if sinks.is_empty() {
            break;
        }
        for s in sinks {
            remaining.remove(&s);
        }
    }
    remaining.into_iter().map(|i| nodes[i].clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decls(entries: &[(&str, serde_json::Value)]) -> IndexMap<String, InstanceDecl> {
        entries
            .iter()
            .map(|(id, inputs)| (id.to_string(), InstanceDecl::new("T", inputs.clone())))
            .collect()
    }

    #[test]
    fn test_cp004_scenario_api_before_site() {
        let instances = decls(&[
            ("site", json!({"apiUrl": "${api.url}"})),
            ("api", json!({})),
        ]);
        let graph = build_graph(&instances).unwrap();
        assert_eq!(graph.order(), &["api".to_string(), "site".to_string()]);
        assert_eq!(graph.providers_of("site"), &["api".to_string()]);
        assert_eq!(graph.dependents_of("api"), &["site".to_string()]);
    }

    #[test]
    fn test_cp004_ties_broken_by_declaration_order() {
        let instances = decls(&[("zeta", json!({})), ("alpha", json!({})), ("mid", json!({}))]);
        let graph = build_graph(&instances).unwrap();
        assert_eq!(graph.order(), &["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_cp004_diamond() {
        let instances = decls(&[
            ("bottom", json!({"l": "${left.x}", "r": "${right.x}"})),
            ("right", json!({"t": "${top.x}"})),
            ("left", json!({"t": "${top.x}"})),
            ("top", json!({})),
        ]);
        let graph = build_graph(&instances).unwrap();
        assert_eq!(graph.order(), &["top", "right", "left", "bottom"]);
        let deps = graph.transitive_dependents("top");
        assert_eq!(deps.len(), 3);
        assert_eq!(graph.edges().count(), 4);
    }

    #[test]
    fn test_cp004_duplicate_references_single_edge() {
        let instances = decls(&[
            ("api", json!({})),
            ("site", json!({"a": "${api.url}", "b": "wss=${api.url}/${api.port}"})),
        ]);
        let graph = build_graph(&instances).unwrap();
        assert_eq!(graph.providers_of("site").len(), 1);
    }

    #[test]
    fn test_cp004_env_references_are_not_edges() {
        let instances = decls(&[("api", json!({"region": "${env.REGION}"}))]);
        let graph = build_graph(&instances).unwrap();
        assert!(graph.providers_of("api").is_empty());
    }

    #[test]
    fn test_cp004_unknown_reference() {
        let instances = decls(&[("site", json!({"u": "${ghost.url}"}))]);
        let err = build_graph(&instances).unwrap_err();
        assert_eq!(
            err,
            EngineError::UnknownReference {
                instance: "site".to_string(),
                expression: "${ghost.url}".to_string(),
            }
        );
    }

    #[test]
    fn test_cp004_two_cycle() {
        let instances = decls(&[("a", json!({"x": "${b.out}"})), ("b", json!({"x": "${a.out}"}))]);
        let err = build_graph(&instances).unwrap_err();
        assert_eq!(
            err,
            EngineError::CyclicDependency {
                members: vec!["a".to_string(), "b".to_string()],
            }
        );
    }

    #[test]
    fn test_cp004_three_cycle_excludes_downstream() {
        let instances = decls(&[
            ("root", json!({})),
            ("a", json!({"x": "${c.out}", "r": "${root.out}"})),
            ("b", json!({"x": "${a.out}"})),
            ("c", json!({"x": "${b.out}"})),
            ("tail", json!({"x": "${c.out}"})),
        ]);
        let err = build_graph(&instances).unwrap_err();
        assert_eq!(
            err,
            EngineError::CyclicDependency {
                members: vec!["a".to_string(), "b".to_string(), "c".to_string()],
            }
        );
    }

    #[test]
    fn test_cp004_self_reference_is_a_cycle() {
        let instances = decls(&[("a", json!({"x": "${a.out}"}))]);
        let err = build_graph(&instances).unwrap_err();
        assert!(matches!(err, EngineError::CyclicDependency { members } if members == ["a"]));
    }

    #[test]
    fn test_cp004_topological_order_ignores_foreign_edges() {
        let nodes = vec!["x".to_string(), "y".to_string()];
        let mut providers = IndexMap::new();
        providers.insert("x".to_string(), vec!["y".to_string(), "gone".to_string()]);
        let order = topological_order(&nodes, &providers).unwrap();
        assert_eq!(order, vec!["y", "x"]);
    }

    #[test]
    fn test_cp004_long_cycle_detected() {
        let n = 6;
        let instances: IndexMap<String, InstanceDecl> = (0..n)
            .map(|i| {
                let next = (i + 1) % n;
                (
                    format!("n{}", i),
                    InstanceDecl::new("T", json!({"x": format!("${{n{}.out}}", next)})),
                )
            })
            .collect();
        let err = build_graph(&instances).unwrap_err();
        assert!(matches!(err, EngineError::CyclicDependency { members } if members.len() == n));
    }
}
