//! The dependency resolver (component C3): builds a DAG from the References embedded in a
//! graph's manifests, detects cycles, and computes topological/level/rollback orderings.
//!
//! Storage and cycle detection follow `cargo-guppy`'s `PackageGraph`: a `petgraph::graph::DiGraph`
//! as the source of truth plus a side index from id to node, cycle detection via
//! `petgraph::algo::toposort` rather than a hand-rolled recursive walk (dependency graphs have
//! unbounded depth, so the iterative algorithm is preferred), and level-peeling via repeatedly
//! filtering for nodes with no remaining incoming edges, the same shape as `PackageGraph::roots`.

use std::collections::HashMap;

use api::{ResourceEntry, ResourceId};
use indexmap::IndexMap;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use crate::error::{Error, Result};

/// One level of the deployment plan: resources with no remaining undeployed dependency, in
/// lexicographic `id` order (ties within a level are broken this way for determinism).
pub type Level = Vec<ResourceId>;

/// A resolved dependency graph over a [`api::ResourceGraph`]'s resources.
#[derive(Debug)]
pub struct DependencyGraph {
    graph: DiGraph<ResourceId, ()>,
    index: HashMap<ResourceId, NodeIndex>,
}

impl DependencyGraph {
    /// Builds the dependency graph from a resource map, validating that every embedded
    /// [`api::Reference`]'s `resource_id` (other than the schema sentinel) names a known resource.
    pub fn build(resources: &IndexMap<ResourceId, ResourceEntry>) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        for id in resources.keys() {
            let node = graph.add_node(id.clone());
            index.insert(id.clone(), node);
        }
        for (id, entry) in resources {
            let mut refs = Vec::new();
            entry.manifest.collect_refs(&mut refs);
            let from = index[id];
            for r in refs {
                if r.is_schema() {
                    continue;
                }
                let Some(&to) = index.get(&r.resource_id) else {
                    return Err(Error::UnknownResource {
                        resource_id: r.resource_id,
                        field_path: r.field_path,
                    });
                };
                if to == from {
                    continue; // self-loops are disallowed at the edge level; see below.
                }
                graph.update_edge(from, to, ());
            }
        }
        let dag = DependencyGraph { graph, index };
        dag.check_acyclic()?;
        Ok(dag)
    }

    fn check_acyclic(&self) -> Result<()> {
        if toposort(&self.graph, None).is_err() {
            let cycle = self.find_cycle();
            return Err(Error::CircularDependency { cycle });
        }
        Ok(())
    }

    /// Recovers one concrete cycle path for the error message. `toposort` only reports that *a*
    /// cycle exists, not which nodes form it, so this walks a DFS with an explicit recursion
    /// stack to find a back-edge.
    fn find_cycle(&self) -> Vec<ResourceId> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }
        let n = self.graph.node_count();
        let mut marks = vec![Mark::Unvisited; n];
        let mut stack: Vec<NodeIndex> = Vec::new();

        fn visit(
            graph: &DiGraph<ResourceId, ()>,
            node: NodeIndex,
            marks: &mut [Mark],
            stack: &mut Vec<NodeIndex>,
        ) -> Option<Vec<NodeIndex>> {
            marks[node.index()] = Mark::InProgress;
            stack.push(node);
            for succ in graph.neighbors_directed(node, Direction::Outgoing) {
                match marks[succ.index()] {
                    Mark::Unvisited => {
                        if let Some(cycle) = visit(graph, succ, marks, stack) {
                            return Some(cycle);
                        }
                    }
                    Mark::InProgress => {
                        let start = stack.iter().position(|&n| n == succ).unwrap_or(0);
                        let mut cycle = stack[start..].to_vec();
                        cycle.push(succ);
                        return Some(cycle);
                    }
                    Mark::Done => {}
                }
            }
            stack.pop();
            marks[node.index()] = Mark::Done;
            None
        }

        for start in self.graph.node_indices() {
            if marks[start.index()] == Mark::Unvisited {
                if let Some(cycle) = visit(&self.graph, start, &mut marks, &mut stack) {
                    return cycle.into_iter().map(|n| self.graph[n].clone()).collect();
                }
            }
        }
        Vec::new()
    }

    /// A full topological order (one permissible deployment order, flattening levels).
    ///
    /// Edges run dependent→dependency (`app → db` for `app` referencing `db`), so `toposort`
    /// itself yields dependents before their dependencies; reverse it to get the dependency-first
    /// order deployment and serialization require.
    pub fn topological_order(&self) -> Vec<ResourceId> {
        let mut order: Vec<ResourceId> = toposort(&self.graph, None)
            .expect("acyclic: checked in build()")
            .into_iter()
            .map(|n| self.graph[n].clone())
            .collect();
        order.reverse();
        order
    }

    /// Levels: nodes grouped by minimum distance from a root (a node with no dependencies), each
    /// level sorted lexicographically by id for deterministic tie-breaking.
    pub fn levels(&self) -> Vec<Level> {
        let mut remaining_in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|n| (n, self.graph.neighbors_directed(n, Direction::Outgoing).count()))
            .collect();
        let mut levels = Vec::new();
        let mut resolved: std::collections::HashSet<NodeIndex> = std::collections::HashSet::new();

        while resolved.len() < self.graph.node_count() {
            let mut level: Vec<NodeIndex> = remaining_in_degree
                .iter()
                .filter(|(n, &deg)| deg == 0 && !resolved.contains(n))
                .map(|(&n, _)| n)
                .collect();
            // Acyclicity was already checked in build(); an empty level here would mean a bug.
            assert!(!level.is_empty(), "no roots found in a graph checked acyclic");
            level.sort_by_key(|&n| self.graph[n].clone());
            for &n in &level {
                resolved.insert(n);
            }
            for &n in &level {
                for dependent in self.graph.neighbors_directed(n, Direction::Incoming) {
                    if let Some(deg) = remaining_in_degree.get_mut(&dependent) {
                        *deg = deg.saturating_sub(1);
                    }
                }
            }
            for n in &level {
                remaining_in_degree.remove(n);
            }
            levels.push(level.into_iter().map(|n| self.graph[n].clone()).collect());
        }
        levels
    }

    /// The exact reverse of the levelized topological order, per Testable Property 5.
    pub fn rollback_order(&self) -> Vec<ResourceId> {
        let mut ids: Vec<ResourceId> = self.levels().into_iter().flatten().collect();
        ids.reverse();
        ids
    }

    /// True if `id` is a known node.
    pub fn contains(&self, id: &ResourceId) -> bool {
        self.index.contains_key(id)
    }
}

/// Assigns a deterministic id from a `kind`/`name`/optional-`namespace` triple.
///
/// Convention: `kind` with its first letter lower-cased, followed by the PascalCased `name`
/// (splitting on `-`, `_`, `.`), followed by the PascalCased namespace when it is present and not
/// `"default"`. This makes repeated serialization of the same graph byte-identical (Testable
/// Property 1), since the id depends only on immutable manifest facts.
pub fn deterministic_id(kind: &str, name: &str, namespace: Option<&str>) -> ResourceId {
    let kind_camel = lower_first(kind);
    let name_pascal = pascal_case(name);
    let suffix = match namespace {
        Some(ns) if ns != "default" && !ns.is_empty() => pascal_case(ns),
        _ => String::new(),
    };
    ResourceId::from(format!("{kind_camel}{name_pascal}{suffix}"))
}

pub(crate) fn lower_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) => c.to_lowercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

fn pascal_case(s: &str) -> String {
    s.split(['-', '_', '.'])
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(c) => c.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use api::{FieldPath, Reference, TypeTag, Value};

    fn entry(id: &str, refs: Vec<Reference>) -> ResourceEntry {
        let mut obj = indexmap::IndexMap::new();
        for (i, r) in refs.into_iter().enumerate() {
            obj.insert(format!("ref{i}"), Value::Ref(r));
        }
        ResourceEntry {
            id: ResourceId::from(id),
            kind: "Widget".into(),
            api_version: "v1".into(),
            manifest: Value::Object(obj),
            readiness: None,
        }
    }

    #[test]
    fn schema_references_create_no_edges() {
        let mut resources = IndexMap::new();
        resources.insert(
            ResourceId::from("app"),
            entry(
                "app",
                vec![Reference::schema(FieldPath::root().field("spec").field("host"), TypeTag::String)],
            ),
        );
        let dag = DependencyGraph::build(&resources).unwrap();
        assert_eq!(dag.graph.edge_count(), 0);
    }

    #[test]
    fn cross_resource_reference_creates_edge_and_order() {
        let mut resources = IndexMap::new();
        resources.insert(ResourceId::from("db"), entry("db", vec![]));
        resources.insert(
            ResourceId::from("app"),
            entry(
                "app",
                vec![Reference::new(
                    ResourceId::from("db"),
                    FieldPath::root().field("status").field("podIP"),
                    TypeTag::String,
                )],
            ),
        );
        let dag = DependencyGraph::build(&resources).unwrap();
        let order = dag.topological_order();
        let db_pos = order.iter().position(|i| i == &ResourceId::from("db")).unwrap();
        let app_pos = order.iter().position(|i| i == &ResourceId::from("app")).unwrap();
        assert!(db_pos < app_pos);
    }

    #[test]
    fn cycle_is_detected() {
        let mut resources = IndexMap::new();
        resources.insert(
            ResourceId::from("a"),
            entry(
                "a",
                vec![Reference::new(ResourceId::from("b"), FieldPath::root().field("x"), TypeTag::String)],
            ),
        );
        resources.insert(
            ResourceId::from("b"),
            entry(
                "b",
                vec![Reference::new(ResourceId::from("a"), FieldPath::root().field("y"), TypeTag::String)],
            ),
        );
        let err = DependencyGraph::build(&resources).unwrap_err();
        assert!(matches!(err, Error::CircularDependency { .. }));
    }

    #[test]
    fn unknown_resource_reference_fails() {
        let mut resources = IndexMap::new();
        resources.insert(
            ResourceId::from("app"),
            entry(
                "app",
                vec![Reference::new(ResourceId::from("ghost"), FieldPath::root().field("x"), TypeTag::String)],
            ),
        );
        let err = DependencyGraph::build(&resources).unwrap_err();
        assert!(matches!(err, Error::UnknownResource { .. }));
    }

    #[test]
    fn rollback_order_is_reverse_of_levels() {
        let mut resources = IndexMap::new();
        resources.insert(ResourceId::from("db"), entry("db", vec![]));
        resources.insert(
            ResourceId::from("app"),
            entry(
                "app",
                vec![Reference::new(
                    ResourceId::from("db"),
                    FieldPath::root().field("status").field("podIP"),
                    TypeTag::String,
                )],
            ),
        );
        let dag = DependencyGraph::build(&resources).unwrap();
        let mut flattened: Vec<ResourceId> = dag.levels().into_iter().flatten().collect();
        let mut rollback = dag.rollback_order();
        flattened.reverse();
        assert_eq!(rollback, flattened);
        rollback.reverse();
        assert_eq!(rollback, vec![ResourceId::from("db"), ResourceId::from("app")]);
    }

    #[test]
    fn deterministic_id_matches_convention() {
        assert_eq!(deterministic_id("Deployment", "web", None).to_string(), "deploymentWeb");
        assert_eq!(deterministic_id("Deployment", "web", Some("default")).to_string(), "deploymentWeb");
        assert_eq!(
            deterministic_id("Deployment", "web", Some("prod")).to_string(),
            "deploymentWebProd"
        );
        assert_eq!(deterministic_id("Service", "my-app", None).to_string(), "serviceMyApp");
    }
}
