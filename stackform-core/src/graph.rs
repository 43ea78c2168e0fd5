//! Service dependency graph.
//!
//! Nodes are service names; an edge `A -> B` means "A depends on B". Ordering is
//! Kahn's algorithm with a sorted ready set, so equal graphs always produce
//! equal orders.

use crate::error::{Result, StackError};
use crate::types::Service;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Acyclic dependency graph over the services of a stack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    /// service -> services it depends on
    edges: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    /// Build the graph, rejecting dangling and cyclic dependencies.
    pub fn build(services: &BTreeMap<String, Service>) -> Result<Self> {
        let mut edges = BTreeMap::new();
        for (name, service) in services {
            for dependency in &service.depends_on {
                if !services.contains_key(dependency) {
                    return Err(StackError::UnknownDependency {
                        service: name.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
            edges.insert(name.clone(), service.depends_on.clone());
        }

        let graph = Self { edges };
        if let Some(cycle) = graph.find_cycle() {
            return Err(StackError::CircularDependency { cycle });
        }
        debug!(services = graph.len(), "Built dependency graph");
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn contains(&self, service: &str) -> bool {
        self.edges.contains_key(service)
    }

    /// Direct dependencies of `service`.
    pub fn dependencies(&self, service: &str) -> impl Iterator<Item = &str> {
        self.edges.get(service).into_iter().flatten().map(String::as_str)
    }

    /// Services that directly depend on `service`.
    pub fn dependents<'a>(&'a self, service: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.edges
            .iter()
            .filter(move |(_, deps)| deps.contains(service))
            .map(|(name, _)| name.as_str())
    }

    /// Topological order of every service.
    ///
    /// `reverse = false` puts dependents before their dependencies (teardown);
    /// `reverse = true` is exactly that sequence reversed (bring-up). Fails
    /// instead of returning a partial order if the graph has a cycle.
    pub fn order(&self, reverse: bool) -> Result<Vec<String>> {
        // in-degree counts the dependents still waiting to be emitted
        let mut in_degree: BTreeMap<&str, usize> =
            self.edges.keys().map(|name| (name.as_str(), 0)).collect();
        for deps in self.edges.values() {
            for dep in deps {
                if let Some(count) = in_degree.get_mut(dep.as_str()) {
                    *count += 1;
                }
            }
        }

        let mut ready: BTreeSet<&str> =
            in_degree.iter().filter(|(_, &count)| count == 0).map(|(name, _)| *name).collect();
        let mut result = Vec::with_capacity(self.edges.len());

        while let Some(node) = ready.pop_first() {
            result.push(node.to_string());
            for dep in self.dependencies(node) {
                if let Some(count) = in_degree.get_mut(dep) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(dep);
                    }
                }
            }
        }

        if result.len() != self.edges.len() {
            return Err(StackError::CircularDependency {
                cycle: self.find_cycle().unwrap_or_else(|| {
                    in_degree
                        .into_iter()
                        .filter(|(_, count)| *count > 0)
                        .map(|(name, _)| name.to_string())
                        .collect()
                }),
            });
        }

        if reverse {
            result.reverse();
        }
        Ok(result)
    }

    /// First cycle found by depth-first search, as a closed path (`a -> b -> a`).
    fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit<'a>(
            graph: &'a DependencyGraph,
            node: &'a str,
            marks: &mut BTreeMap<&'a str, Mark>,
            path: &mut Vec<&'a str>,
        ) -> Option<Vec<String>> {
            match marks.get(node) {
                Some(Mark::Done) => return None,
                Some(Mark::Visiting) => {
                    let start = path.iter().position(|n| *n == node).unwrap_or(0);
                    let mut cycle: Vec<String> = path[start..].iter().map(|n| n.to_string()).collect();
                    cycle.push(node.to_string());
                    return Some(cycle);
                }
                None => {}
            }

            marks.insert(node, Mark::Visiting);
            path.push(node);
            for dep in graph.dependencies(node) {
                if let Some(cycle) = visit(graph, dep, marks, path) {
                    return Some(cycle);
                }
            }
            path.pop();
            marks.insert(node, Mark::Done);
            None
        }

        let mut marks = BTreeMap::new();
        let mut path = Vec::new();
        self.edges.keys().find_map(|node| visit(self, node, &mut marks, &mut path))
    }
}
