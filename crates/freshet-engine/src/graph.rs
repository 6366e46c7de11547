//! Dependency graph over dynamic tables.
//!
//! Tables are kept as an arena keyed by name; edges are `(downstream,
//! upstream)` name pairs and adjacency is built on demand. Only edges
//! whose upstream is itself a registered table participate in ordering;
//! base lake tables are leaves outside the graph.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Adding this table would close a dependency cycle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("circular dependency detected involving table '{0}'")]
pub struct CycleError(pub String);

/// Dependency graph: node → set of upstream nodes.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    upstreams: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from registered table names and `(downstream, upstream)`
    /// edges. Edges pointing at unregistered upstreams (base lake tables)
    /// are dropped.
    pub fn from_edges<N, E>(nodes: N, edges: E) -> Self
    where
        N: IntoIterator<Item = String>,
        E: IntoIterator<Item = (String, String)>,
    {
        let mut graph = Self::new();
        for node in nodes {
            graph.upstreams.entry(node).or_default();
        }
        let known: BTreeSet<String> = graph.upstreams.keys().cloned().collect();
        for (down, up) in edges {
            if known.contains(&up) {
                graph.upstreams.entry(down).or_default().insert(up);
            }
        }
        graph
    }

    /// Add a table with its upstreams, rejecting cycles.
    ///
    /// # Errors
    ///
    /// Returns [`CycleError`] and leaves the graph unchanged when the new
    /// edges would close a cycle.
    pub fn add_table(
        &mut self,
        table: &str,
        upstreams: impl IntoIterator<Item = String>,
    ) -> Result<(), CycleError> {
        let mut candidate = self.clone();
        candidate
            .upstreams
            .insert(table.to_string(), upstreams.into_iter().collect());
        if candidate.has_cycle() {
            return Err(CycleError(table.to_string()));
        }
        *self = candidate;
        Ok(())
    }

    /// Remove a table and any edges mentioning it.
    pub fn remove_table(&mut self, table: &str) {
        self.upstreams.remove(table);
        for ups in self.upstreams.values_mut() {
            ups.remove(table);
        }
    }

    /// Whether `table` is a node.
    #[must_use]
    pub fn contains(&self, table: &str) -> bool {
        self.upstreams.contains_key(table)
    }

    /// Registered upstreams of `table`.
    #[must_use]
    pub fn upstreams_of(&self, table: &str) -> Vec<String> {
        self.upstreams
            .get(table)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Tables in dependency order (upstreams first). Deterministic: ties
    /// resolve by name.
    ///
    /// # Errors
    ///
    /// Returns [`CycleError`] when the graph contains a cycle.
    pub fn topo_sort(&self) -> Result<Vec<String>, CycleError> {
        let mut in_degree: BTreeMap<&str, usize> = self
            .upstreams
            .iter()
            .map(|(node, ups)| {
                let registered = ups.iter().filter(|u| self.contains(u)).count();
                (node.as_str(), registered)
            })
            .collect();
        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();
        let mut sorted = Vec::with_capacity(self.upstreams.len());
        while let Some(node) = queue.pop_front() {
            sorted.push(node.to_string());
            for (other, ups) in &self.upstreams {
                if ups.contains(node) {
                    let d = in_degree.get_mut(other.as_str()).expect("known node");
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(other);
                    }
                }
            }
        }
        if sorted.len() != self.upstreams.len() {
            let stuck = in_degree
                .iter()
                .find(|(_, d)| **d > 0)
                .map_or_else(String::new, |(n, _)| (*n).to_string());
            return Err(CycleError(stuck));
        }
        Ok(sorted)
    }

    /// DAG depth per table: 0 for roots (no registered upstream), else
    /// `1 + max(depth of upstreams)`. Used as queue priority, roots
    /// first.
    ///
    /// # Errors
    ///
    /// Returns [`CycleError`] when the graph contains a cycle.
    pub fn depths(&self) -> Result<BTreeMap<String, u32>, CycleError> {
        let order = self.topo_sort()?;
        let mut depths: BTreeMap<String, u32> = BTreeMap::new();
        for node in order {
            let depth = self
                .upstreams_of(&node)
                .iter()
                .filter_map(|u| depths.get(u))
                .max()
                .map_or(0, |d| d + 1);
            depths.insert(node, depth);
        }
        Ok(depths)
    }

    /// All registered tables reachable upstream from `table` (transitive),
    /// excluding `table` itself.
    #[must_use]
    pub fn ancestors_of(&self, table: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<String> = self.upstreams_of(table);
        while let Some(node) = stack.pop() {
            if seen.insert(node.clone()) {
                stack.extend(self.upstreams_of(&node));
            }
        }
        seen
    }

    fn has_cycle(&self) -> bool {
        let mut visited = BTreeSet::new();
        let mut in_stack = BTreeSet::new();
        for node in self.upstreams.keys() {
            if !visited.contains(node.as_str())
                && self.dfs_cycle(node, &mut visited, &mut in_stack)
            {
                return true;
            }
        }
        false
    }

    fn dfs_cycle<'a>(
        &'a self,
        node: &'a str,
        visited: &mut BTreeSet<&'a str>,
        in_stack: &mut BTreeSet<&'a str>,
    ) -> bool {
        visited.insert(node);
        in_stack.insert(node);
        if let Some(ups) = self.upstreams.get(node) {
            for up in ups {
                if !self.contains(up) {
                    continue;
                }
                if !visited.contains(up.as_str()) {
                    if self.dfs_cycle(up, visited, in_stack) {
                        return true;
                    }
                } else if in_stack.contains(up.as_str()) {
                    return true;
                }
            }
        }
        in_stack.remove(node);
        false
    }
}
