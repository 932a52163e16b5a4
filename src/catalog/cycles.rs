//! Simple-cycle enumeration over the catalog's dependency graph.
//!
//! `petgraph` can tell us *whether* a graph is cyclic but not enumerate
//! the cycles themselves, so this walks the graph directly with the
//! classic Johnson/Hawick-James blocking-set backtrack: from each
//! candidate start vertex (in index order, so no cycle is reported
//! twice from two different rotations) depth-first search for a path
//! back to it, maintaining a "blocked" set of vertices that cannot
//! currently lead anywhere new, and a blocking map used to unblock
//! vertices once a path through them is found to close a cycle.

use std::collections::{HashMap, HashSet};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

struct Search<'a, N, E> {
    graph: &'a DiGraph<N, E>,
    start: NodeIndex,
    blocked: HashSet<NodeIndex>,
    blocked_by: HashMap<NodeIndex, HashSet<NodeIndex>>,
    stack: Vec<NodeIndex>,
    cycles: Vec<Vec<NodeIndex>>,
}

impl<'a, N, E> Search<'a, N, E> {
    fn unblock(&mut self, vertex: NodeIndex) {
        if !self.blocked.remove(&vertex) {
            return;
        }
        if let Some(dependents) = self.blocked_by.remove(&vertex) {
            for dependent in dependents {
                self.unblock(dependent);
            }
        }
    }

    /// Returns true if the walk from `vertex` found (and recorded) at
    /// least one cycle back to `self.start`.
    fn walk(&mut self, vertex: NodeIndex, floor: NodeIndex) -> bool {
        let mut found = false;
        self.stack.push(vertex);
        self.blocked.insert(vertex);

        for edge in self.graph.edges(vertex) {
            let next = edge.target();
            if next < floor {
                continue;
            }
            if next == self.start {
                self.cycles.push(self.stack.clone());
                found = true;
            } else if !self.blocked.contains(&next) && self.walk(next, floor) {
                found = true;
            }
        }

        if found {
            self.unblock(vertex);
        } else {
            for edge in self.graph.edges(vertex) {
                let next = edge.target();
                if next < floor {
                    continue;
                }
                self.blocked_by.entry(next).or_default().insert(vertex);
            }
        }

        self.stack.pop();
        found
    }
}

/// Enumerates every simple cycle in `graph`, each reported exactly once
/// as the sequence of vertices visited (not including a repeated start).
pub fn enumerate_simple_cycles<N, E>(graph: &DiGraph<N, E>) -> Vec<Vec<NodeIndex>> {
    let mut all_cycles = Vec::new();
    for start in graph.node_indices() {
        let mut search = Search {
            graph,
            start,
            blocked: HashSet::new(),
            blocked_by: HashMap::new(),
            stack: Vec::new(),
            cycles: Vec::new(),
        };
        search.walk(start, start);
        all_cycles.append(&mut search.cycles);
    }
    all_cycles
}
