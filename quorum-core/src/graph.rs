//! A build-then-execute dependency graph.
//!
//! The graph is a transient value: callers rebuild it on every reconcile tick, execute its
//! vertices in dependency order, and discard it. Vertices are keyed so that edges can be
//! declared against keys rather than indices.
//!
//! Cycles and edges against unknown keys are programming errors in the code generating the
//! graph, not runtime conditions, and panic accordingly.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

/// A directed acyclic graph of pending work items.
pub struct Dag<K, V> {
    graph: DiGraph<V, ()>,
    index: HashMap<K, NodeIndex>,
}

impl<K, V> Default for Dag<K, V>
where
    K: Eq + Hash + Clone + Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Dag<K, V>
where
    K: Eq + Hash + Clone + Debug,
{
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self { graph: DiGraph::new(), index: HashMap::new() }
    }

    /// The number of vertices in the graph.
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns `true` if the graph holds no vertices.
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Add a vertex under the given key, replacing any vertex previously held under it.
    pub fn add_vertex(&mut self, key: K, vertex: V) {
        match self.index.get(&key) {
            Some(&ix) => self.graph[ix] = vertex,
            None => {
                let ix = self.graph.add_node(vertex);
                self.index.insert(key, ix);
            }
        }
    }

    /// Declare that `child` may only act after `parent` has been materialized.
    pub fn connect(&mut self, parent: &K, child: &K) {
        let parent_ix = self.must_index(parent);
        let child_ix = self.must_index(child);
        self.graph.add_edge(parent_ix, child_ix, ());
    }

    /// Declare that `child` depends on every key in `parents`.
    pub fn depend_on(&mut self, child: &K, parents: &[K]) {
        for parent in parents {
            self.connect(parent, child);
        }
    }

    /// Consume the graph, yielding vertices in dependency order: every vertex appears after
    /// all of its declared parents.
    pub fn into_ordered(self) -> Vec<V> {
        let order = match toposort(&self.graph, None) {
            Ok(order) => order,
            Err(_) => panic!("dependency graph contains a cycle"),
        };
        let (nodes, _edges) = self.graph.into_nodes_edges();
        let mut weights: Vec<Option<V>> = nodes.into_iter().map(|node| Some(node.weight)).collect();
        order
            .into_iter()
            .map(|ix| weights[ix.index()].take().expect("toposort yielded a vertex twice"))
            .collect()
    }

    fn must_index(&self, key: &K) -> NodeIndex {
        match self.index.get(key) {
            Some(&ix) => ix,
            None => panic!("edge declared against unknown graph vertex {:?}", key),
        }
    }
}
