//! Generic directed graph with link payloads and BFS shortest paths.
//!
//! Used twice by the controller: as the abstract routing graph (ARG) over
//! cluster identities and as the hierarchical routing graph (HRG) over
//! HRMIDs. Nodes are inserted implicitly by `add_link`; queries never mutate.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// One hop of a path returned by [`RoutingGraph::shortest_path`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSegment<N, L> {
    pub from: N,
    pub to: N,
    pub link: L,
}

#[derive(Debug, Clone)]
pub struct RoutingGraph<N: Ord + Clone, L: Clone> {
    adjacency: BTreeMap<N, BTreeMap<N, L>>,
}

impl<N: Ord + Clone, L: Clone> Default for RoutingGraph<N, L> {
    fn default() -> Self {
        Self {
            adjacency: BTreeMap::new(),
        }
    }
}

impl<N: Ord + Clone, L: Clone> RoutingGraph<N, L> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: N) {
        self.adjacency.entry(node).or_default();
    }

    /// Add or replace the directed link `from -> to`. Returns true if the
    /// link did not exist before.
    pub fn add_link(&mut self, from: N, to: N, link: L) -> bool {
        self.add_node(to.clone());
        self.adjacency
            .entry(from)
            .or_default()
            .insert(to, link)
            .is_none()
    }

    /// Add the link in both directions.
    pub fn add_undirected(&mut self, a: N, b: N, link: L) -> bool {
        let forward = self.add_link(a.clone(), b.clone(), link.clone());
        let backward = self.add_link(b, a, link);
        forward || backward
    }

    pub fn remove_link(&mut self, from: &N, to: &N) -> Option<L> {
        self.adjacency.get_mut(from).and_then(|links| links.remove(to))
    }

    pub fn remove_undirected(&mut self, a: &N, b: &N) -> bool {
        let forward = self.remove_link(a, b).is_some();
        let backward = self.remove_link(b, a).is_some();
        forward || backward
    }

    /// Remove a node and every link touching it.
    pub fn remove_node(&mut self, node: &N) -> bool {
        let existed = self.adjacency.remove(node).is_some();
        for links in self.adjacency.values_mut() {
            links.remove(node);
        }
        existed
    }

    pub fn contains_node(&self, node: &N) -> bool {
        self.adjacency.contains_key(node)
    }

    pub fn is_linked(&self, from: &N, to: &N) -> bool {
        self.adjacency
            .get(from)
            .map(|links| links.contains_key(to))
            .unwrap_or(false)
    }

    pub fn link(&self, from: &N, to: &N) -> Option<&L> {
        self.adjacency.get(from).and_then(|links| links.get(to))
    }

    /// Outgoing neighbors of `node`.
    pub fn neighbors(&self, node: &N) -> Vec<N> {
        self.adjacency
            .get(node)
            .map(|links| links.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Links ending at `node`, as (origin, link) pairs.
    pub fn in_edges(&self, node: &N) -> Vec<(N, L)> {
        self.adjacency
            .iter()
            .filter_map(|(from, links)| links.get(node).map(|l| (from.clone(), l.clone())))
            .collect()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &N> {
        self.adjacency.keys()
    }

    pub fn node_count(&self) -> usize {
        self.adjacency.len()
    }

    pub fn link_count(&self) -> usize {
        self.adjacency.values().map(|links| links.len()).sum()
    }

    pub fn clear(&mut self) {
        self.adjacency.clear();
    }

    /// Fewest-hop path from `from` to `to` as a list of segments. An empty
    /// list means `from == to`; `None` means unreachable.
    pub fn shortest_path(&self, from: &N, to: &N) -> Option<Vec<PathSegment<N, L>>> {
        if !self.contains_node(from) || !self.contains_node(to) {
            return None;
        }
        if from == to {
            return Some(Vec::new());
        }

        let mut previous: BTreeMap<N, N> = BTreeMap::new();
        let mut visited: BTreeSet<N> = BTreeSet::new();
        let mut queue = VecDeque::new();
        visited.insert(from.clone());
        queue.push_back(from.clone());

        while let Some(current) = queue.pop_front() {
            if &current == to {
                break;
            }
            if let Some(links) = self.adjacency.get(&current) {
                for next in links.keys() {
                    if visited.insert(next.clone()) {
                        previous.insert(next.clone(), current.clone());
                        queue.push_back(next.clone());
                    }
                }
            }
        }

        if !previous.contains_key(to) {
            return None;
        }

        let mut segments = Vec::new();
        let mut cursor = to.clone();
        while let Some(prev) = previous.get(&cursor) {
            let link = self.link(prev, &cursor)?.clone();
            segments.push(PathSegment {
                from: prev.clone(),
                to: cursor.clone(),
                link,
            });
            cursor = prev.clone();
        }
        segments.reverse();
        Some(segments)
    }
}
