use serde::{Deserialize, Serialize};

use crate::address::Hrmid;
use crate::identity::NetworkAddress;

/// One hop-count route between two hierarchical addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoutingEntry {
    pub source: Hrmid,
    pub destination: Hrmid,
    pub next_hop: Hrmid,
    pub hop_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_hop_address: Option<NetworkAddress>,
}

impl RoutingEntry {
    pub fn new(source: Hrmid, destination: Hrmid, next_hop: Hrmid, hop_count: u32) -> Self {
        Self {
            source,
            destination,
            next_hop,
            hop_count,
            next_hop_address: None,
        }
    }

    /// Route to a direct neighbor.
    pub fn direct_neighbor(source: Hrmid, destination: Hrmid) -> Self {
        Self::new(source, destination, destination, 1)
    }

    pub fn with_next_hop_address(mut self, address: NetworkAddress) -> Self {
        self.next_hop_address = Some(address);
        self
    }

    /// Whether this entry and `other` describe the same (source, destination) route.
    pub fn same_route(&self, other: &RoutingEntry) -> bool {
        self.source == other.source && self.destination == other.destination
    }

    /// Extend this route by `next`, which must start where this one ends.
    /// The next hop of the chained entry stays the first hop of `self`.
    pub fn chain(&self, next: &RoutingEntry) -> Option<RoutingEntry> {
        if self.destination != next.source {
            return None;
        }
        Some(RoutingEntry {
            source: self.source,
            destination: next.destination,
            next_hop: self.next_hop,
            hop_count: self.hop_count + next.hop_count,
            next_hop_address: self.next_hop_address.clone(),
        })
    }
}

impl std::fmt::Display for RoutingEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} -> {} via {} ({} hops)",
            self.source, self.destination, self.next_hop, self.hop_count
        )
    }
}

/// Ordered collection of routing entries with at most one entry per
/// (source, destination) pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingTable {
    entries: Vec<RoutingEntry>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for the same route. Returns true if the
    /// table changed.
    pub fn add(&mut self, entry: RoutingEntry) -> bool {
        if let Some(existing) = self.entries.iter_mut().find(|e| e.same_route(&entry)) {
            if *existing == entry {
                return false;
            }
            *existing = entry;
            return true;
        }
        self.entries.push(entry);
        true
    }

    pub fn remove(&mut self, entry: &RoutingEntry) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| !e.same_route(entry));
        before != self.entries.len()
    }

    /// Add every entry of `other`. Returns true if anything changed.
    pub fn merge(&mut self, other: &RoutingTable) -> bool {
        let mut changed = false;
        for entry in other.iter() {
            changed |= self.add(entry.clone());
        }
        changed
    }

    pub fn filter<F>(&self, predicate: F) -> RoutingTable
    where
        F: Fn(&RoutingEntry) -> bool,
    {
        RoutingTable {
            entries: self.entries.iter().filter(|e| predicate(e)).cloned().collect(),
        }
    }

    /// Entries that concern `peer`: it is either the source or the next hop.
    pub fn relevant_for(&self, peer: Hrmid) -> RoutingTable {
        self.filter(|e| e.source == peer || e.next_hop == peer)
    }

    pub fn contains(&self, entry: &RoutingEntry) -> bool {
        self.entries.iter().any(|e| e == entry)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RoutingEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl FromIterator<RoutingEntry> for RoutingTable {
    fn from_iter<T: IntoIterator<Item = RoutingEntry>>(iter: T) -> Self {
        let mut table = RoutingTable::new();
        for entry in iter {
            table.add(entry);
        }
        table
    }
}

/// Physical route to a peer as reported by the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route(pub Vec<NetworkAddress>);

impl Route {
    pub fn direct(peer: NetworkAddress) -> Self {
        Self(vec![peer])
    }

    pub fn hops(&self) -> usize {
        self.0.len()
    }

    pub fn last_hop(&self) -> Option<&NetworkAddress> {
        self.0.last()
    }
}
