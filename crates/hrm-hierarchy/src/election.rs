//! Election collaborator interface and a reference implementation.
//!
//! The controller never decides elections itself: it collects the priorities
//! of a cluster's members, hands them to an [`Elector`] and reacts to the
//! outcome (`Won` creates a coordinator, `Lost` tears it down).

use std::collections::{BTreeMap, BTreeSet};

use hrm_protocol::{ClusterName, HierarchyLevel, NetworkAddress, Priority};

/// One participant of a cluster election.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionCandidate {
    pub priority: Priority,
    pub address: NetworkAddress,
}

impl ElectionCandidate {
    pub fn new(priority: Priority, address: NetworkAddress) -> Self {
        Self { priority, address }
    }

    /// Total order used by the reference elector: priority first, network
    /// address as tie-break.
    pub fn beats(&self, other: &ElectionCandidate) -> bool {
        (self.priority, &self.address) > (other.priority, &other.address)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ElectionOutcome {
    #[default]
    Pending,
    Won,
    Lost,
}

pub trait Elector: Send {
    /// Priority the local node uses at `level`.
    fn current_priority(&self, level: HierarchyLevel) -> Priority;

    /// Change the local priority at `level`.
    fn set_priority(&mut self, level: HierarchyLevel, priority: Priority);

    fn decide(
        &self,
        cluster: &ClusterName,
        local: &ElectionCandidate,
        candidates: &[ElectionCandidate],
    ) -> ElectionOutcome;

    /// A coordinator at `level` announced itself; `covered_peers` are nodes
    /// that received the announcement directly from it. Returns true if this
    /// changes future decisions.
    fn on_announcement_received(
        &mut self,
        level: HierarchyLevel,
        priority: Priority,
        winner: &NetworkAddress,
        covered_peers: &[NetworkAddress],
    ) -> bool;

    /// The coordinator at `winner` resigned or expired.
    fn on_coordinator_invalidated(&mut self, level: HierarchyLevel, winner: &NetworkAddress)
        -> bool;
}

/// Highest priority wins, ties broken by network address. Peers already
/// covered by another coordinator at the same level do not compete.
#[derive(Debug, Clone)]
pub struct HighestPriorityElector {
    priorities: BTreeMap<HierarchyLevel, Priority>,
    default_priority: Priority,
    /// (level, covered peer) -> coordinators covering it
    covered: BTreeMap<(HierarchyLevel, NetworkAddress), BTreeSet<NetworkAddress>>,
}

impl HighestPriorityElector {
    pub fn new(priority: Priority) -> Self {
        Self {
            priorities: BTreeMap::new(),
            default_priority: priority,
            covered: BTreeMap::new(),
        }
    }

    pub fn is_covered(&self, level: HierarchyLevel, peer: &NetworkAddress) -> bool {
        self.covered
            .get(&(level, peer.clone()))
            .map(|by| !by.is_empty())
            .unwrap_or(false)
    }
}

impl Elector for HighestPriorityElector {
    fn current_priority(&self, level: HierarchyLevel) -> Priority {
        self.priorities
            .get(&level)
            .copied()
            .unwrap_or(self.default_priority)
    }

    fn set_priority(&mut self, level: HierarchyLevel, priority: Priority) {
        self.priorities.insert(level, priority);
    }

    fn decide(
        &self,
        cluster: &ClusterName,
        local: &ElectionCandidate,
        candidates: &[ElectionCandidate],
    ) -> ElectionOutcome {
        let competing = candidates
            .iter()
            .filter(|c| c.address != local.address)
            .filter(|c| !self.is_covered(cluster.level, &c.address));
        for candidate in competing {
            if candidate.beats(local) {
                return ElectionOutcome::Lost;
            }
        }
        ElectionOutcome::Won
    }

    fn on_announcement_received(
        &mut self,
        level: HierarchyLevel,
        _priority: Priority,
        winner: &NetworkAddress,
        covered_peers: &[NetworkAddress],
    ) -> bool {
        let mut changed = false;
        for peer in covered_peers.iter().filter(|p| *p != winner) {
            changed |= self
                .covered
                .entry((level, peer.clone()))
                .or_default()
                .insert(winner.clone());
        }
        changed
    }

    fn on_coordinator_invalidated(&mut self, level: HierarchyLevel, winner: &NetworkAddress) -> bool {
        let mut changed = false;
        self.covered.retain(|(covered_level, _), by| {
            if *covered_level == level && by.remove(winner) {
                changed = true;
            }
            !by.is_empty()
        });
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(priority: u64, address: &str) -> ElectionCandidate {
        ElectionCandidate::new(Priority::new(priority), NetworkAddress::new(address))
    }

    fn base_cluster() -> ClusterName {
        ClusterName::new(1, HierarchyLevel::BASE, 0)
    }

    #[test]
    fn highest_priority_wins() {
        let elector = HighestPriorityElector::new(Priority::new(5));
        let local = candidate(5, "a");
        assert_eq!(
            elector.decide(&base_cluster(), &local, &[candidate(3, "b"), candidate(4, "c")]),
            ElectionOutcome::Won
        );
        assert_eq!(
            elector.decide(&base_cluster(), &local, &[candidate(7, "b")]),
            ElectionOutcome::Lost
        );
    }

    #[test]
    fn ties_broken_by_address() {
        let elector = HighestPriorityElector::new(Priority::new(5));
        assert_eq!(
            elector.decide(&base_cluster(), &candidate(5, "b"), &[candidate(5, "a")]),
            ElectionOutcome::Won
        );
        assert_eq!(
            elector.decide(&base_cluster(), &candidate(5, "a"), &[candidate(5, "b")]),
            ElectionOutcome::Lost
        );
    }

    #[test]
    fn covered_peers_do_not_compete() {
        let mut elector = HighestPriorityElector::new(Priority::new(1));
        let local = candidate(1, "c");
        let peers = [candidate(2, "b")];
        assert_eq!(elector.decide(&base_cluster(), &local, &peers), ElectionOutcome::Lost);

        let changed = elector.on_announcement_received(
            HierarchyLevel::BASE,
            Priority::new(3),
            &NetworkAddress::new("a"),
            &[NetworkAddress::new("b")],
        );
        assert!(changed);
        assert_eq!(elector.decide(&base_cluster(), &local, &peers), ElectionOutcome::Won);

        assert!(elector.on_coordinator_invalidated(HierarchyLevel::BASE, &NetworkAddress::new("a")));
        assert_eq!(elector.decide(&base_cluster(), &local, &peers), ElectionOutcome::Lost);
    }

    #[test]
    fn coverage_is_per_level() {
        let mut elector = HighestPriorityElector::new(Priority::new(1));
        elector.on_announcement_received(
            HierarchyLevel::new(1),
            Priority::new(3),
            &NetworkAddress::new("a"),
            &[NetworkAddress::new("b")],
        );
        assert!(!elector.is_covered(HierarchyLevel::BASE, &NetworkAddress::new("b")));
        assert!(elector.is_covered(HierarchyLevel::new(1), &NetworkAddress::new("b")));
    }

    #[test]
    fn priorities_per_level() {
        let mut elector = HighestPriorityElector::new(Priority::new(4));
        elector.set_priority(HierarchyLevel::new(1), Priority::new(8));
        assert_eq!(elector.current_priority(HierarchyLevel::BASE), Priority::new(4));
        assert_eq!(elector.current_priority(HierarchyLevel::new(1)), Priority::new(8));
    }
}
