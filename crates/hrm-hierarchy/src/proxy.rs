//! Remote coordinators and clusters known only by reference.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use hrm_protocol::{ClusterName, HierarchyLevel, NetworkAddress, Priority};

use crate::clock::elapsed;

/// A remote coordinator learned from an announcement flood.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorProxy {
    pub name: ClusterName,
    pub node: NetworkAddress,
    pub priority: Priority,
    /// Cluster hops between the coordinator and this node.
    pub distance: u32,
    pub last_seen: DateTime<Utc>,
}

impl CoordinatorProxy {
    pub fn level(&self) -> HierarchyLevel {
        self.name.level
    }
}

/// A remote cluster this node holds a membership in.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterProxy {
    pub name: ClusterName,
    pub node: NetworkAddress,
    pub priority: Priority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyUpdate {
    New,
    Refreshed,
    /// Known before, but priority or distance changed.
    Changed,
}

#[derive(Debug, Default)]
pub struct ProxyTable {
    /// Keyed by (cluster id, level): a cluster has at most one coordinator.
    coordinators: BTreeMap<(u64, HierarchyLevel), CoordinatorProxy>,
}

impl ProxyTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(name: &ClusterName) -> (u64, HierarchyLevel) {
        (name.cluster_id, name.level)
    }

    pub fn refresh(
        &mut self,
        name: ClusterName,
        node: NetworkAddress,
        priority: Priority,
        distance: u32,
        now: DateTime<Utc>,
    ) -> ProxyUpdate {
        match self.coordinators.get_mut(&Self::key(&name)) {
            Some(existing) => {
                let changed = existing.priority != priority
                    || existing.name != name
                    || distance < existing.distance;
                existing.last_seen = now;
                existing.priority = priority;
                existing.name = name;
                existing.node = node;
                if distance < existing.distance {
                    existing.distance = distance;
                }
                if changed {
                    ProxyUpdate::Changed
                } else {
                    ProxyUpdate::Refreshed
                }
            }
            None => {
                self.coordinators.insert(
                    Self::key(&name),
                    CoordinatorProxy {
                        name,
                        node,
                        priority,
                        distance,
                        last_seen: now,
                    },
                );
                ProxyUpdate::New
            }
        }
    }

    pub fn remove(&mut self, name: &ClusterName) -> Option<CoordinatorProxy> {
        self.coordinators.remove(&Self::key(name))
    }

    pub fn get(&self, name: &ClusterName) -> Option<&CoordinatorProxy> {
        self.coordinators.get(&Self::key(name))
    }

    /// Coordinators at `level` within `radius` hops.
    pub fn at_level(&self, level: HierarchyLevel, radius: u32) -> Vec<CoordinatorProxy> {
        self.coordinators
            .values()
            .filter(|p| p.name.level == level && p.distance <= radius)
            .cloned()
            .collect()
    }

    /// Drop proxies not refreshed within `expiry`, returning them.
    pub fn expire(&mut self, now: DateTime<Utc>, expiry: Duration) -> Vec<CoordinatorProxy> {
        let expired: Vec<(u64, HierarchyLevel)> = self
            .coordinators
            .iter()
            .filter(|(_, p)| elapsed(p.last_seen, now, expiry))
            .map(|(k, _)| *k)
            .collect();
        expired
            .into_iter()
            .filter_map(|k| self.coordinators.remove(&k))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.coordinators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coordinators.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CoordinatorProxy> {
        self.coordinators.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coord(id: u64, level: u8, coord_id: u32) -> ClusterName {
        ClusterName::new(id, HierarchyLevel::new(level), coord_id)
    }

    #[test]
    fn refresh_reports_new_then_refreshed() {
        let mut table = ProxyTable::new();
        let now = Utc::now();
        let name = coord(1, 0, 5);
        let node = NetworkAddress::new("a");
        assert_eq!(
            table.refresh(name, node.clone(), Priority::new(3), 2, now),
            ProxyUpdate::New
        );
        assert_eq!(
            table.refresh(name, node.clone(), Priority::new(3), 2, now),
            ProxyUpdate::Refreshed
        );
        assert_eq!(
            table.refresh(name, node, Priority::new(3), 1, now),
            ProxyUpdate::Changed
        );
        assert_eq!(table.get(&name).unwrap().distance, 1);
    }

    #[test]
    fn new_coordinator_of_same_cluster_replaces_old() {
        let mut table = ProxyTable::new();
        let now = Utc::now();
        table.refresh(coord(1, 0, 5), NetworkAddress::new("a"), Priority::new(3), 1, now);
        table.refresh(coord(1, 0, 6), NetworkAddress::new("a"), Priority::new(3), 1, now);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&coord(1, 0, 0)).unwrap().name.coordinator_id, 6);
    }

    #[test]
    fn level_and_radius_filter() {
        let mut table = ProxyTable::new();
        let now = Utc::now();
        table.refresh(coord(1, 0, 5), NetworkAddress::new("a"), Priority::new(3), 1, now);
        table.refresh(coord(2, 0, 6), NetworkAddress::new("b"), Priority::new(3), 4, now);
        table.refresh(coord(3, 1, 7), NetworkAddress::new("c"), Priority::new(3), 1, now);
        assert_eq!(table.at_level(HierarchyLevel::BASE, 4).len(), 2);
        assert_eq!(table.at_level(HierarchyLevel::BASE, 3).len(), 1);
        assert_eq!(table.at_level(HierarchyLevel::new(1), 4).len(), 1);
    }

    #[test]
    fn stale_proxies_expire() {
        let mut table = ProxyTable::new();
        let now = Utc::now();
        table.refresh(coord(1, 0, 5), NetworkAddress::new("a"), Priority::new(3), 1, now);
        table.refresh(
            coord(2, 0, 6),
            NetworkAddress::new("b"),
            Priority::new(3),
            1,
            now + chrono::Duration::seconds(15),
        );
        let expired = table.expire(now + chrono::Duration::seconds(20), Duration::from_secs(20));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].node, NetworkAddress::new("a"));
        assert_eq!(table.len(), 1);
    }
}
