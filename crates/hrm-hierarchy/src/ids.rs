//! Stable identifiers for the entity arena and the allocator that hands
//! out network-unique cluster and coordinator ids.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use hrm_protocol::{ClusterId, CoordinatorId, NetworkAddress};

/// Local handle of a Cluster, Coordinator or ClusterMember.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub u64);

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "E{}", self.0)
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CH{}", self.0)
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "S{}", self.0)
    }
}

/// Per-controller id source. Cluster and coordinator ids embed the node
/// seed so two nodes with different seeds never collide.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    seed: u32,
    next_cluster: u32,
    next_coordinator: u16,
    next_local: u64,
}

impl IdAllocator {
    pub fn new(seed: u32) -> Self {
        Self {
            seed,
            next_cluster: 1,
            next_coordinator: 1,
            next_local: 1,
        }
    }

    /// Seed derived from the node's network address.
    pub fn from_address(address: &NetworkAddress) -> Self {
        let mut hasher = DefaultHasher::new();
        address.hash(&mut hasher);
        Self::new((hasher.finish() as u32).max(1))
    }

    pub fn seed(&self) -> u32 {
        self.seed
    }

    pub fn next_cluster_id(&mut self) -> ClusterId {
        let id = ((self.seed as u64) << 32) | self.next_cluster as u64;
        self.next_cluster = self.next_cluster.wrapping_add(1).max(1);
        id
    }

    /// Coordinator ids are never zero; zero means "unknown" on the wire.
    pub fn next_coordinator_id(&mut self) -> CoordinatorId {
        let id = ((self.seed & 0xFFFF) << 16) | self.next_coordinator as u32;
        self.next_coordinator = self.next_coordinator.wrapping_add(1).max(1);
        id
    }

    fn next_local(&mut self) -> u64 {
        let id = self.next_local;
        self.next_local += 1;
        id
    }

    pub fn next_entity_id(&mut self) -> EntityId {
        EntityId(self.next_local())
    }

    pub fn next_channel_id(&mut self) -> ChannelId {
        ChannelId(self.next_local())
    }

    pub fn next_session_id(&mut self) -> SessionId {
        SessionId(self.next_local())
    }
}
