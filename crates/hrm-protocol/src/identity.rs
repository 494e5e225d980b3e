use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Identifier of a cluster, unique across the network.
pub type ClusterId = u64;

/// Identifier of a coordinator, unique across the network. Zero means "unknown".
pub type CoordinatorId = u32;

/// Physical (link-layer) address of a node, usable as a map key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NetworkAddress(pub String);

impl NetworkAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Depth of a cluster in the hierarchy. Level 0 is the base level.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct HierarchyLevel(u8);

impl HierarchyLevel {
    pub const BASE: HierarchyLevel = HierarchyLevel(0);

    pub fn new(level: u8) -> Self {
        Self(level)
    }

    /// Create a level and check it against the configured hierarchy depth.
    pub fn checked(level: u8, depth: u8) -> Result<Self, ProtocolError> {
        let result = Self(level);
        if result.is_valid(depth) {
            Ok(result)
        } else {
            Err(ProtocolError::InvalidLevel { level, depth })
        }
    }

    pub fn value(&self) -> u8 {
        self.0
    }

    pub fn is_base_level(&self) -> bool {
        self.0 == 0
    }

    pub fn is_higher_level(&self) -> bool {
        self.0 > 0
    }

    /// Whether this is the top level of a hierarchy with `depth` levels.
    pub fn is_highest(&self, depth: u8) -> bool {
        self.0.saturating_add(1) >= depth
    }

    pub fn is_valid(&self, depth: u8) -> bool {
        self.0 < depth
    }

    pub fn is_higher_than(&self, other: &HierarchyLevel) -> bool {
        self.0 > other.0
    }

    /// The next level up. Saturates at `u8::MAX`.
    pub fn inc(&self) -> HierarchyLevel {
        HierarchyLevel(self.0.saturating_add(1))
    }

    /// The next level down, or `None` at the base level.
    pub fn dec(&self) -> Option<HierarchyLevel> {
        self.0.checked_sub(1).map(HierarchyLevel)
    }
}

impl std::fmt::Display for HierarchyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Identity triple naming a cluster (and, once elected, its coordinator)
/// without carrying any entity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusterName {
    pub cluster_id: ClusterId,
    pub level: HierarchyLevel,
    pub coordinator_id: CoordinatorId,
}

impl ClusterName {
    pub fn new(cluster_id: ClusterId, level: HierarchyLevel, coordinator_id: CoordinatorId) -> Self {
        Self {
            cluster_id,
            level,
            coordinator_id,
        }
    }

    /// Placeholder destination used before the peer's entity is known:
    /// "whatever entity the peer runs at this level".
    pub fn wildcard(level: HierarchyLevel) -> Self {
        Self::new(0, level, 0)
    }

    pub fn is_wildcard(&self) -> bool {
        self.cluster_id == 0
    }

    pub fn has_coordinator(&self) -> bool {
        self.coordinator_id != 0
    }

    pub fn with_coordinator(&self, coordinator_id: CoordinatorId) -> Self {
        Self {
            coordinator_id,
            ..*self
        }
    }

    /// Same cluster at the same level, regardless of coordinator.
    pub fn same_cluster(&self, other: &ClusterName) -> bool {
        self.cluster_id == other.cluster_id && self.level == other.level
    }

    /// Coordinator ids agree, treating zero ("unknown") as matching anything.
    pub fn coordinator_compatible(&self, other: &ClusterName) -> bool {
        self.coordinator_id == 0
            || other.coordinator_id == 0
            || self.coordinator_id == other.coordinator_id
    }
}

impl std::fmt::Display for ClusterName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Cluster{}@{}(coord={})",
            self.cluster_id, self.level, self.coordinator_id
        )
    }
}

/// Election priority. Opaque and comparable; higher wins.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Priority(pub u64);

impl Priority {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn is_higher_than(&self, other: &Priority) -> bool {
        self.0 > other.0
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
