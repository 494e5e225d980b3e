//! Hierarchical addresses (HRMIDs).
//!
//! An HRMID packs one numeric component per hierarchy level into a `u64`,
//! `HRMID_BITS_PER_LEVEL` bits each, with level 0 in the lowest bits. A
//! cluster at level `L` hands out component `L`; everything above `L` is the
//! prefix inherited from the cluster's own coordinator address.

use serde::{Deserialize, Serialize};

use crate::constants::{HRMID_BITS_PER_LEVEL, MAX_HIERARCHY_DEPTH};
use crate::error::ProtocolError;
use crate::identity::HierarchyLevel;

const COMPONENT_MASK: u64 = (1u64 << HRMID_BITS_PER_LEVEL) - 1;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Hrmid(pub u64);

impl Hrmid {
    pub const ZERO: Hrmid = Hrmid(0);

    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Build an address from components given highest level first, e.g.
    /// `[1, 2, 3]` for a 3-level hierarchy yields `1.2.3`.
    pub fn from_components(components: &[u32]) -> Result<Self, ProtocolError> {
        if components.len() > MAX_HIERARCHY_DEPTH as usize {
            return Err(ProtocolError::InvalidAddress(format!(
                "{} components exceed the maximum depth {}",
                components.len(),
                MAX_HIERARCHY_DEPTH
            )));
        }
        let mut result = Hrmid::ZERO;
        for (i, value) in components.iter().rev().enumerate() {
            result = result.with_level_address(HierarchyLevel::new(i as u8), *value)?;
        }
        Ok(result)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    fn shift(level: HierarchyLevel) -> u32 {
        level.value() as u32 * HRMID_BITS_PER_LEVEL
    }

    /// The numeric component of `level`.
    pub fn level_address(&self, level: HierarchyLevel) -> u32 {
        if level.value() >= MAX_HIERARCHY_DEPTH {
            return 0;
        }
        ((self.0 >> Self::shift(level)) & COMPONENT_MASK) as u32
    }

    /// Copy of this address with the component of `level` replaced.
    pub fn with_level_address(
        &self,
        level: HierarchyLevel,
        value: u32,
    ) -> Result<Hrmid, ProtocolError> {
        if level.value() >= MAX_HIERARCHY_DEPTH || value as u64 > COMPONENT_MASK {
            return Err(ProtocolError::AddressOutOfRange {
                level: level.value(),
                value,
            });
        }
        let shift = Self::shift(level);
        let cleared = self.0 & !(COMPONENT_MASK << shift);
        Ok(Hrmid(cleared | ((value as u64) << shift)))
    }

    /// Clears all components at or below `level`.
    pub fn prefix_above(&self, level: HierarchyLevel) -> Hrmid {
        let bits = (level.value() as u32 + 1) * HRMID_BITS_PER_LEVEL;
        if bits >= u64::BITS {
            return Hrmid::ZERO;
        }
        Hrmid(self.0 & !((1u64 << bits) - 1))
    }

    /// Whether any component strictly below `level` is non-zero.
    pub fn has_components_below(&self, level: HierarchyLevel) -> bool {
        let bits = level.value() as u32 * HRMID_BITS_PER_LEVEL;
        if bits == 0 {
            return false;
        }
        if bits >= u64::BITS {
            return self.0 != 0;
        }
        self.0 & ((1u64 << bits) - 1) != 0
    }

    /// Whether this address lies inside the cluster address `cluster` of a
    /// cluster at `level` (same prefix above `level`).
    pub fn is_within(&self, cluster: &Hrmid, level: HierarchyLevel) -> bool {
        self.prefix_above(level) == cluster.prefix_above(level)
    }

    /// Address of the cluster this address belongs to at `level`: the
    /// component of `level` and everything below cleared.
    pub fn cluster_address(&self, level: HierarchyLevel) -> Hrmid {
        self.prefix_above(level)
    }

    /// Render with `depth` components, highest level first.
    pub fn to_dotted(&self, depth: u8) -> String {
        (0..depth.max(1))
            .rev()
            .map(|l| self.level_address(HierarchyLevel::new(l)).to_string())
            .collect::<Vec<_>>()
            .join(".")
    }
}

impl std::fmt::Display for Hrmid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut depth = 1u8;
        for l in 1..MAX_HIERARCHY_DEPTH {
            if self.level_address(HierarchyLevel::new(l)) != 0 {
                depth = l + 1;
            }
        }
        write!(f, "{}", self.to_dotted(depth.max(crate::DEFAULT_HIERARCHY_DEPTH)))
    }
}

impl std::str::FromStr for Hrmid {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let components = s
            .split('.')
            .map(|part| {
                part.trim()
                    .parse::<u32>()
                    .map_err(|_| ProtocolError::InvalidAddress(s.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Hrmid::from_components(&components)
    }
}
