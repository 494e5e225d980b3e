//! Numeric sub-address bookkeeping of one cluster.
//!
//! Slots live in `[1, capacity)`. A slot is either used (owned by the local
//! node or by the member behind a channel) or free. Independently, a slot can
//! be reserved for a channel that explicitly asked for it; a reserved slot is
//! only ever handed to the reserving channel.

use std::collections::BTreeMap;

use crate::ids::ChannelId;
use crate::HierarchyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SlotOwner {
    /// The node hosting the cluster (base level only).
    Local,
    Channel(ChannelId),
}

#[derive(Debug, Clone)]
pub struct AddressPool {
    capacity: u32,
    used: BTreeMap<u32, SlotOwner>,
    reservations: BTreeMap<u32, ChannelId>,
}

impl AddressPool {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            used: BTreeMap::new(),
            reservations: BTreeMap::new(),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn in_range(&self, slot: u32) -> bool {
        slot >= 1 && slot < self.capacity
    }

    pub fn owner(&self, slot: u32) -> Option<SlotOwner> {
        self.used.get(&slot).copied()
    }

    pub fn reservation(&self, slot: u32) -> Option<ChannelId> {
        self.reservations.get(&slot).copied()
    }

    /// Whether `owner` may take `slot` right now.
    pub fn is_available_for(&self, slot: u32, owner: SlotOwner) -> bool {
        if !self.in_range(slot) {
            return false;
        }
        let free_or_own = match self.used.get(&slot) {
            None => true,
            Some(current) => *current == owner,
        };
        let unreserved_or_own = match (self.reservations.get(&slot), owner) {
            (None, _) => true,
            (Some(reserver), SlotOwner::Channel(ch)) => *reserver == ch,
            (Some(_), SlotOwner::Local) => false,
        };
        free_or_own && unreserved_or_own
    }

    /// Allocate a slot for `owner`. `preferred` is taken if available,
    /// otherwise the lowest free, unreserved slot.
    pub fn allocate(
        &mut self,
        owner: SlotOwner,
        preferred: Option<u32>,
    ) -> Result<u32, HierarchyError> {
        if let Some(slot) = preferred {
            if self.is_available_for(slot, owner) {
                self.used.insert(slot, owner);
                return Ok(slot);
            }
        }
        let slot = (1..self.capacity)
            .find(|s| !self.used.contains_key(s) && self.is_available_for(*s, owner))
            .ok_or(HierarchyError::AddressSpaceExhausted {
                capacity: self.capacity,
            })?;
        self.used.insert(slot, owner);
        Ok(slot)
    }

    /// Mark `slot` as used by `owner`, overriding any previous owner.
    pub fn claim(&mut self, slot: u32, owner: SlotOwner) -> Option<SlotOwner> {
        self.used.insert(slot, owner)
    }

    pub fn release(&mut self, slot: u32) -> Option<SlotOwner> {
        self.used.remove(&slot)
    }

    /// Release every slot owned by `owner`, returning them.
    pub fn release_owner(&mut self, owner: SlotOwner) -> Vec<u32> {
        let slots: Vec<u32> = self
            .used
            .iter()
            .filter(|(_, o)| **o == owner)
            .map(|(s, _)| *s)
            .collect();
        for slot in &slots {
            self.used.remove(slot);
        }
        slots
    }

    pub fn reserve(&mut self, slot: u32, channel: ChannelId) {
        self.reservations.insert(slot, channel);
    }

    pub fn release_reservations(&mut self, channel: ChannelId) -> usize {
        let before = self.reservations.len();
        self.reservations.retain(|_, c| *c != channel);
        before - self.reservations.len()
    }

    pub fn slots_of(&self, owner: SlotOwner) -> Vec<u32> {
        self.used
            .iter()
            .filter(|(_, o)| **o == owner)
            .map(|(s, _)| *s)
            .collect()
    }

    pub fn used_count(&self) -> usize {
        self.used.len()
    }

    pub fn reserved_count(&self) -> usize {
        self.reservations.len()
    }

    pub fn clear(&mut self) {
        self.used.clear();
        self.reservations.clear();
    }
}
