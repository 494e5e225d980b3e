//! Interface towards the routing/data plane.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use hrm_protocol::{Hrmid, NetworkAddress, RoutingEntry, RoutingTable};

/// Receives every address and route change the control plane makes.
pub trait RoutingSink: Send {
    fn add_route(&mut self, entry: &RoutingEntry);
    fn del_route(&mut self, entry: &RoutingEntry);
    fn map_address_to_network_address(&mut self, address: Hrmid, node: &NetworkAddress);
    fn unmap_address(&mut self, address: Hrmid);
}

/// Snapshot of everything pushed into a [`SharedRoutingTable`].
#[derive(Debug, Clone, Default)]
pub struct RoutingState {
    pub routes: RoutingTable,
    pub mappings: BTreeMap<Hrmid, NetworkAddress>,
}

/// In-memory routing sink whose state can be read from outside the
/// controller.
#[derive(Debug, Clone, Default)]
pub struct SharedRoutingTable {
    inner: Arc<Mutex<RoutingState>>,
}

impl SharedRoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> RoutingState {
        match self.inner.lock() {
            Ok(state) => state.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn lookup(&self, address: Hrmid) -> Option<NetworkAddress> {
        self.snapshot().mappings.get(&address).cloned()
    }

    fn with_state<F: FnOnce(&mut RoutingState)>(&self, f: F) {
        match self.inner.lock() {
            Ok(mut state) => f(&mut state),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

impl RoutingSink for SharedRoutingTable {
    fn add_route(&mut self, entry: &RoutingEntry) {
        self.with_state(|s| {
            s.routes.add(entry.clone());
        });
    }

    fn del_route(&mut self, entry: &RoutingEntry) {
        self.with_state(|s| {
            s.routes.remove(entry);
        });
    }

    fn map_address_to_network_address(&mut self, address: Hrmid, node: &NetworkAddress) {
        self.with_state(|s| {
            s.mappings.insert(address, node.clone());
        });
    }

    fn unmap_address(&mut self, address: Hrmid) {
        self.with_state(|s| {
            s.mappings.remove(&address);
        });
    }
}
