//! Deterministic in-memory network of controllers driven by a manual clock.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;

use hrm_hierarchy::{
    Elector, HierarchyConfig, HrmController, ManualClock, SharedRoutingTable, Transport,
};
use hrm_protocol::{Hrmid, NetworkAddress, Route, SessionPacket};

const MAX_ROUNDS: usize = 10_000;
const MAX_TICKS: usize = 50;

type Wire = Arc<Mutex<VecDeque<(NetworkAddress, NetworkAddress, SessionPacket)>>>;
type Links = Arc<Mutex<BTreeSet<(NetworkAddress, NetworkAddress)>>>;

fn shortest_path(
    links: &BTreeSet<(NetworkAddress, NetworkAddress)>,
    from: &NetworkAddress,
    to: &NetworkAddress,
) -> Option<Vec<NetworkAddress>> {
    let mut previous: BTreeMap<NetworkAddress, NetworkAddress> = BTreeMap::new();
    let mut queue = VecDeque::from([from.clone()]);
    let mut seen = BTreeSet::from([from.clone()]);
    while let Some(current) = queue.pop_front() {
        if current == *to {
            let mut path = vec![current.clone()];
            let mut cursor = current;
            while let Some(prev) = previous.get(&cursor) {
                path.push(prev.clone());
                cursor = prev.clone();
            }
            path.reverse();
            return Some(path.into_iter().skip(1).collect());
        }
        for (a, b) in links.iter().filter(|(a, _)| *a == current) {
            if seen.insert(b.clone()) {
                previous.insert(b.clone(), a.clone());
                queue.push_back(b.clone());
            }
        }
    }
    None
}

struct WireTransport {
    local: NetworkAddress,
    wire: Wire,
    links: Links,
}

impl Transport for WireTransport {
    fn local_address(&self) -> NetworkAddress {
        self.local.clone()
    }

    fn send(&mut self, peer: &NetworkAddress, packet: SessionPacket) -> bool {
        let reachable = shortest_path(&self.links.lock().unwrap(), &self.local, peer).is_some();
        if reachable {
            self.wire
                .lock()
                .unwrap()
                .push_back((self.local.clone(), peer.clone(), packet));
        }
        reachable
    }

    fn route_to(&self, peer: &NetworkAddress) -> Option<Route> {
        shortest_path(&self.links.lock().unwrap(), &self.local, peer).map(Route)
    }
}

pub struct TestNetwork {
    pub clock: ManualClock,
    nodes: BTreeMap<String, HrmController>,
    routing: BTreeMap<String, SharedRoutingTable>,
    wire: Wire,
    links: Links,
    muted: BTreeSet<NetworkAddress>,
}

impl TestNetwork {
    /// Nodes named by `(address, priority)` using the immediate config.
    pub fn new(nodes: &[(&str, u64)]) -> Self {
        Self::with_config(nodes, HierarchyConfig::immediate())
    }

    pub fn with_config(nodes: &[(&str, u64)], config: HierarchyConfig) -> Self {
        let clock = ManualClock::new(Utc::now());
        let wire: Wire = Arc::default();
        let links: Links = Arc::default();
        let mut controllers = BTreeMap::new();
        let mut routing = BTreeMap::new();
        for (name, priority) in nodes {
            let transport = WireTransport {
                local: NetworkAddress::new(*name),
                wire: wire.clone(),
                links: links.clone(),
            };
            let table = SharedRoutingTable::new();
            let controller = HrmController::new(
                HierarchyConfig {
                    priority: *priority,
                    ..config.clone()
                },
                Box::new(transport),
            )
            .unwrap()
            .with_clock(Arc::new(clock.clone()))
            .with_routing(Box::new(table.clone()));
            controllers.insert(name.to_string(), controller);
            routing.insert(name.to_string(), table);
        }
        Self {
            clock,
            nodes: controllers,
            routing,
            wire,
            links,
            muted: BTreeSet::new(),
        }
    }

    pub fn node(&self, name: &str) -> &HrmController {
        self.nodes.get(name).expect("unknown node")
    }

    pub fn node_mut(&mut self, name: &str) -> &mut HrmController {
        self.nodes.get_mut(name).expect("unknown node")
    }

    /// Swap the election policy of `name`. Call before linking.
    pub fn set_elector(&mut self, name: &str, elector: Box<dyn Elector>) {
        let node = self.nodes.remove(name).expect("unknown node");
        self.nodes.insert(name.to_string(), node.with_elector(elector));
    }

    pub fn routing(&self, name: &str) -> &SharedRoutingTable {
        self.routing.get(name).expect("unknown node")
    }

    pub fn addresses(&self, name: &str) -> Vec<Hrmid> {
        self.node(name).node_addresses()
    }

    pub fn link(&mut self, a: &str, b: &str) {
        let (na, nb) = (NetworkAddress::new(a), NetworkAddress::new(b));
        {
            let mut links = self.links.lock().unwrap();
            links.insert((na.clone(), nb.clone()));
            links.insert((nb.clone(), na.clone()));
        }
        self.node_mut(a).on_peer_connected(&nb);
        self.node_mut(b).on_peer_connected(&na);
    }

    pub fn unlink(&mut self, a: &str, b: &str) {
        let (na, nb) = (NetworkAddress::new(a), NetworkAddress::new(b));
        {
            let mut links = self.links.lock().unwrap();
            links.remove(&(na.clone(), nb.clone()));
            links.remove(&(nb.clone(), na.clone()));
        }
        self.node_mut(a).on_peer_disconnected(&nb);
        self.node_mut(b).on_peer_disconnected(&na);
    }

    /// Drop everything sent from or to `name` from now on.
    pub fn mute(&mut self, name: &str) {
        self.muted.insert(NetworkAddress::new(name));
    }

    fn wire_is_empty(&self) -> bool {
        self.wire.lock().unwrap().is_empty()
    }

    /// Deliver and process until nothing moves.
    pub fn settle(&mut self) {
        for _ in 0..MAX_ROUNDS {
            let mut progressed = false;
            for node in self.nodes.values_mut() {
                progressed |= node.process_all() > 0;
            }
            let batch: Vec<_> = self.wire.lock().unwrap().drain(..).collect();
            progressed |= !batch.is_empty();
            for (from, to, packet) in batch {
                if self.muted.contains(&from) || self.muted.contains(&to) {
                    continue;
                }
                if let Some(node) = self.nodes.get_mut(to.as_str()) {
                    node.receive(&from, packet);
                }
            }
            if !progressed {
                return;
            }
        }
        panic!("network did not settle");
    }

    pub fn tick_all(&mut self) {
        for node in self.nodes.values_mut() {
            node.tick();
        }
    }

    /// Alternate settling and timer ticks until a tick sends nothing.
    pub fn converge(&mut self) {
        for _ in 0..MAX_TICKS {
            self.settle();
            self.tick_all();
            if self.wire_is_empty() {
                return;
            }
        }
        panic!("network did not converge");
    }

    pub fn advance(&mut self, by: Duration) {
        self.clock.advance(by);
    }

    pub fn all_addresses(&self) -> Vec<Hrmid> {
        self.nodes.values().flat_map(|n| n.node_addresses()).collect()
    }
}
