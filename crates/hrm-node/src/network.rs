//! In-memory network connecting simulated nodes.
//!
//! Every attached node gets an unbounded event channel. Links are
//! bidirectional; packets travel as serialized [`SessionPacket`] bytes and
//! are delivered only if the destination is reachable over the current links.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

use hrm_hierarchy::Transport;
use hrm_protocol::{NetworkAddress, Route, SessionPacket};

/// Events delivered to a node by the network.
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    /// A direct link to the peer came up.
    LinkUp(NetworkAddress),
    /// The direct link to the peer went down.
    LinkDown(NetworkAddress),
    /// A packet arrived.
    Packet { from: NetworkAddress, data: Vec<u8> },
}

#[derive(Default)]
struct NetworkState {
    endpoints: BTreeMap<NetworkAddress, mpsc::UnboundedSender<NetworkEvent>>,
    links: BTreeSet<(NetworkAddress, NetworkAddress)>,
}

impl NetworkState {
    fn notify(&self, node: &NetworkAddress, event: NetworkEvent) {
        if let Some(tx) = self.endpoints.get(node) {
            if tx.send(event).is_err() {
                tracing::debug!(node = %node, "Endpoint closed, event dropped");
            }
        }
    }

    /// Hops from `from` to `to`, excluding `from`.
    fn shortest_path(&self, from: &NetworkAddress, to: &NetworkAddress) -> Option<Vec<NetworkAddress>> {
        let mut previous: BTreeMap<NetworkAddress, NetworkAddress> = BTreeMap::new();
        let mut seen = BTreeSet::from([from.clone()]);
        let mut queue = VecDeque::from([from.clone()]);
        while let Some(current) = queue.pop_front() {
            if current == *to {
                let mut path = Vec::new();
                let mut cursor = current;
                while let Some(prev) = previous.get(&cursor) {
                    path.push(cursor.clone());
                    cursor = prev.clone();
                }
                path.reverse();
                return Some(path);
            }
            for (_, next) in self.links.iter().filter(|(a, _)| *a == current) {
                if seen.insert(next.clone()) {
                    previous.insert(next.clone(), current.clone());
                    queue.push_back(next.clone());
                }
            }
        }
        None
    }
}

/// Shared handle to the simulated network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, NetworkState> {
        match self.inner.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a node and return its transport and event stream.
    pub fn attach(
        &self,
        address: NetworkAddress,
    ) -> (MemoryTransport, mpsc::UnboundedReceiver<NetworkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state().endpoints.insert(address.clone(), tx);
        tracing::debug!(node = %address, "Node attached");
        let transport = MemoryTransport {
            local: address,
            network: self.clone(),
        };
        (transport, rx)
    }

    pub fn detach(&self, address: &NetworkAddress) {
        let neighbors = self.neighbors(address);
        for peer in neighbors {
            self.unlink(address, &peer);
        }
        self.state().endpoints.remove(address);
    }

    pub fn link(&self, a: &NetworkAddress, b: &NetworkAddress) {
        let mut state = self.state();
        let added = state.links.insert((a.clone(), b.clone()));
        state.links.insert((b.clone(), a.clone()));
        if added {
            tracing::info!(a = %a, b = %b, "Link up");
            state.notify(a, NetworkEvent::LinkUp(b.clone()));
            state.notify(b, NetworkEvent::LinkUp(a.clone()));
        }
    }

    pub fn unlink(&self, a: &NetworkAddress, b: &NetworkAddress) {
        let mut state = self.state();
        let removed = state.links.remove(&(a.clone(), b.clone()));
        state.links.remove(&(b.clone(), a.clone()));
        if removed {
            tracing::info!(a = %a, b = %b, "Link down");
            state.notify(a, NetworkEvent::LinkDown(b.clone()));
            state.notify(b, NetworkEvent::LinkDown(a.clone()));
        }
    }

    pub fn neighbors(&self, node: &NetworkAddress) -> Vec<NetworkAddress> {
        self.state()
            .links
            .iter()
            .filter(|(a, _)| a == node)
            .map(|(_, b)| b.clone())
            .collect()
    }

    pub fn route(&self, from: &NetworkAddress, to: &NetworkAddress) -> Option<Route> {
        self.state().shortest_path(from, to).map(Route)
    }

    fn deliver(&self, from: &NetworkAddress, to: &NetworkAddress, data: Vec<u8>) -> bool {
        let state = self.state();
        if state.shortest_path(from, to).is_none() || !state.endpoints.contains_key(to) {
            return false;
        }
        state.notify(
            to,
            NetworkEvent::Packet {
                from: from.clone(),
                data,
            },
        );
        true
    }
}

/// [`Transport`] of one node attached to a [`MemoryNetwork`].
pub struct MemoryTransport {
    local: NetworkAddress,
    network: MemoryNetwork,
}

impl Transport for MemoryTransport {
    fn local_address(&self) -> NetworkAddress {
        self.local.clone()
    }

    fn send(&mut self, peer: &NetworkAddress, packet: SessionPacket) -> bool {
        let data = match packet.to_bytes() {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(peer = %peer, error = %e, "Failed to encode packet");
                return false;
            }
        };
        self.network.deliver(&self.local, peer, data)
    }

    fn route_to(&self, peer: &NetworkAddress) -> Option<Route> {
        self.network.route(&self.local, peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> NetworkAddress {
        NetworkAddress::new(s)
    }

    #[test]
    fn link_notifies_both_ends_once() {
        let net = MemoryNetwork::new();
        let (_ta, mut ra) = net.attach(addr("a"));
        let (_tb, mut rb) = net.attach(addr("b"));
        net.link(&addr("a"), &addr("b"));
        net.link(&addr("b"), &addr("a"));

        assert!(matches!(ra.try_recv(), Ok(NetworkEvent::LinkUp(p)) if p == addr("b")));
        assert!(matches!(rb.try_recv(), Ok(NetworkEvent::LinkUp(p)) if p == addr("a")));
        assert!(ra.try_recv().is_err());
    }

    #[test]
    fn packets_follow_links() {
        let net = MemoryNetwork::new();
        let (mut ta, _ra) = net.attach(addr("a"));
        let (_tb, _rb) = net.attach(addr("b"));
        let (_tc, mut rc) = net.attach(addr("c"));
        let hello = SessionPacket::KeepAlive { sender: addr("a") };

        assert!(!ta.send(&addr("c"), hello.clone()));

        net.link(&addr("a"), &addr("b"));
        net.link(&addr("b"), &addr("c"));
        while rc.try_recv().is_ok() {}
        assert!(ta.send(&addr("c"), hello.clone()));
        match rc.try_recv() {
            Ok(NetworkEvent::Packet { from, data }) => {
                assert_eq!(from, addr("a"));
                assert_eq!(SessionPacket::from_bytes(&data).unwrap(), hello);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            ta.route_to(&addr("c")),
            Some(Route(vec![addr("b"), addr("c")]))
        );
    }

    #[test]
    fn unlink_cuts_reachability() {
        let net = MemoryNetwork::new();
        let (mut ta, _ra) = net.attach(addr("a"));
        let (_tb, mut rb) = net.attach(addr("b"));
        net.link(&addr("a"), &addr("b"));
        net.unlink(&addr("a"), &addr("b"));
        assert!(matches!(rb.try_recv(), Ok(NetworkEvent::LinkUp(_))));
        assert!(matches!(rb.try_recv(), Ok(NetworkEvent::LinkDown(_))));
        assert!(!ta.send(&addr("b"), SessionPacket::KeepAlive { sender: addr("a") }));
        assert!(net.neighbors(&addr("a")).is_empty());
    }
}
