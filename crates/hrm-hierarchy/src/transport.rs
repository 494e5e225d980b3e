//! Interface towards the physical transport.

use hrm_protocol::{NetworkAddress, Route, SessionPacket};

pub trait Transport: Send {
    fn local_address(&self) -> NetworkAddress;

    /// Hand a packet to the transport. Returns false if the peer is not
    /// reachable.
    fn send(&mut self, peer: &NetworkAddress, packet: SessionPacket) -> bool;

    fn route_to(&self, peer: &NetworkAddress) -> Option<Route>;
}
