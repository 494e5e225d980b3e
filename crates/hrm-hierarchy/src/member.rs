//! ClusterMember: this node's side of a membership in a (usually remote)
//! cluster.
//!
//! Base memberships make the node a member of a physical neighbor's base
//! cluster and yield node addresses. Coordinator memberships
//! (`CoordinatorAsMember`) connect a local coordinator to a superior
//! cluster one level up; the selected one yields the coordinator's address.

use chrono::{DateTime, Utc};
use tracing::{debug, info, trace, warn};

use hrm_protocol::{
    ClusterName, Envelope, HierarchyLevel, Hrmid, NetworkAddress, Priority, RoutingTable,
    SessionPacket, SignalingMessage, SignalingPacket,
};

use crate::channel::{ChannelParent, ChannelState};
use crate::controller::{arg_key, ArgLink, HrmController};
use crate::entity::EntityCore;
use crate::events::HierarchyEvent;
use crate::ids::{ChannelId, EntityId, SessionId};
use crate::proxy::ClusterProxy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipKind {
    Base,
    CoordinatorAsMember { coordinator: EntityId },
}

/// Coordinator of the remote cluster, learned from its announcements.
#[derive(Debug, Clone, PartialEq)]
pub struct SuperiorCandidate {
    pub name: ClusterName,
    pub node: NetworkAddress,
    pub priority: Priority,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ClusterMember {
    pub core: EntityCore,
    /// Local identity on the channel: the remote cluster's name for base
    /// memberships, the coordinator's name otherwise.
    pub name: ClusterName,
    pub kind: MembershipKind,
    pub remote: ClusterProxy,
    pub channel: Option<ChannelId>,
    pub superior: Option<SuperiorCandidate>,
    /// Routes last received through a route share.
    pub shared_routes: RoutingTable,
}

impl ClusterMember {
    pub fn is_base(&self) -> bool {
        self.kind == MembershipKind::Base
    }

    pub fn coordinator(&self) -> Option<EntityId> {
        match self.kind {
            MembershipKind::Base => None,
            MembershipKind::CoordinatorAsMember { coordinator } => Some(coordinator),
        }
    }
}

impl HrmController {
    /// A cluster asked to include one of our entities. Base requests are
    /// always accepted; coordinator requests need a matching local
    /// coordinator one level below the requesting cluster.
    pub(crate) fn handle_membership_request(&mut self, session: SessionId, envelope: Envelope) {
        let SignalingMessage::MembershipRequest {
            requesting,
            destination,
            priority,
        } = envelope.packet.message
        else {
            return;
        };
        let Some(peer) = self.sessions.get(&session).map(|s| s.peer.clone()) else {
            return;
        };
        let level = requesting.level;
        if !level.is_valid(self.config.depth) {
            self.deny_membership(session, requesting, destination, "invalid level");
            return;
        }

        let kind = match level.dec() {
            None => MembershipKind::Base,
            Some(inferior) => {
                let coordinator = self.coordinators.values().find(|c| {
                    c.level() == inferior
                        && c.name.same_cluster(&destination)
                        && c.name.coordinator_compatible(&destination)
                });
                match coordinator {
                    Some(c) => MembershipKind::CoordinatorAsMember {
                        coordinator: c.core.id,
                    },
                    None => {
                        self.deny_membership(session, requesting, destination, "no such coordinator");
                        return;
                    }
                }
            }
        };

        let existing = self
            .members
            .values()
            .find(|m| {
                m.kind == kind
                    && m.remote.name.same_cluster(&requesting)
                    && m.channel
                        .and_then(|ch| self.channels.get(&ch))
                        .is_some_and(|ch| ch.session == session)
            })
            .map(|m| m.core.id);
        if let Some(member) = existing {
            if let Some(m) = self.members.get_mut(&member) {
                m.remote.priority = priority;
                m.remote.name = requesting;
            }
            trace!(member = %member, cluster = %requesting, "Membership requested again");
            self.acknowledge_membership(member);
            return;
        }

        let now = self.now();
        let id = self.ids.next_entity_id();
        let name = match kind {
            MembershipKind::Base => requesting,
            MembershipKind::CoordinatorAsMember { coordinator } => match self.coordinators.get(&coordinator) {
                Some(c) => c.name,
                None => return,
            },
        };
        let own_priority = self.elector.current_priority(level);
        self.members.insert(
            id,
            ClusterMember {
                core: EntityCore::new(id, level, own_priority, now),
                name,
                kind,
                remote: ClusterProxy {
                    name: requesting,
                    node: peer.clone(),
                    priority,
                },
                channel: None,
                superior: None,
                shared_routes: RoutingTable::new(),
            },
        );
        let channel = self.create_channel(
            ChannelParent::Member(id),
            session,
            requesting,
            peer.clone(),
            ChannelState::Open,
            level.is_base_level(),
        );
        if let Some(ch) = self.channels.get_mut(&channel) {
            ch.peer_priority = priority;
        }
        self.muxer.register(session, requesting, name, channel);

        if let MembershipKind::CoordinatorAsMember { coordinator } = kind {
            if let Some(c) = self.coordinators.get_mut(&coordinator) {
                c.memberships.insert(id);
            }
            self.arg.add_undirected(
                arg_key(&name),
                arg_key(&requesting),
                ArgLink::Membership(channel),
            );
        }
        self.initialize_neighborhood(requesting);
        self.acknowledge_membership(id);
        if level.is_base_level() && !self.node_addresses.is_empty() {
            self.announce_addresses_on(channel);
        }

        if level.is_base_level() {
            let remembered = self
                .address_memory
                .get(&(requesting.cluster_id, level))
                .copied();
            if let Some(address) = remembered {
                debug!(cluster = %requesting, address = %address, "Requesting previous address");
                self.send_message(channel, SignalingMessage::RequestAddress { address });
            }
        }

        info!(node = %self.local, cluster = %requesting, peer = %peer, member = %name, "Joined cluster");
        self.emit(HierarchyEvent::ChannelEstablished {
            channel,
            local: name,
            peer: requesting,
            node: peer.clone(),
        });
        self.emit(HierarchyEvent::MembershipJoined {
            cluster: requesting,
            peer,
        });
        self.mark_hierarchy_changed();
    }

    fn deny_membership(
        &mut self,
        session: SessionId,
        requesting: ClusterName,
        destination: ClusterName,
        reason: &str,
    ) {
        warn!(cluster = %requesting, destination = %destination, reason, "Membership denied");
        let envelope = Envelope {
            source: destination,
            destination: requesting,
            packet: SignalingPacket::new(SignalingMessage::ClusterLeft {
                reason: reason.to_string(),
            }),
        };
        self.send_session(session, SessionPacket::Envelope(envelope));
    }

    /// Tell every cluster we are a base member of which addresses this node
    /// holds.
    pub(crate) fn announce_node_addresses(&mut self) {
        let channels: Vec<ChannelId> = self
            .members
            .values()
            .filter(|m| m.is_base())
            .filter_map(|m| m.channel)
            .collect();
        for channel in channels {
            self.announce_addresses_on(channel);
        }
    }

    fn announce_addresses_on(&mut self, channel: ChannelId) {
        let addresses: Vec<Hrmid> = self.node_addresses.keys().copied().collect();
        trace!(channel = %channel, count = addresses.len(), "Announcing node addresses");
        self.send_message(channel, SignalingMessage::AnnounceAddresses { addresses });
    }

    pub(crate) fn acknowledge_membership(&mut self, member: EntityId) {
        let Some(m) = self.members.get(&member) else {
            return;
        };
        let Some(channel) = m.channel else {
            return;
        };
        let source = m.name;
        let priority = self.elector.current_priority(m.core.level);
        self.send_message(channel, SignalingMessage::MembershipAck { source, priority });
    }

    pub(crate) fn handle_assign_address(&mut self, member: EntityId, channel: ChannelId, address: Hrmid) {
        let Some(m) = self.members.get_mut(&member) else {
            return;
        };
        m.core.hrmid = Some(address);
        let (kind, remote) = (m.kind, m.remote.name);
        self.address_memory
            .insert((remote.cluster_id, remote.level), address);
        if let Some(ch) = self.channels.get_mut(&channel) {
            ch.received.clear();
            ch.received.insert(address);
        }
        debug!(member = %member, cluster = %remote, address = %address, "Address received");

        match kind {
            MembershipKind::Base => {
                let stale: Vec<Hrmid> = self
                    .node_addresses
                    .iter()
                    .filter(|(a, granter)| **granter == member && **a != address)
                    .map(|(a, _)| *a)
                    .collect();
                for old in stale {
                    self.remove_node_address(old);
                }
                self.add_node_address(address, member);
            }
            MembershipKind::CoordinatorAsMember { coordinator } => {
                let selected = self
                    .coordinators
                    .get(&coordinator)
                    .and_then(|c| c.superior())
                    .is_some_and(|s| s.membership == member);
                if selected {
                    self.set_coordinator_address(coordinator, Some(address));
                } else {
                    trace!(member = %member, address = %address, "Address kept for unselected superior");
                }
            }
        }
    }

    pub(crate) fn handle_revoke_addresses(
        &mut self,
        member: EntityId,
        channel: ChannelId,
        addresses: &[Hrmid],
    ) {
        let Some(m) = self.members.get_mut(&member) else {
            return;
        };
        if m.core.hrmid.is_some_and(|a| addresses.contains(&a)) {
            m.core.hrmid = None;
        }
        let (kind, remote) = (m.kind, m.remote.name);
        let memory_key = (remote.cluster_id, remote.level);
        if self
            .address_memory
            .get(&memory_key)
            .is_some_and(|a| addresses.contains(a))
        {
            self.address_memory.remove(&memory_key);
        }
        if let Some(ch) = self.channels.get_mut(&channel) {
            ch.received.retain(|a| !addresses.contains(a));
        }
        debug!(member = %member, cluster = %remote, count = addresses.len(), "Addresses revoked");

        match kind {
            MembershipKind::Base => {
                for address in addresses {
                    if self.node_addresses.get(address) == Some(&member) {
                        self.remove_node_address(*address);
                    }
                }
            }
            MembershipKind::CoordinatorAsMember { coordinator } => {
                let Some(c) = self.coordinators.get(&coordinator) else {
                    return;
                };
                let selected = c.superior().is_some_and(|s| s.membership == member);
                let affected = c.core.hrmid.is_some_and(|a| addresses.contains(&a));
                if selected && affected {
                    self.set_coordinator_address(coordinator, None);
                }
            }
        }
    }

    /// Install the difference between the previous and the new share.
    pub(crate) fn handle_route_share(&mut self, member: EntityId, routes: &RoutingTable) {
        let Some(m) = self.members.get_mut(&member) else {
            return;
        };
        let previous = std::mem::replace(&mut m.shared_routes, routes.clone());
        let coordinator = m.coordinator();
        for entry in previous.iter().filter(|e| !routes.contains(e)) {
            self.routing.del_route(entry);
        }
        for entry in routes.iter().filter(|e| !previous.contains(e)) {
            self.routing.add_route(entry);
        }
        trace!(member = %member, routes = routes.len(), "Route share received");

        let Some(coordinator) = coordinator else {
            return;
        };
        if let Some(c) = self.coordinators.get_mut(&coordinator) {
            if c.superior().is_some_and(|s| s.membership == member) {
                c.shared_routes = routes.clone();
                c.routes_changed = true;
            }
        }
    }

    /// The membership ended (canceled, left, or its session died): drop the
    /// addresses and routes it granted and forget it.
    pub fn event_membership_lost(&mut self, member: EntityId) {
        let Some(m) = self.members.get(&member) else {
            return;
        };
        let (kind, name, remote, channel) = (m.kind, m.name, m.remote.name, m.channel);
        let shared: Vec<_> = m.shared_routes.iter().cloned().collect();

        let mut reselect = None;
        match kind {
            MembershipKind::Base => {
                let granted: Vec<Hrmid> = self
                    .node_addresses
                    .iter()
                    .filter(|(_, granter)| **granter == member)
                    .map(|(a, _)| *a)
                    .collect();
                for address in granted {
                    self.remove_node_address(address);
                }
            }
            MembershipKind::CoordinatorAsMember { coordinator } => {
                let Some(c) = self.coordinators.get_mut(&coordinator) else {
                    return self.forget_member(member, name, remote, channel);
                };
                c.memberships.remove(&member);
                if c.superior().is_some_and(|s| s.membership == member) {
                    c.replace_superior(None);
                    let coordinator_name = c.name;
                    self.set_coordinator_address(coordinator, None);
                    self.emit(HierarchyEvent::SuperiorSelected {
                        coordinator: coordinator_name,
                        superior: None,
                    });
                    reselect = Some(coordinator);
                }
            }
        }
        for entry in &shared {
            self.routing.del_route(entry);
        }
        self.forget_member(member, name, remote, channel);

        if let Some(coordinator) = reselect {
            self.select_superior(coordinator);
        }
    }

    fn forget_member(
        &mut self,
        member: EntityId,
        name: ClusterName,
        remote: ClusterName,
        channel: Option<ChannelId>,
    ) {
        let (key, remote_key) = (arg_key(&name), arg_key(&remote));
        if key != remote_key {
            self.arg.remove_undirected(&key, &remote_key);
        }
        if let Some(channel) = channel {
            self.unregister_channel(channel);
        }
        self.members.remove(&member);

        let still_used = self.clusters.values().any(|c| arg_key(&c.name) == remote_key)
            || self
                .members
                .values()
                .any(|m| arg_key(&m.remote.name) == remote_key || arg_key(&m.name) == remote_key)
            || self.coordinators.values().any(|c| arg_key(&c.name) == remote_key);
        if !still_used {
            self.arg.remove_node(&remote_key);
        }
        info!(node = %self.local, cluster = %remote, member = %member, "Membership lost");
        self.emit(HierarchyEvent::MembershipLost { cluster: remote });
        self.mark_hierarchy_changed();
    }

    /// Leave a membership on our own initiative.
    pub fn leave_membership(&mut self, member: EntityId, reason: &str) {
        let Some(channel) = self.members.get(&member).and_then(|m| m.channel) else {
            self.event_membership_lost(member);
            return;
        };
        self.send_message(
            channel,
            SignalingMessage::ClusterLeft {
                reason: reason.to_string(),
            },
        );
        self.event_membership_lost(member);
    }

    /// Memberships of the local coordinator at `level` in superior
    /// clusters.
    pub fn coordinator_memberships(&self, level: HierarchyLevel) -> Vec<&ClusterMember> {
        self.members
            .values()
            .filter(|m| {
                m.coordinator()
                    .and_then(|c| self.coordinators.get(&c))
                    .is_some_and(|c| c.level() == level)
            })
            .collect()
    }
}
