//! Cluster: membership admission and hierarchical address distribution.
//!
//! A node hosts at most one valid cluster per level. The cluster collects
//! members over channels, feeds their priorities into elections and, once a
//! local coordinator exists, hands out one numeric slot of its address space
//! to every member (and to the node itself at base level).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, trace, warn};

use hrm_protocol::{
    ClusterName, HierarchyLevel, Hrmid, NetworkAddress, Priority, RoutingEntry, SignalingMessage,
};

use crate::address_pool::{AddressPool, SlotOwner};
use crate::channel::{ChannelParent, ChannelState};
use crate::clock::elapsed;
use crate::controller::{arg_key, ArgLink, HrmController};
use crate::election::ElectionOutcome;
use crate::entity::EntityCore;
use crate::events::HierarchyEvent;
use crate::ids::{ChannelId, EntityId, SessionId};
use crate::HierarchyError;

#[derive(Debug, Clone)]
pub struct Cluster {
    pub core: EntityCore,
    pub name: ClusterName,
    pub coordinator: Option<EntityId>,
    pub election: ElectionOutcome,
    /// Inferior coordinators connected as members, by their name.
    pub inferior_coordinators: BTreeMap<ClusterName, ChannelId>,
    pub pool: AddressPool,
    /// The node's own address (base level only).
    pub local_address: Option<Hrmid>,
    pub distribution_due: Option<DateTime<Utc>>,
    pub(crate) election_dirty: bool,
    reconciling: bool,
    reconcile_again: bool,
}

impl Cluster {
    pub fn new(core: EntityCore, name: ClusterName, capacity: u32) -> Self {
        Self {
            core,
            name,
            coordinator: None,
            election: ElectionOutcome::Pending,
            inferior_coordinators: BTreeMap::new(),
            pool: AddressPool::new(capacity),
            local_address: None,
            distribution_due: None,
            election_dirty: true,
            reconciling: false,
            reconcile_again: false,
        }
    }

    pub fn level(&self) -> HierarchyLevel {
        self.core.level
    }

    pub fn has_coordinator(&self) -> bool {
        self.coordinator.is_some()
    }

    /// Cluster address: the coordinator's address, firm once assigned by
    /// the superior cluster.
    pub fn address(&self) -> Option<Hrmid> {
        self.core.hrmid
    }
}

impl HrmController {
    pub(crate) fn local_cluster_at(&self, level: HierarchyLevel) -> Option<EntityId> {
        self.clusters
            .values()
            .find(|c| c.core.is_valid() && c.level() == level)
            .map(|c| c.core.id)
    }

    pub(crate) fn ensure_base_cluster(&mut self) -> EntityId {
        match self.local_cluster_at(HierarchyLevel::BASE) {
            Some(id) => id,
            None => self.create_cluster(HierarchyLevel::BASE),
        }
    }

    pub(crate) fn create_cluster(&mut self, level: HierarchyLevel) -> EntityId {
        let now = self.now();
        let id = self.ids.next_entity_id();
        let name = ClusterName::new(self.ids.next_cluster_id(), level, 0);
        let priority = self.elector.current_priority(level);
        let cluster = Cluster::new(
            EntityCore::new(id, level, priority, now),
            name,
            self.config.addresses_per_level,
        );
        self.clusters.insert(id, cluster);
        self.initialize_neighborhood(name);
        info!(node = %self.local, cluster = %name, "Cluster created");
        self.emit(HierarchyEvent::ClusterCreated { cluster: name });
        self.mark_hierarchy_changed();
        id
    }

    /// Link `name` in the ARG to every other local entity of its level.
    pub fn initialize_neighborhood(&mut self, name: ClusterName) {
        let key = arg_key(&name);
        self.arg.add_node(key);
        let others: Vec<ClusterName> = self
            .clusters
            .values()
            .filter(|c| c.core.is_valid() && c.level() == name.level)
            .map(|c| arg_key(&c.name))
            .chain(
                self.members
                    .values()
                    .filter(|m| m.remote.name.level == name.level)
                    .map(|m| arg_key(&m.remote.name)),
            )
            .filter(|other| *other != key)
            .collect();
        for other in others {
            self.arg.add_undirected(key, other, ArgLink::Neighbor);
        }
    }

    /// Ask the peer behind `session` to join `cluster`. Idempotent: an
    /// existing channel to the same peer is returned, with its remote
    /// identity refreshed.
    pub fn request_membership(
        &mut self,
        cluster: EntityId,
        session: SessionId,
        destination: ClusterName,
    ) -> Result<ChannelId, HierarchyError> {
        let c = self
            .clusters
            .get(&cluster)
            .filter(|c| c.core.is_valid())
            .ok_or_else(|| HierarchyError::UnknownEntity(cluster.to_string()))?;
        let (name, level) = (c.name, c.level());
        let peer_address = self
            .sessions
            .get(&session)
            .map(|s| s.peer.clone())
            .ok_or_else(|| HierarchyError::UnknownSession(session.to_string()))?;

        let existing = c.core.channels().iter().copied().find(|id| {
            self.channels.get(id).is_some_and(|ch| {
                ch.session == session
                    && !ch.is_closed()
                    && (destination.is_wildcard() || ch.peer_name.same_cluster(&destination))
            })
        });
        if let Some(existing) = existing {
            if let Some(ch) = self.channels.get_mut(&existing) {
                if destination.has_coordinator() && ch.peer_name != destination {
                    ch.peer_name = destination;
                }
            }
            trace!(cluster = %name, peer = %peer_address, channel = %existing, "Membership already requested");
            return Ok(existing);
        }

        let channel = self.create_channel(
            ChannelParent::Cluster(cluster),
            session,
            destination,
            peer_address.clone(),
            ChannelState::HalfOpen,
            level.is_base_level(),
        );
        let priority = self.elector.current_priority(level);
        self.send_message(
            channel,
            SignalingMessage::MembershipRequest {
                requesting: name,
                destination,
                priority,
            },
        );
        debug!(cluster = %name, peer = %peer_address, destination = %destination, "Membership requested");
        Ok(channel)
    }

    pub(crate) fn handle_membership_ack(
        &mut self,
        channel: ChannelId,
        source: ClusterName,
        priority: Priority,
    ) {
        let Some(ch) = self.channels.get_mut(&channel) else {
            return;
        };
        ch.peer_name = source;
        ch.peer_priority = priority;
        let session = ch.session;
        let opened = match ch.open() {
            Ok(opened) => opened,
            Err(e) => {
                warn!(channel = %channel, error = %e, "Acknowledgement on closed channel");
                return;
            }
        };
        if let Some(local) = self.channel_local_name(channel) {
            self.muxer.register(session, source, local, channel);
        }
        if opened {
            self.event_cluster_member_joined(channel);
        } else if let Some(cluster) = self.cluster_of_channel(channel) {
            trace!(channel = %channel, "Duplicate acknowledgement");
            if let Some(c) = self.clusters.get_mut(&cluster) {
                c.election_dirty = true;
            }
        }
    }

    /// A member acknowledged: link it in the ARG, re-run the election and
    /// give it an address if a local coordinator exists.
    pub fn event_cluster_member_joined(&mut self, channel: ChannelId) {
        let Some(cluster_id) = self.cluster_of_channel(channel) else {
            return;
        };
        let Some((peer, peer_address)) = self
            .channels
            .get(&channel)
            .map(|ch| (ch.peer_name, ch.peer_address.clone()))
        else {
            return;
        };
        let Some(cluster) = self.clusters.get_mut(&cluster_id) else {
            return;
        };
        if cluster.level().is_higher_level() {
            cluster.inferior_coordinators.insert(peer, channel);
        }
        cluster.election_dirty = true;
        let (name, coordinator) = (cluster.name, cluster.coordinator);

        let (key, peer_key) = (arg_key(&name), arg_key(&peer));
        if key != peer_key {
            self.arg
                .add_undirected(key, peer_key, ArgLink::Membership(channel));
        }
        info!(node = %self.local, cluster = %name, peer = %peer_address, member = %peer, "Cluster member joined");
        self.emit(HierarchyEvent::ChannelEstablished {
            channel,
            local: name,
            peer,
            node: peer_address,
        });
        self.mark_hierarchy_changed();

        if let Some(coordinator) = coordinator {
            self.announce_on_channel(coordinator, channel);
            let needs_address = self
                .channels
                .get(&channel)
                .is_some_and(|ch| ch.link_active && ch.assigned.is_empty());
            if needs_address {
                self.event_cluster_member_needs_hrmid(channel, "member joined");
            }
        }
    }

    /// The member listed every address its node holds.
    pub(crate) fn handle_announced_addresses(&mut self, channel: ChannelId, addresses: &[Hrmid]) {
        let Some(ch) = self.channels.get_mut(&channel) else {
            return;
        };
        ch.peer_announced = addresses.iter().copied().collect();
        trace!(channel = %channel, peer = %ch.peer_address, count = addresses.len(), "Peer addresses announced");
    }

    /// The member (de)selected this cluster as its superior.
    pub(crate) fn handle_link_activation(&mut self, channel: ChannelId, active: bool) {
        let Some(cluster_id) = self.cluster_of_channel(channel) else {
            return;
        };
        let Some(ch) = self.channels.get_mut(&channel) else {
            return;
        };
        if ch.link_active == active {
            return;
        }
        debug!(channel = %channel, active, "Link activation changed");
        if active {
            ch.link_active = true;
            self.event_cluster_member_needs_hrmid(channel, "link activated");
        } else {
            let assigned: Vec<Hrmid> = ch.assigned.iter().copied().collect();
            self.revoke_from_channel(cluster_id, channel, &assigned, true);
            if let Some(ch) = self.channels.get_mut(&channel) {
                ch.link_active = false;
            }
            if let Some(c) = self.clusters.get_mut(&cluster_id) {
                c.pool.release_reservations(channel);
            }
        }
    }

    /// A member asked for a specific address. The requester wins: current
    /// holders are revoked and reassigned afterwards.
    pub fn event_received_requested_hrmid(&mut self, channel: ChannelId, requested: Hrmid) {
        let Some(cluster_id) = self.cluster_of_channel(channel) else {
            return;
        };
        let Some(cluster) = self.clusters.get(&cluster_id) else {
            return;
        };
        let (name, level, firm) = (cluster.name, cluster.level(), cluster.address());
        let usable = self
            .channels
            .get(&channel)
            .is_some_and(|ch| ch.is_open() && ch.link_active);
        let ready = cluster.has_coordinator()
            && usable
            && (firm.is_some() || self.config.distribute_relative_addresses);
        if !ready {
            if let Some(ch) = self.channels.get_mut(&channel) {
                ch.peer_hrmid = Some(requested);
            }
            debug!(cluster = %name, requested = %requested, "Address request kept for next distribution");
            return;
        }

        let prefix = firm.unwrap_or(Hrmid::ZERO);
        let slot = requested.level_address(level);
        let valid = cluster.pool.in_range(slot)
            && requested.prefix_above(level) == prefix
            && !requested.has_components_below(level);
        let reserved_elsewhere = cluster
            .pool
            .reservation(slot)
            .is_some_and(|holder| holder != channel);
        if !valid || reserved_elsewhere {
            debug!(cluster = %name, requested = %requested, valid, reserved_elsewhere, "Address request refused");
            self.reassert_address(cluster_id, channel);
            return;
        }

        let displaced: Vec<ChannelId> = cluster
            .core
            .channels()
            .iter()
            .copied()
            .filter(|other| *other != channel)
            .filter(|other| {
                cluster.pool.owner(slot) == Some(SlotOwner::Channel(*other))
                    || self
                        .channels
                        .get(other)
                        .is_some_and(|ch| ch.assigned.contains(&requested))
            })
            .collect();
        let local_displaced = cluster.pool.owner(slot) == Some(SlotOwner::Local);

        if let Some(c) = self.clusters.get_mut(&cluster_id) {
            c.pool.reserve(slot, channel);
        }
        for other in &displaced {
            self.revoke_from_channel(cluster_id, *other, &[requested], false);
        }
        if local_displaced {
            self.drop_local_address(cluster_id);
        }
        info!(cluster = %name, address = %requested, displaced = displaced.len(), "Granting requested address");
        self.assign_address(cluster_id, channel, slot, requested);

        for other in displaced {
            self.event_cluster_member_needs_hrmid(other, "displaced by address request");
        }
        if local_displaced {
            self.assign_local_address(cluster_id);
        }
    }

    fn reassert_address(&mut self, cluster_id: EntityId, channel: ChannelId) {
        let Some(name) = self.clusters.get(&cluster_id).map(|c| c.name) else {
            return;
        };
        let current = self
            .channels
            .get(&channel)
            .and_then(|ch| ch.assigned.iter().next().copied().map(|a| (a, ch.peer_name)));
        match current {
            Some((address, receiver)) => {
                self.send_message(
                    channel,
                    SignalingMessage::AssignAddress {
                        sender: name,
                        receiver,
                        address,
                    },
                );
            }
            None => self.event_cluster_member_needs_hrmid(channel, "address request refused"),
        }
    }

    /// Hand out addresses to the node (base level) and every active member.
    /// Postponed while the hierarchy is still settling.
    pub fn distribute_addresses(&mut self, cluster_id: EntityId) {
        let now = self.now();
        let settle = self.config.address_settle();
        let changed = self.last_hierarchy_change;
        let Some(cluster) = self.clusters.get_mut(&cluster_id) else {
            return;
        };
        if !cluster.core.is_valid() || !cluster.has_coordinator() {
            return;
        }
        if !elapsed(changed, now, settle) {
            let settle = chrono::Duration::from_std(settle).unwrap_or_else(|_| chrono::Duration::zero());
            cluster.distribution_due = Some(changed + settle);
            trace!(cluster = %cluster.name, "Hierarchy settling, distribution scheduled");
            return;
        }
        if cluster.distribution_due.is_some_and(|due| now < due) {
            return;
        }
        cluster.distribution_due = None;
        let (name, level) = (cluster.name, cluster.level());
        let channels = cluster.core.channels().to_vec();
        debug!(cluster = %name, members = channels.len(), "Distributing addresses");

        if level.is_base_level() {
            self.assign_local_address(cluster_id);
        }
        for channel in channels {
            let active = self
                .channels
                .get(&channel)
                .is_some_and(|ch| ch.is_open() && ch.link_active);
            if active {
                self.event_cluster_member_needs_hrmid(channel, "address distribution");
            }
        }
    }

    pub(crate) fn run_scheduled_distributions(&mut self, now: DateTime<Utc>) {
        let due: Vec<EntityId> = self
            .clusters
            .values()
            .filter(|c| c.distribution_due.is_some_and(|due| now >= due))
            .map(|c| c.core.id)
            .collect();
        for cluster in due {
            self.distribute_addresses(cluster);
        }
    }

    /// Give the member behind `channel` an address: its prior slot when
    /// reusable, else the lowest free one.
    pub fn event_cluster_member_needs_hrmid(&mut self, channel: ChannelId, cause: &str) {
        let Some(cluster_id) = self.cluster_of_channel(channel) else {
            return;
        };
        let Some(cluster) = self.clusters.get(&cluster_id) else {
            return;
        };
        let Some(ch) = self.channels.get(&channel) else {
            return;
        };
        if !cluster.has_coordinator() || !ch.is_open() || !ch.link_active {
            return;
        }
        let (name, level, firm) = (cluster.name, cluster.level(), cluster.address());
        if firm.is_none() && !self.config.distribute_relative_addresses {
            trace!(cluster = %name, cause, "No firm cluster address, allocation rolled back");
            return;
        }
        let prefix = firm.unwrap_or(Hrmid::ZERO);
        let holds_valid = ch.assigned.iter().any(|a| {
            a.prefix_above(level) == prefix
                && cluster.pool.owner(a.level_address(level)) == Some(SlotOwner::Channel(channel))
        });
        if holds_valid {
            return;
        }
        let preferred = if self.config.address_reuse {
            ch.peer_hrmid
                .filter(|prior| {
                    !prior.is_zero()
                        && prior.prefix_above(level) == prefix
                        && !prior.has_components_below(level)
                })
                .map(|prior| prior.level_address(level))
                .filter(|slot| *slot != 0)
        } else {
            None
        };

        let Some(cluster) = self.clusters.get_mut(&cluster_id) else {
            return;
        };
        let slot = match cluster.pool.allocate(SlotOwner::Channel(channel), preferred) {
            Ok(slot) => slot,
            Err(e) => {
                error!(cluster = %name, channel = %channel, error = %e, "Cannot allocate address");
                return;
            }
        };
        let address = match prefix.with_level_address(level, slot) {
            Ok(address) => address,
            Err(e) => {
                cluster.pool.release(slot);
                error!(cluster = %name, slot, error = %e, "Slot does not fit the address");
                return;
            }
        };
        if self
            .channels
            .get(&channel)
            .is_some_and(|ch| ch.assigned.contains(&address))
        {
            return;
        }
        debug!(cluster = %name, channel = %channel, address = %address, cause, "Member needs address");
        self.assign_address(cluster_id, channel, slot, address);
    }

    /// Assign `address` (slot `slot`) to the member behind `channel`,
    /// revoking whatever else it held in this cluster.
    fn assign_address(&mut self, cluster_id: EntityId, channel: ChannelId, slot: u32, address: Hrmid) {
        let others: Vec<Hrmid> = self
            .channels
            .get(&channel)
            .map(|ch| ch.assigned.iter().copied().filter(|a| *a != address).collect())
            .unwrap_or_default();
        if !others.is_empty() {
            self.revoke_from_channel(cluster_id, channel, &others, false);
        }
        let Some(cluster) = self.clusters.get_mut(&cluster_id) else {
            return;
        };
        cluster.pool.claim(slot, SlotOwner::Channel(channel));
        let (name, cluster_address, coordinator) =
            (cluster.name, cluster.address().unwrap_or(Hrmid::ZERO), cluster.coordinator);
        let Some(ch) = self.channels.get_mut(&channel) else {
            return;
        };
        ch.record_assigned(address, slot);
        let (receiver, peer_address) = (ch.peer_name, ch.peer_address.clone());

        self.send_message(
            channel,
            SignalingMessage::AssignAddress {
                sender: name,
                receiver,
                address,
            },
        );
        self.routing
            .map_address_to_network_address(address, &peer_address);
        self.hrg.add_link(
            cluster_address,
            address,
            RoutingEntry::direct_neighbor(cluster_address, address)
                .with_next_hop_address(peer_address.clone()),
        );
        self.hrg.add_link(
            address,
            cluster_address,
            RoutingEntry::direct_neighbor(address, cluster_address),
        );
        if let Some(coord) = coordinator.and_then(|c| self.coordinators.get_mut(&c)) {
            coord.routes_changed = true;
        }
        info!(node = %self.local, cluster = %name, address = %address, peer = %peer_address, "Address assigned");
        self.emit(HierarchyEvent::AddressAssigned {
            cluster: name,
            address,
            peer: peer_address,
        });
    }

    /// Revoke `addresses` from the member behind `channel`. With
    /// `keep_prior`, the member's prior address stays remembered for reuse.
    pub(crate) fn revoke_from_channel(
        &mut self,
        cluster_id: EntityId,
        channel: ChannelId,
        addresses: &[Hrmid],
        keep_prior: bool,
    ) {
        let Some(level) = self.clusters.get(&cluster_id).map(|c| c.level()) else {
            return;
        };
        let Some(ch) = self.channels.get_mut(&channel) else {
            return;
        };
        let prior = ch.peer_hrmid;
        let revoked: Vec<Hrmid> = addresses
            .iter()
            .copied()
            .filter(|a| ch.record_revoked(*a, a.level_address(level)))
            .collect();
        if keep_prior {
            ch.peer_hrmid = prior;
        }
        if revoked.is_empty() {
            return;
        }
        self.send_message(
            channel,
            SignalingMessage::RevokeAddresses {
                addresses: revoked.clone(),
            },
        );
        for address in revoked {
            let slot = address.level_address(level);
            if let Some(c) = self.clusters.get_mut(&cluster_id) {
                if c.pool.owner(slot) == Some(SlotOwner::Channel(channel)) {
                    c.pool.release(slot);
                }
            }
            self.routing.unmap_address(address);
            self.hrg.remove_node(&address);
            debug!(channel = %channel, address = %address, "Address revoked");
        }
    }

    /// (Re)assign the node's own address in a base cluster.
    pub(crate) fn assign_local_address(&mut self, cluster_id: EntityId) {
        let relative = self.config.distribute_relative_addresses;
        let Some(cluster) = self.clusters.get_mut(&cluster_id) else {
            return;
        };
        if !cluster.level().is_base_level() || !cluster.has_coordinator() {
            return;
        }
        let Some(prefix) = cluster.address().or(relative.then_some(Hrmid::ZERO)) else {
            return;
        };
        let level = HierarchyLevel::BASE;
        let preferred = cluster
            .local_address
            .filter(|a| a.prefix_above(level) == prefix)
            .map(|a| a.level_address(level));
        let slot = match cluster.pool.allocate(SlotOwner::Local, preferred) {
            Ok(slot) => slot,
            Err(e) => {
                error!(cluster = %cluster.name, error = %e, "Cannot allocate node address");
                return;
            }
        };
        let address = match prefix.with_level_address(level, slot) {
            Ok(address) => address,
            Err(e) => {
                cluster.pool.release(slot);
                error!(cluster = %cluster.name, error = %e, "Slot does not fit the address");
                return;
            }
        };
        if cluster.local_address == Some(address) {
            return;
        }
        let previous = cluster.local_address.replace(address);
        if let Some(previous) = previous {
            let old_slot = previous.level_address(level);
            if old_slot != slot && cluster.pool.owner(old_slot) == Some(SlotOwner::Local) {
                cluster.pool.release(old_slot);
            }
            self.remove_node_address(previous);
        }
        self.add_node_address(address, cluster_id);
        self.hrg.add_link(
            prefix,
            address,
            RoutingEntry::direct_neighbor(prefix, address).with_next_hop_address(self.local.clone()),
        );
        self.hrg
            .add_link(address, prefix, RoutingEntry::direct_neighbor(address, prefix));
    }

    fn drop_local_address(&mut self, cluster_id: EntityId) {
        let Some(cluster) = self.clusters.get_mut(&cluster_id) else {
            return;
        };
        let Some(address) = cluster.local_address.take() else {
            return;
        };
        let slot = address.level_address(HierarchyLevel::BASE);
        if cluster.pool.owner(slot) == Some(SlotOwner::Local) {
            cluster.pool.release(slot);
        }
        self.remove_node_address(address);
    }

    /// The cluster address changed or vanished: every address handed out
    /// by this cluster is revoked and all slots are released.
    pub fn event_all_cluster_addresses_invalid(&mut self, cluster_id: EntityId) {
        let Some(cluster) = self.clusters.get(&cluster_id) else {
            return;
        };
        let name = cluster.name;
        let channels = cluster.core.channels().to_vec();
        for channel in channels {
            let assigned: Vec<Hrmid> = self
                .channels
                .get(&channel)
                .map(|ch| ch.assigned.iter().copied().collect())
                .unwrap_or_default();
            if !assigned.is_empty() {
                self.revoke_from_channel(cluster_id, channel, &assigned, true);
            }
        }
        self.drop_local_address(cluster_id);
        if let Some(c) = self.clusters.get_mut(&cluster_id) {
            c.pool.clear();
            c.distribution_due = None;
        }
        debug!(cluster = %name, "All cluster addresses invalidated");
    }

    /// The member behind `channel` is gone: release its addresses, drop the
    /// channel and invalidate the cluster if it lost its reason to exist.
    pub fn event_cluster_member_lost(&mut self, channel: ChannelId) {
        let Some(cluster_id) = self.cluster_of_channel(channel) else {
            return;
        };
        let Some(peer) = self.channels.get(&channel).map(|ch| ch.peer_name) else {
            return;
        };
        let taken = self
            .channels
            .get_mut(&channel)
            .map(|ch| ch.take_assigned())
            .unwrap_or_default();
        for address in taken {
            self.routing.unmap_address(address);
            self.hrg.remove_node(&address);
        }
        let Some(cluster) = self.clusters.get_mut(&cluster_id) else {
            return;
        };
        cluster.pool.release_owner(SlotOwner::Channel(channel));
        cluster.pool.release_reservations(channel);
        cluster.inferior_coordinators.retain(|_, ch| *ch != channel);
        cluster.election_dirty = true;
        let (name, level, coordinator) = (cluster.name, cluster.level(), cluster.coordinator);
        if let Some(coord) = coordinator.and_then(|c| self.coordinators.get_mut(&c)) {
            coord.routes_changed = true;
        }
        self.arg.remove_undirected(&arg_key(&name), &arg_key(&peer));
        self.unregister_channel(channel);
        info!(node = %self.local, cluster = %name, member = %peer, "Cluster member lost");
        self.mark_hierarchy_changed();

        let remaining = self
            .clusters
            .get(&cluster_id)
            .map(|c| c.core.channels().len())
            .unwrap_or(0);
        let obsolete = match level.dec() {
            None => remaining == 0,
            Some(inferior) => !self.has_local_coordinator_at(inferior),
        };
        if obsolete {
            self.event_cluster_role_invalid(cluster_id, "no members left");
        }
    }

    /// Tear the cluster down: resign its coordinator, revoke its addresses,
    /// cancel every membership and forget it.
    pub fn event_cluster_role_invalid(&mut self, cluster_id: EntityId, reason: &str) {
        let Some(cluster) = self.clusters.get_mut(&cluster_id) else {
            return;
        };
        if !cluster.core.invalidate() {
            return;
        }
        let coordinator = cluster.coordinator;
        info!(node = %self.local, cluster = %cluster.name, reason, "Cluster role invalid");

        if let Some(coordinator) = coordinator {
            self.invalidate_coordinator(coordinator, reason);
        }
        self.event_all_cluster_addresses_invalid(cluster_id);

        let Some((name, channels)) = self
            .clusters
            .get(&cluster_id)
            .map(|c| (c.name, c.core.channels().to_vec()))
        else {
            return;
        };
        for channel in channels {
            if let Some(destination) = self.channels.get(&channel).map(|ch| ch.peer_name) {
                self.send_message(
                    channel,
                    SignalingMessage::MembershipCanceled {
                        source: name,
                        destination,
                    },
                );
            }
            self.unregister_channel(channel);
        }
        self.arg.remove_node(&arg_key(&name));
        self.clusters.remove(&cluster_id);
        self.emit(HierarchyEvent::ClusterInvalidated { cluster: name });
        self.mark_hierarchy_changed();
    }

    /// Reconcile the known inferior coordinators (local ones one level below
    /// plus proxies within the expansion radius) with the connected ones.
    /// A call during a running pass schedules one more pass.
    pub fn update_cluster_members(&mut self, cluster_id: EntityId) {
        {
            let Some(cluster) = self.clusters.get_mut(&cluster_id) else {
                return;
            };
            if !cluster.core.is_valid() || !cluster.level().is_higher_level() {
                return;
            }
            if cluster.reconciling {
                cluster.reconcile_again = true;
                return;
            }
            cluster.reconciling = true;
        }
        loop {
            match self.clusters.get_mut(&cluster_id) {
                Some(c) => c.reconcile_again = false,
                None => return,
            }
            self.reconcile_members(cluster_id);
            match self.clusters.get(&cluster_id) {
                Some(c) if c.reconcile_again && c.core.is_valid() => continue,
                _ => break,
            }
        }
        if let Some(c) = self.clusters.get_mut(&cluster_id) {
            c.reconciling = false;
        }
    }

    fn reconcile_members(&mut self, cluster_id: EntityId) {
        let Some(cluster) = self.clusters.get(&cluster_id) else {
            return;
        };
        if !cluster.core.is_valid() {
            return;
        }
        let Some(inferior) = cluster.level().dec() else {
            return;
        };
        let name = cluster.name;

        let mut known: Vec<(ClusterName, NetworkAddress)> = self
            .coordinators
            .values()
            .filter(|c| c.level() == inferior)
            .map(|c| (c.name, self.local.clone()))
            .collect();
        known.extend(
            self.proxies
                .at_level(inferior, self.config.expansion_radius)
                .into_iter()
                .filter(|p| p.node != self.local)
                .map(|p| (p.name, p.node)),
        );

        let stale: Vec<(ClusterName, ChannelId)> = cluster
            .inferior_coordinators
            .iter()
            .filter(|(peer, _)| {
                !known
                    .iter()
                    .any(|(n, _)| n.same_cluster(peer) && n.coordinator_compatible(peer))
            })
            .map(|(peer, ch)| (*peer, *ch))
            .collect();
        for (peer, channel) in stale {
            debug!(cluster = %name, member = %peer, "Inferior coordinator no longer known");
            self.send_message(
                channel,
                SignalingMessage::MembershipCanceled {
                    source: name,
                    destination: peer,
                },
            );
            self.event_cluster_member_lost(channel);
        }

        for (coordinator, node) in known {
            let Some(cluster) = self.clusters.get(&cluster_id) else {
                return;
            };
            let connected = cluster.core.channels().iter().any(|ch| {
                self.channels.get(ch).is_some_and(|c| {
                    !c.is_closed()
                        && c.peer_name.same_cluster(&coordinator)
                        && c.peer_name.coordinator_compatible(&coordinator)
                })
            });
            if connected {
                continue;
            }
            let session = self.session_for_peer(&node);
            if let Err(e) = self.request_membership(cluster_id, session, coordinator) {
                warn!(cluster = %name, coordinator = %coordinator, error = %e, "Membership request failed");
            }
        }
    }
}
