//! Coordinator: the elected head of a local cluster.
//!
//! A coordinator exists only while its cluster's election is won. It joins
//! superior clusters through coordinator memberships, selects one of them
//! as its superior (whose assignment becomes its address), and runs the
//! route report (upwards) and route share (downwards) phases.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, trace, warn};

use hrm_protocol::{
    ClusterName, HierarchyLevel, Hrmid, Priority, RoutingEntry, RoutingTable, SignalingMessage,
};

use crate::channel::{ChannelParent, ChannelState};
use crate::clock::elapsed;
use crate::controller::HrmController;
use crate::election::{ElectionCandidate, ElectionOutcome};
use crate::entity::EntityCore;
use crate::events::HierarchyEvent;
use crate::ids::{ChannelId, EntityId};
use crate::HierarchyError;

/// The coordinator membership selected as superior, and its channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperiorLink {
    pub membership: EntityId,
    pub channel: ChannelId,
}

#[derive(Debug, Clone)]
pub struct Coordinator {
    pub core: EntityCore,
    pub name: ClusterName,
    /// The cluster this coordinator heads.
    pub cluster: EntityId,
    /// Coordinator memberships in superior clusters.
    pub memberships: BTreeSet<EntityId>,
    /// Routes received from the superior.
    pub shared_routes: RoutingTable,
    pub last_report: RoutingTable,
    pub routes_changed: bool,
    pub last_share_phase: Option<DateTime<Utc>>,
    pub last_report_phase: Option<DateTime<Utc>>,
    pub last_announcement: Option<DateTime<Utc>>,
    superior: Option<SuperiorLink>,
}

impl Coordinator {
    pub fn new(core: EntityCore, name: ClusterName, cluster: EntityId) -> Self {
        Self {
            core,
            name,
            cluster,
            memberships: BTreeSet::new(),
            shared_routes: RoutingTable::new(),
            last_report: RoutingTable::new(),
            routes_changed: true,
            last_share_phase: None,
            last_report_phase: None,
            last_announcement: None,
            superior: None,
        }
    }

    pub fn level(&self) -> HierarchyLevel {
        self.core.level
    }

    pub fn superior(&self) -> Option<&SuperiorLink> {
        self.superior.as_ref()
    }

    pub fn address(&self) -> Option<Hrmid> {
        self.core.hrmid
    }

    /// Returns the previously selected link.
    pub(crate) fn replace_superior(&mut self, link: Option<SuperiorLink>) -> Option<SuperiorLink> {
        std::mem::replace(&mut self.superior, link)
    }
}

impl HrmController {
    /// Re-run the elections of every cluster whose inputs changed. Returns
    /// true if any coordinator was created or resigned.
    pub(crate) fn run_elections(&mut self) -> bool {
        let dirty: Vec<EntityId> = self
            .clusters
            .values()
            .filter(|c| c.election_dirty && c.core.is_valid())
            .map(|c| c.core.id)
            .collect();
        let mut acted = false;
        for cluster_id in dirty {
            let Some(cluster) = self.clusters.get_mut(&cluster_id) else {
                continue;
            };
            cluster.election_dirty = false;
            let (name, level, has_coordinator) =
                (cluster.name, cluster.level(), cluster.has_coordinator());
            let channels = cluster.core.channels().to_vec();

            let pending = channels.iter().any(|ch| {
                self.channels
                    .get(ch)
                    .is_some_and(|c| c.state() == ChannelState::HalfOpen)
            });
            let candidates: Vec<ElectionCandidate> = channels
                .iter()
                .filter_map(|ch| self.channels.get(ch))
                .filter(|ch| ch.is_open())
                .map(|ch| ElectionCandidate::new(ch.peer_priority, ch.peer_address.clone()))
                .collect();
            if pending || candidates.is_empty() {
                trace!(cluster = %name, pending, "Election postponed");
                continue;
            }

            let local = ElectionCandidate::new(self.elector.current_priority(level), self.local.clone());
            let outcome = self.elector.decide(&name, &local, &candidates);
            if let Some(cluster) = self.clusters.get_mut(&cluster_id) {
                cluster.election = outcome;
            }
            debug!(node = %self.local, cluster = %name, ?outcome, candidates = candidates.len(), "Election decided");
            match (outcome, has_coordinator) {
                (ElectionOutcome::Won, false) => {
                    self.event_election_won(cluster_id);
                    acted = true;
                }
                (ElectionOutcome::Lost, true) => {
                    self.event_election_lost(cluster_id);
                    acted = true;
                }
                _ => {}
            }
        }
        acted
    }

    pub fn event_election_won(&mut self, cluster_id: EntityId) {
        let now = self.now();
        let coordinator_id = self.ids.next_coordinator_id();
        let entity = self.ids.next_entity_id();
        let Some(cluster) = self.clusters.get_mut(&cluster_id) else {
            return;
        };
        if cluster.has_coordinator() {
            return;
        }
        cluster.name = cluster.name.with_coordinator(coordinator_id);
        cluster.coordinator = Some(entity);
        let (name, level) = (cluster.name, cluster.level());
        let priority = self.elector.current_priority(level);
        self.coordinators.insert(
            entity,
            Coordinator::new(EntityCore::new(entity, level, priority, now), name, cluster_id),
        );
        info!(node = %self.local, coordinator = %name, "Coordinator elected");
        self.emit(HierarchyEvent::CoordinatorElected { coordinator: name });
        self.mark_hierarchy_changed();

        let top = level.is_highest(self.config.depth);
        if top {
            self.set_coordinator_address(entity, Some(Hrmid::ZERO));
        }
        self.announce(entity);
        if !top {
            let superior = match self.local_cluster_at(level.inc()) {
                Some(id) => id,
                None => self.create_cluster(level.inc()),
            };
            self.update_cluster_members(superior);
        }
        self.distribute_addresses(cluster_id);
    }

    pub fn event_election_lost(&mut self, cluster_id: EntityId) {
        let Some(coordinator) = self.clusters.get(&cluster_id).and_then(|c| c.coordinator) else {
            return;
        };
        self.invalidate_coordinator(coordinator, "election lost");
    }

    /// Resign: flood the invalidation, leave all superior clusters, revoke
    /// everything the cluster handed out and drop the coordinator.
    pub(crate) fn invalidate_coordinator(&mut self, coordinator: EntityId, reason: &str) {
        let Some(c) = self.coordinators.get(&coordinator) else {
            return;
        };
        let (name, level, cluster_id) = (c.name, c.level(), c.cluster);
        self.flood_invalidation(coordinator);

        let memberships: Vec<EntityId> = match self.coordinators.get_mut(&coordinator) {
            Some(c) => {
                c.replace_superior(None);
                std::mem::take(&mut c.memberships).into_iter().collect()
            }
            None => Vec::new(),
        };
        for member in memberships {
            self.leave_membership(member, reason);
        }
        self.set_coordinator_address(coordinator, None);
        self.event_all_cluster_addresses_invalid(cluster_id);

        if let Some(cluster) = self.clusters.get_mut(&cluster_id) {
            cluster.name = cluster.name.with_coordinator(0);
            cluster.coordinator = None;
            cluster.core.hrmid = None;
        }
        self.coordinators.remove(&coordinator);
        info!(node = %self.local, coordinator = %name, reason, "Coordinator resigned");
        self.emit(HierarchyEvent::CoordinatorResigned {
            coordinator: name,
            reason: reason.to_string(),
        });
        self.mark_hierarchy_changed();

        if level.is_highest(self.config.depth) {
            return;
        }
        if let Some(superior) = self.local_cluster_at(level.inc()) {
            if self.has_local_coordinator_at(level) {
                self.update_cluster_members(superior);
            } else {
                self.event_cluster_role_invalid(superior, "no local coordinator below");
            }
        }
    }

    /// Set (or clear) the coordinator's address. A change invalidates every
    /// address the cluster handed out; a new address triggers distribution.
    pub fn set_coordinator_address(&mut self, coordinator: EntityId, address: Option<Hrmid>) {
        let Some(c) = self.coordinators.get_mut(&coordinator) else {
            return;
        };
        if c.core.hrmid == address {
            return;
        }
        let previous = std::mem::replace(&mut c.core.hrmid, address);
        c.routes_changed = true;
        let (name, cluster_id) = (c.name, c.cluster);

        if let Some(previous) = previous {
            self.event_all_cluster_addresses_invalid(cluster_id);
            self.hrg.remove_node(&previous);
        }
        if let Some(cluster) = self.clusters.get_mut(&cluster_id) {
            cluster.core.hrmid = address;
        }
        if let Some(address) = address {
            self.hrg.add_node(address);
        }
        info!(node = %self.local, coordinator = %name, address = ?address.map(|a| a.to_string()), "Coordinator address changed");
        self.emit(HierarchyEvent::CoordinatorAddressChanged {
            coordinator: name,
            address,
        });
        if address.is_some() {
            self.distribute_addresses(cluster_id);
        }
    }

    /// Pick the superior cluster with the highest announced coordinator
    /// priority (network address, then membership id break ties).
    pub fn select_superior(&mut self, coordinator: EntityId) {
        let Some(c) = self.coordinators.get(&coordinator) else {
            return;
        };
        let best = c
            .memberships
            .iter()
            .filter_map(|m| {
                let member = self.members.get(m)?;
                let superior = member.superior.as_ref()?;
                let channel = member.channel?;
                self.channels.get(&channel).filter(|ch| ch.is_open())?;
                Some(((superior.priority, superior.node.clone(), *m), channel))
            })
            .max_by(|a, b| a.0.cmp(&b.0))
            .map(|((_, _, membership), channel)| SuperiorLink { membership, channel });
        if c.superior() == best.as_ref() {
            return;
        }
        let name = c.name;

        let previous = self
            .coordinators
            .get_mut(&coordinator)
            .and_then(|c| c.replace_superior(best));
        if let Some(previous) = previous {
            if let Some(ch) = self.channels.get_mut(&previous.channel) {
                ch.link_active = false;
                ch.received.clear();
            }
            self.send_message(previous.channel, SignalingMessage::LinkActivation { active: false });
            if let Some(m) = self.members.get_mut(&previous.membership) {
                m.core.hrmid = None;
            }
            self.set_coordinator_address(coordinator, None);
        }

        let superior_name = best
            .and_then(|link| self.members.get(&link.membership))
            .map(|m| m.remote.name);
        if let Some(link) = best {
            if let Some(ch) = self.channels.get_mut(&link.channel) {
                ch.link_active = true;
            }
            self.send_message(link.channel, SignalingMessage::LinkActivation { active: true });
            let (stored, remembered) = match self.members.get(&link.membership) {
                Some(m) => (
                    m.core.hrmid,
                    self.address_memory
                        .get(&(m.remote.name.cluster_id, m.remote.name.level))
                        .copied(),
                ),
                None => (None, None),
            };
            match (stored, remembered) {
                (Some(address), _) => self.set_coordinator_address(coordinator, Some(address)),
                (None, Some(address)) => {
                    self.send_message(link.channel, SignalingMessage::RequestAddress { address });
                }
                (None, None) => {}
            }
        }
        info!(node = %self.local, coordinator = %name, superior = ?superior_name.map(|s| s.to_string()), "Superior selected");
        self.emit(HierarchyEvent::SuperiorSelected {
            coordinator: name,
            superior: superior_name,
        });
    }

    /// Send to the selected superior cluster.
    pub fn send_superior_coordinator(
        &mut self,
        coordinator: EntityId,
        message: SignalingMessage,
    ) -> Result<(), HierarchyError> {
        let c = self
            .coordinators
            .get(&coordinator)
            .ok_or_else(|| HierarchyError::UnknownEntity(coordinator.to_string()))?;
        let link = c
            .superior()
            .copied()
            .ok_or(HierarchyError::NoSuperiorChannel(c.name))?;
        let active = self
            .channels
            .get(&link.channel)
            .is_some_and(|ch| ch.is_open() && ch.link_active);
        if !active {
            return Err(HierarchyError::InactiveSuperiorChannel {
                coordinator: c.name,
                channel: link.channel.0,
            });
        }
        self.send_message(link.channel, message);
        Ok(())
    }

    /// Raise the local priority at `level`. Lowering is refused.
    pub fn event_priority_changed(
        &mut self,
        level: HierarchyLevel,
        priority: Priority,
    ) -> Result<(), HierarchyError> {
        if !level.is_valid(self.config.depth) {
            return Err(HierarchyError::InvalidLevel(level));
        }
        let current = self.elector.current_priority(level);
        if priority < current {
            let err = HierarchyError::PriorityRegression {
                level,
                current,
                requested: priority,
            };
            error!(node = %self.local, error = %err, "Priority change rejected");
            return Err(err);
        }
        if priority == current {
            return Ok(());
        }
        self.elector.set_priority(level, priority);
        info!(node = %self.local, %level, %priority, "Priority changed");

        for cluster in self.clusters.values_mut().filter(|c| c.level() == level) {
            cluster.core.set_priority(priority)?;
            cluster.election_dirty = true;
        }
        let mut coordinators = Vec::new();
        for c in self.coordinators.values_mut().filter(|c| c.level() == level) {
            c.core.set_priority(priority)?;
            coordinators.push(c.core.id);
        }
        let mut channels = Vec::new();
        for m in self.members.values_mut().filter(|m| m.core.level == level) {
            m.core.set_priority(priority)?;
            channels.extend(m.channel);
        }
        for channel in channels {
            self.send_message(channel, SignalingMessage::PriorityUpdate { priority });
        }
        for coordinator in coordinators {
            self.announce(coordinator);
        }
        Ok(())
    }

    // ── Route phases ───────────────────────────────────────────────

    pub(crate) fn run_route_phases(&mut self) {
        let now = self.now();
        let coordinators: Vec<EntityId> = self.coordinators.keys().copied().collect();
        for coordinator in coordinators {
            self.report_phase(coordinator, now);
            self.share_phase(coordinator, now);
        }
    }

    /// Route from `from` to `to` along the HRG, hop counts summed.
    fn chained_route(&self, from: Hrmid, to: Hrmid) -> Option<RoutingEntry> {
        let mut segments = self.hrg.shortest_path(&from, &to)?.into_iter();
        let first = segments.next()?.link;
        segments.try_fold(first, |route, segment| route.chain(&segment.link))
    }

    /// Tell every member what concerns it: routes to this node at base
    /// level, routes to its siblings above, plus the matching part of what
    /// the superior shared with us.
    fn share_phase(&mut self, coordinator: EntityId, now: DateTime<Utc>) {
        let interval = self.config.share_interval();
        let periodic = self.config.periodic_sharing;
        let Some(c) = self.coordinators.get_mut(&coordinator) else {
            return;
        };
        if c.last_share_phase.is_some_and(|last| !elapsed(last, now, interval)) {
            return;
        }
        if !c.routes_changed && !periodic {
            return;
        }
        if c.address().is_none() {
            return;
        }
        c.last_share_phase = Some(now);
        c.routes_changed = false;
        let (cluster_id, level, inherited) = (c.cluster, c.level(), c.shared_routes.clone());
        let Some(cluster) = self.clusters.get(&cluster_id) else {
            return;
        };
        let own: Vec<Hrmid> = self.node_addresses.keys().copied().collect();

        let targets: Vec<(ChannelId, Hrmid)> = cluster
            .core
            .channels()
            .iter()
            .filter_map(|id| self.channels.get(id))
            .filter(|ch| ch.is_open() && ch.link_active)
            .filter_map(|ch| ch.peer_hrmid.map(|a| (ch.id, a)))
            .collect();
        let mut siblings: Vec<Hrmid> = targets.iter().map(|(_, a)| *a).collect();
        siblings.extend(cluster.local_address);

        // Every shared entry starts at the peer or uses it as next hop.
        for (channel, peer) in targets {
            let mut table = inherited.relevant_for(peer);
            if level.is_base_level() {
                for address in own.iter().filter(|a| **a != peer) {
                    table.add(
                        RoutingEntry::direct_neighbor(peer, *address)
                            .with_next_hop_address(self.local.clone()),
                    );
                }
            } else {
                let chains: Vec<RoutingEntry> = siblings
                    .iter()
                    .filter(|s| **s != peer)
                    .filter_map(|s| self.chained_route(peer, *s))
                    .collect();
                for entry in chains {
                    table.add(entry);
                }
            }
            let unchanged = self
                .channels
                .get(&channel)
                .is_some_and(|ch| ch.last_shared == table);
            if unchanged {
                continue;
            }
            if let Some(ch) = self.channels.get_mut(&channel) {
                ch.last_shared = table.clone();
            }
            trace!(channel = %channel, routes = table.len(), "Sharing routes");
            self.send_message(channel, SignalingMessage::RouteShare { routes: table });
        }
    }

    /// Report our members and what they reported to the superior.
    fn report_phase(&mut self, coordinator: EntityId, now: DateTime<Utc>) {
        let interval = self.config.share_interval();
        let Some(c) = self.coordinators.get(&coordinator) else {
            return;
        };
        if c.last_report_phase.is_some_and(|last| !elapsed(last, now, interval)) {
            return;
        }
        let (Some(address), Some(link)) = (c.address(), c.superior().copied()) else {
            return;
        };
        let (level, cluster_id, name) = (c.level(), c.cluster, c.name);
        let Some(cluster) = self.clusters.get(&cluster_id) else {
            return;
        };

        let mut routes = RoutingTable::new();
        for ch in cluster.core.channels().iter().filter_map(|id| self.channels.get(id)) {
            if let Some(peer) = ch.peer_hrmid.filter(|_| ch.is_open()) {
                routes.add(RoutingEntry::direct_neighbor(address, peer));
            }
            routes.merge(&ch.reported_routes);
        }
        if let Some(local) = cluster.local_address {
            routes.add(RoutingEntry::direct_neighbor(address, local));
        }
        if let Some(c) = self.coordinators.get_mut(&coordinator) {
            c.last_report_phase = Some(now);
            if routes.is_empty() || c.last_report == routes {
                return;
            }
            c.last_report = routes.clone();
        }
        let self_loop = self
            .channels
            .get(&link.channel)
            .is_some_and(|ch| ch.session == self.loopback);
        if self_loop {
            // Superior lives on this node: no report message, hand the
            // aggregate straight to the superior cluster's channel.
            let target = self
                .channels
                .values()
                .find(|ch| {
                    ch.session == self.loopback
                        && matches!(ch.parent, ChannelParent::Cluster(_))
                        && ch.peer_name.same_cluster(&name)
                })
                .map(|ch| (ch.parent.entity(), ch.id));
            if let Some((superior_cluster, channel)) = target {
                trace!(coordinator = %name, "Route report kept local");
                self.handle_route_report(superior_cluster, channel, &routes);
            }
            return;
        }
        let report = SignalingMessage::RouteReport {
            source: address,
            destination: address.prefix_above(level.inc()),
            routes,
        };
        if let Err(e) = self.send_superior_coordinator(coordinator, report) {
            error!(node = %self.local, error = %e, "Route report failed");
            if let Some(c) = self.coordinators.get_mut(&coordinator) {
                c.last_report.clear();
            }
        }
    }

    pub(crate) fn handle_route_report(
        &mut self,
        cluster: EntityId,
        channel: ChannelId,
        routes: &RoutingTable,
    ) {
        let Some(ch) = self.channels.get_mut(&channel) else {
            return;
        };
        if ch.reported_routes == *routes {
            return;
        }
        ch.reported_routes = routes.clone();
        for entry in routes.iter() {
            self.hrg
                .add_link(entry.source, entry.destination, entry.clone());
        }
        let coordinator = self.clusters.get(&cluster).and_then(|c| c.coordinator);
        match coordinator.and_then(|c| self.coordinators.get_mut(&c)) {
            Some(c) => c.routes_changed = true,
            None => warn!(channel = %channel, "Route report for cluster without coordinator"),
        }
        debug!(channel = %channel, routes = routes.len(), "Route report received");
    }
}
