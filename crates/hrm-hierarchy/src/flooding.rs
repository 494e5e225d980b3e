//! Coordinator announcement and invalidation floods.
//!
//! A coordinator announces itself on its cluster's channels with a TTL of
//! the expansion radius. Every receiver records a coordinator proxy and
//! forwards the packet sideways into its own clusters of the same level,
//! decrementing the TTL and appending itself to the passed-cluster trail.
//! Floods terminate on TTL exhaustion, on the trail (never revisit a node)
//! and on the flood filter (never forward the same packet id twice unless
//! it arrives with a higher TTL).

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, trace};

use hrm_protocol::{
    ClusterName, NetworkAddress, PassedCluster, Priority, SignalingMessage, SignalingPacket,
};

use crate::channel::ChannelParent;
use crate::clock::elapsed;
use crate::controller::HrmController;
use crate::ids::{ChannelId, EntityId};
use crate::member::{MembershipKind, SuperiorCandidate};
use crate::proxy::ProxyUpdate;

/// Packet ids already handled, with the TTL they arrived with.
#[derive(Debug, Default)]
pub struct FloodFilter {
    seen: BTreeMap<String, (u32, DateTime<Utc>)>,
}

impl FloodFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a packet should be handled. A packet already seen with the
    /// same or a higher TTL is rejected.
    pub fn accept(&mut self, id: &str, ttl: u32, now: DateTime<Utc>) -> bool {
        if let Some((seen_ttl, _)) = self.seen.get(id) {
            if *seen_ttl >= ttl {
                return false;
            }
        }
        self.seen.insert(id.to_string(), (ttl, now));
        true
    }

    pub fn expire(&mut self, now: DateTime<Utc>, expiry: Duration) {
        self.seen.retain(|_, (_, at)| !elapsed(*at, now, expiry));
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl HrmController {
    /// Announce a local coordinator on all open channels of its cluster.
    pub(crate) fn announce(&mut self, coordinator: EntityId) {
        let now = self.now();
        let Some(c) = self.coordinators.get_mut(&coordinator) else {
            return;
        };
        c.last_announcement = Some(now);
        let (name, level, cluster_id) = (c.name, c.level(), c.cluster);
        let ttl = self.config.expansion_radius;
        let packet = SignalingPacket::new(SignalingMessage::AnnounceCoordinator {
            sender_cluster: name,
            origin: self.local.clone(),
            priority: self.elector.current_priority(level),
            ttl,
            passed_clusters: Vec::new(),
            sideways: false,
        });
        self.flood_filter.accept(&packet.id, ttl, now);

        let channels = self.open_channels_of(cluster_id);
        trace!(coordinator = %name, channels = channels.len(), "Announcing coordinator");
        for channel in channels {
            self.send_on_channel(channel, packet.clone());
        }
    }

    /// Announce a local coordinator to one newly joined member.
    pub(crate) fn announce_on_channel(&mut self, coordinator: EntityId, channel: ChannelId) {
        let Some(c) = self.coordinators.get(&coordinator) else {
            return;
        };
        let (name, level) = (c.name, c.level());
        let ttl = self.config.expansion_radius;
        let packet = SignalingPacket::new(SignalingMessage::AnnounceCoordinator {
            sender_cluster: name,
            origin: self.local.clone(),
            priority: self.elector.current_priority(level),
            ttl,
            passed_clusters: Vec::new(),
            sideways: false,
        });
        let now = self.now();
        self.flood_filter.accept(&packet.id, ttl, now);
        self.send_on_channel(channel, packet);
    }

    pub(crate) fn announce_due(&mut self, now: DateTime<Utc>) {
        let interval = self.config.announce_interval();
        let due: Vec<EntityId> = self
            .coordinators
            .values()
            .filter(|c| {
                c.last_announcement
                    .map_or(true, |last| elapsed(last, now, interval))
            })
            .map(|c| c.core.id)
            .collect();
        for coordinator in due {
            self.announce(coordinator);
        }
    }

    pub(crate) fn flood_invalidation(&mut self, coordinator: EntityId) {
        let Some(c) = self.coordinators.get(&coordinator) else {
            return;
        };
        let (name, cluster_id) = (c.name, c.cluster);
        let ttl = self.config.expansion_radius;
        let packet = SignalingPacket::new(SignalingMessage::InvalidateCoordinator {
            sender_cluster: name,
            origin: self.local.clone(),
            ttl,
            passed_clusters: Vec::new(),
        });
        let now = self.now();
        self.flood_filter.accept(&packet.id, ttl, now);
        for channel in self.open_channels_of(cluster_id) {
            self.send_on_channel(channel, packet.clone());
        }
    }

    fn open_channels_of(&self, cluster: EntityId) -> Vec<ChannelId> {
        let Some(cluster) = self.clusters.get(&cluster) else {
            return Vec::new();
        };
        cluster
            .core
            .channels()
            .iter()
            .copied()
            .filter(|id| self.channels.get(id).is_some_and(|ch| ch.is_open()))
            .collect()
    }

    pub(crate) fn handle_announce(&mut self, channel: ChannelId, packet: &SignalingPacket) {
        let SignalingMessage::AnnounceCoordinator {
            sender_cluster,
            origin,
            priority,
            ttl,
            passed_clusters,
            sideways,
        } = &packet.message
        else {
            return;
        };
        let Some(parent) = self.channels.get(&channel).map(|ch| ch.parent) else {
            return;
        };
        let now = self.now();
        if !*sideways {
            if let ChannelParent::Member(member) = parent {
                self.note_cluster_coordinator(member, channel, *sender_cluster, origin, *priority, now);
            }
        }
        if !self.accept_flood(packet, origin, passed_clusters, *ttl, now) {
            return;
        }

        let level = sender_cluster.level;
        let distance = self.config.expansion_radius.saturating_sub(*ttl) + 1;
        let update = self
            .proxies
            .refresh(*sender_cluster, origin.clone(), *priority, distance, now);
        if update != ProxyUpdate::Refreshed {
            debug!(node = %self.local, coordinator = %sender_cluster, origin = %origin, distance, ?update, "Coordinator proxy updated");
            if let Some(superior) = self.local_cluster_at(level.inc()) {
                self.update_cluster_members(superior);
            }
        }
        if let Some(first) = passed_clusters.first() {
            let covered = [first.node.clone()];
            if self
                .elector
                .on_announcement_received(level, *priority, origin, &covered)
            {
                self.mark_elections_dirty(level);
            }
        }

        if *ttl > 1 {
            let passed = self.extend_trail(channel, passed_clusters, *sender_cluster);
            let forwarded = packet.forwarded(
                self.local.to_string(),
                SignalingMessage::AnnounceCoordinator {
                    sender_cluster: *sender_cluster,
                    origin: origin.clone(),
                    priority: *priority,
                    ttl: ttl - 1,
                    passed_clusters: passed,
                    sideways: true,
                },
            );
            self.forward_flood(channel, origin, forwarded);
        }
    }

    pub(crate) fn handle_invalidate(&mut self, channel: ChannelId, packet: &SignalingPacket) {
        let SignalingMessage::InvalidateCoordinator {
            sender_cluster,
            origin,
            ttl,
            passed_clusters,
        } = &packet.message
        else {
            return;
        };
        let Some(parent) = self.channels.get(&channel).map(|ch| ch.parent) else {
            return;
        };
        if passed_clusters.is_empty() {
            if let ChannelParent::Member(member) = parent {
                self.forget_cluster_coordinator(member, *sender_cluster);
            }
        }
        let now = self.now();
        if !self.accept_flood(packet, origin, passed_clusters, *ttl, now) {
            return;
        }

        let level = sender_cluster.level;
        let known = self
            .proxies
            .get(sender_cluster)
            .is_some_and(|p| p.name.coordinator_id == sender_cluster.coordinator_id);
        if known {
            self.proxies.remove(sender_cluster);
            info!(node = %self.local, coordinator = %sender_cluster, "Coordinator proxy invalidated");
            if let Some(superior) = self.local_cluster_at(level.inc()) {
                self.update_cluster_members(superior);
            }
        }
        if self.elector.on_coordinator_invalidated(level, origin) {
            self.mark_elections_dirty(level);
        }

        if *ttl > 1 {
            let passed = self.extend_trail(channel, passed_clusters, *sender_cluster);
            let forwarded = packet.forwarded(
                self.local.to_string(),
                SignalingMessage::InvalidateCoordinator {
                    sender_cluster: *sender_cluster,
                    origin: origin.clone(),
                    ttl: ttl - 1,
                    passed_clusters: passed,
                },
            );
            self.forward_flood(channel, origin, forwarded);
        }
    }

    /// Own floods, floods that already passed this node and duplicates are
    /// dropped.
    fn accept_flood(
        &mut self,
        packet: &SignalingPacket,
        origin: &NetworkAddress,
        passed: &[PassedCluster],
        ttl: u32,
        now: DateTime<Utc>,
    ) -> bool {
        if *origin == self.local || passed.iter().any(|p| p.node == self.local) {
            return false;
        }
        if !self.flood_filter.accept(&packet.id, ttl, now) {
            trace!(packet = %packet.id, ttl, "Duplicate flood dropped");
            return false;
        }
        true
    }

    fn extend_trail(
        &self,
        arrival: ChannelId,
        passed: &[PassedCluster],
        sender: ClusterName,
    ) -> Vec<PassedCluster> {
        let cluster = self
            .channel_local_name(arrival)
            .unwrap_or_else(|| ClusterName::wildcard(sender.level));
        let mut trail = passed.to_vec();
        trail.push(PassedCluster {
            node: self.local.clone(),
            cluster,
        });
        trail
    }

    /// Forward into the open channels of local clusters at the flood's
    /// level, never back to the arrival channel, the origin or any node on
    /// the trail.
    fn forward_flood(&mut self, arrival: ChannelId, origin: &NetworkAddress, packet: SignalingPacket) {
        let trail = |clusters: &[PassedCluster]| -> Vec<NetworkAddress> {
            clusters.iter().map(|p| p.node.clone()).collect()
        };
        let (level, passed, invalidation) = match &packet.message {
            SignalingMessage::AnnounceCoordinator {
                sender_cluster,
                passed_clusters,
                ..
            } => (sender_cluster.level, trail(passed_clusters), false),
            SignalingMessage::InvalidateCoordinator {
                sender_cluster,
                passed_clusters,
                ..
            } => (sender_cluster.level, trail(passed_clusters), true),
            _ => return,
        };
        // Invalidations also cross clusters that are being torn down.
        let targets: Vec<ChannelId> = self
            .clusters
            .values()
            .filter(|c| (invalidation || c.core.is_valid()) && c.level() == level)
            .flat_map(|c| c.core.channels().iter().copied())
            .filter(|id| *id != arrival)
            .filter(|id| {
                self.channels.get(id).is_some_and(|ch| {
                    ch.is_open()
                        && ch.peer_address != *origin
                        && ch.peer_address != self.local
                        && !passed.contains(&ch.peer_address)
                })
            })
            .collect();
        trace!(kind = %packet.kind(), targets = targets.len(), "Forwarding flood");
        for channel in targets {
            self.send_on_channel(channel, packet.clone());
        }
    }

    /// The coordinator of a cluster we are a member of announced itself.
    fn note_cluster_coordinator(
        &mut self,
        member: EntityId,
        channel: ChannelId,
        sender: ClusterName,
        origin: &NetworkAddress,
        priority: Priority,
        now: DateTime<Utc>,
    ) {
        let Some(m) = self.members.get_mut(&member) else {
            return;
        };
        if !m.remote.name.same_cluster(&sender) || !sender.has_coordinator() {
            return;
        }
        m.remote.name = sender;
        m.remote.priority = priority;
        if m.kind == MembershipKind::Base {
            m.name = sender;
        }
        let changed = m.superior.as_ref().map_or(true, |s| {
            s.name != sender || s.priority != priority || s.node != *origin
        });
        m.superior = Some(SuperiorCandidate {
            name: sender,
            node: origin.clone(),
            priority,
            last_seen: now,
        });
        let coordinator = m.coordinator();
        if let Some(ch) = self.channels.get_mut(&channel) {
            ch.peer_name = sender;
        }
        if changed {
            if let Some(coordinator) = coordinator {
                self.select_superior(coordinator);
            }
        }
    }

    /// The coordinator of a cluster we are a member of resigned.
    fn forget_cluster_coordinator(&mut self, member: EntityId, sender: ClusterName) {
        let Some(m) = self.members.get_mut(&member) else {
            return;
        };
        if !m.remote.name.same_cluster(&sender) {
            return;
        }
        m.remote.name = m.remote.name.with_coordinator(0);
        let was_candidate = m.superior.as_ref().is_some_and(|s| s.name == sender);
        if was_candidate {
            m.superior = None;
        }
        if let (true, Some(coordinator)) = (was_candidate, m.coordinator()) {
            self.select_superior(coordinator);
        }
    }

    /// Drop coordinator proxies and superior candidates that were not
    /// refreshed within the proxy expiry.
    pub(crate) fn expire_proxies(&mut self, now: DateTime<Utc>) {
        let expiry = self.config.proxy_expiry();
        for proxy in self.proxies.expire(now, expiry) {
            let level = proxy.level();
            info!(node = %self.local, coordinator = %proxy.name, origin = %proxy.node, "Coordinator proxy expired");
            if self.elector.on_coordinator_invalidated(level, &proxy.node) {
                self.mark_elections_dirty(level);
            }
            if let Some(superior) = self.local_cluster_at(level.inc()) {
                self.update_cluster_members(superior);
            }
        }

        let mut reselect = Vec::new();
        for m in self.members.values_mut() {
            let stale = m
                .superior
                .as_ref()
                .is_some_and(|s| elapsed(s.last_seen, now, expiry));
            if stale {
                debug!(member = %m.core.id, cluster = %m.remote.name, "Superior candidate expired");
                m.superior = None;
                reselect.extend(m.coordinator());
            }
        }
        reselect.sort();
        reselect.dedup();
        for coordinator in reselect {
            self.select_superior(coordinator);
        }
        self.flood_filter.expire(now, expiry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelState;
    use crate::config::HierarchyConfig;
    use crate::transport::Transport;
    use hrm_protocol::{HierarchyLevel, Route, SessionPacket};

    struct SilentTransport;

    impl Transport for SilentTransport {
        fn local_address(&self) -> NetworkAddress {
            NetworkAddress::new("a")
        }

        fn send(&mut self, _peer: &NetworkAddress, _packet: SessionPacket) -> bool {
            true
        }

        fn route_to(&self, _peer: &NetworkAddress) -> Option<Route> {
            None
        }
    }

    fn open_base_channel(controller: &mut HrmController, cluster: EntityId, peer: &str) -> ChannelId {
        let peer = NetworkAddress::new(peer);
        let session = controller.session_for_peer(&peer);
        controller.create_channel(
            ChannelParent::Cluster(cluster),
            session,
            ClusterName::wildcard(HierarchyLevel::BASE),
            peer,
            ChannelState::Open,
            true,
        )
    }

    fn recorded_ids(controller: &HrmController, channel: ChannelId) -> Vec<String> {
        controller
            .channel(channel)
            .map(|ch| ch.history.iter().map(|r| r.packet_id.clone()).collect())
            .unwrap_or_default()
    }

    #[test]
    fn invalidation_crosses_invalidated_cluster() {
        let mut controller =
            HrmController::new(HierarchyConfig::immediate(), Box::new(SilentTransport)).unwrap();
        let cluster = controller.create_cluster(HierarchyLevel::BASE);
        let from_b = open_base_channel(&mut controller, cluster, "b");
        let to_c = open_base_channel(&mut controller, cluster, "c");
        if let Some(c) = controller.clusters.get_mut(&cluster) {
            c.core.invalidate();
        }

        let origin = NetworkAddress::new("z");
        let sender = ClusterName::new(7, HierarchyLevel::BASE, 3);
        let invalidation = SignalingPacket::new(SignalingMessage::InvalidateCoordinator {
            sender_cluster: sender,
            origin: origin.clone(),
            ttl: 2,
            passed_clusters: Vec::new(),
        });
        let announcement = SignalingPacket::new(SignalingMessage::AnnounceCoordinator {
            sender_cluster: sender,
            origin: origin.clone(),
            priority: Priority::new(3),
            ttl: 2,
            passed_clusters: Vec::new(),
            sideways: true,
        });
        controller.forward_flood(from_b, &origin, invalidation.clone());
        controller.forward_flood(from_b, &origin, announcement.clone());

        assert_eq!(recorded_ids(&controller, to_c), vec![invalidation.id]);
        assert!(recorded_ids(&controller, from_b).is_empty());
    }

    #[test]
    fn duplicate_flood_is_rejected() {
        let mut filter = FloodFilter::new();
        let now = Utc::now();
        assert!(filter.accept("p1", 3, now));
        assert!(!filter.accept("p1", 3, now));
        assert!(!filter.accept("p1", 2, now));
        assert_eq!(filter.len(), 1);
    }

    #[test]
    fn higher_ttl_is_accepted_again() {
        let mut filter = FloodFilter::new();
        let now = Utc::now();
        assert!(filter.accept("p1", 2, now));
        assert!(filter.accept("p1", 4, now));
        assert!(!filter.accept("p1", 3, now));
    }

    #[test]
    fn seen_ids_expire() {
        let mut filter = FloodFilter::new();
        let start = Utc::now();
        filter.accept("old", 1, start);
        filter.accept("new", 1, start + chrono::Duration::seconds(30));
        filter.expire(start + chrono::Duration::seconds(31), Duration::from_secs(20));
        assert_eq!(filter.len(), 1);
        assert!(filter.accept("old", 1, start));
    }
}
