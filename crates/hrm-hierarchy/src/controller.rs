//! HrmController: the control plane of one node.
//!
//! The controller is an arena of entities, channels and sessions keyed by
//! stable ids; cross references are ids, never pointers. All mutation goes
//! through `&mut self` and the runtime serializes access. Entity behavior
//! lives in `cluster`, `coordinator`, `member` and `flooding`; this module
//! holds the arena, the session layer and packet dispatch.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, trace, warn};

use hrm_protocol::{
    ClusterId, ClusterName, Envelope, HierarchyLevel, Hrmid, NetworkAddress, RoutingEntry,
    SessionPacket, SignalingMessage, SignalingPacket,
};

use crate::channel::{ChannelParent, ChannelState, ComChannel, PacketDirection};
use crate::clock::{elapsed, Clock, SystemClock};
use crate::cluster::Cluster;
use crate::config::HierarchyConfig;
use crate::coordinator::Coordinator;
use crate::election::{Elector, HighestPriorityElector};
use crate::events::HierarchyEvent;
use crate::flooding::FloodFilter;
use crate::graph::RoutingGraph;
use crate::ids::{ChannelId, EntityId, IdAllocator, SessionId};
use crate::member::{ClusterMember, MembershipKind};
use crate::muxer::{ChannelAnchor, ChannelEndpoint, ComChannelMuxer};
use crate::processor::{PacketProcessor, WorkItem};
use crate::proxy::ProxyTable;
use crate::routing::{RoutingSink, SharedRoutingTable};
use crate::session::ComSession;
use crate::transport::Transport;
use crate::HierarchyError;

/// Upper bound of handler steps in one `process_all` call.
const MAX_PROCESSING_STEPS: usize = 100_000;

/// Link kinds of the abstract routing graph (ARG) over cluster names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgLink {
    /// Two entities of the same level hosted on one node.
    Neighbor,
    /// A membership carried by a channel.
    Membership(ChannelId),
}

/// ARG node of a cluster. Coordinator ids change with elections; the node
/// must not.
pub fn arg_key(name: &ClusterName) -> ClusterName {
    name.with_coordinator(0)
}

pub struct HrmController {
    pub(crate) config: HierarchyConfig,
    pub(crate) local: NetworkAddress,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) ids: IdAllocator,
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) elector: Box<dyn Elector>,
    pub(crate) routing: Box<dyn RoutingSink>,

    pub(crate) clusters: BTreeMap<EntityId, Cluster>,
    pub(crate) coordinators: BTreeMap<EntityId, Coordinator>,
    pub(crate) members: BTreeMap<EntityId, ClusterMember>,
    pub(crate) channels: BTreeMap<ChannelId, ComChannel>,
    pub(crate) sessions: BTreeMap<SessionId, ComSession>,
    pub(crate) session_by_peer: BTreeMap<NetworkAddress, SessionId>,
    pub(crate) loopback: SessionId,
    pub(crate) loopback_queue: VecDeque<SessionPacket>,

    pub(crate) muxer: ComChannelMuxer,
    pub(crate) processor: PacketProcessor,
    pub(crate) arg: RoutingGraph<ClusterName, ArgLink>,
    pub(crate) hrg: RoutingGraph<Hrmid, RoutingEntry>,
    pub(crate) proxies: ProxyTable,
    pub(crate) flood_filter: FloodFilter,

    /// Addresses of this node, by the entity that granted them.
    pub(crate) node_addresses: BTreeMap<Hrmid, EntityId>,
    /// Last address received per remote cluster, requested again on rejoin.
    pub(crate) address_memory: BTreeMap<(ClusterId, HierarchyLevel), Hrmid>,
    pub(crate) last_hierarchy_change: DateTime<Utc>,
    pub(crate) events: Vec<HierarchyEvent>,
}

impl HrmController {
    pub fn new(
        config: HierarchyConfig,
        transport: Box<dyn Transport>,
    ) -> Result<Self, HierarchyError> {
        config.validate()?;
        let local = transport.local_address();
        let mut ids = IdAllocator::from_address(&local);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let now = clock.now();

        let loopback = ids.next_session_id();
        let mut sessions = BTreeMap::new();
        sessions.insert(
            loopback,
            ComSession::new(loopback, local.clone(), true, config.session_timeout(), now),
        );
        let elector = Box::new(HighestPriorityElector::new(config.local_priority()));

        info!(node = %local, depth = config.depth, priority = config.priority, "HRM controller created");

        Ok(Self {
            config,
            local,
            clock,
            ids,
            transport,
            elector,
            routing: Box::new(SharedRoutingTable::new()),
            clusters: BTreeMap::new(),
            coordinators: BTreeMap::new(),
            members: BTreeMap::new(),
            channels: BTreeMap::new(),
            sessions,
            session_by_peer: BTreeMap::new(),
            loopback,
            loopback_queue: VecDeque::new(),
            muxer: ComChannelMuxer::new(),
            processor: PacketProcessor::new(),
            arg: RoutingGraph::new(),
            hrg: RoutingGraph::new(),
            proxies: ProxyTable::new(),
            flood_filter: FloodFilter::new(),
            node_addresses: BTreeMap::new(),
            address_memory: BTreeMap::new(),
            last_hierarchy_change: now,
            events: Vec::new(),
        })
    }

    pub fn with_elector(mut self, elector: Box<dyn Elector>) -> Self {
        self.elector = elector;
        self
    }

    pub fn with_routing(mut self, routing: Box<dyn RoutingSink>) -> Self {
        self.routing = routing;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        self.clock = clock;
        self.last_hierarchy_change = now;
        for session in self.sessions.values_mut() {
            session.last_activity = now;
            session.last_keepalive = now;
        }
        self
    }

    // ── Accessors ──────────────────────────────────────────────────

    pub fn local_address(&self) -> &NetworkAddress {
        &self.local
    }

    pub fn config(&self) -> &HierarchyConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn elector(&self) -> &dyn Elector {
        self.elector.as_ref()
    }

    pub fn clusters(&self) -> impl Iterator<Item = &Cluster> {
        self.clusters.values()
    }

    pub fn cluster(&self, id: EntityId) -> Option<&Cluster> {
        self.clusters.get(&id)
    }

    pub fn cluster_at(&self, level: HierarchyLevel) -> Option<&Cluster> {
        self.local_cluster_at(level).and_then(|id| self.clusters.get(&id))
    }

    pub fn coordinators(&self) -> impl Iterator<Item = &Coordinator> {
        self.coordinators.values()
    }

    pub fn coordinator(&self, id: EntityId) -> Option<&Coordinator> {
        self.coordinators.get(&id)
    }

    pub fn coordinator_at(&self, level: HierarchyLevel) -> Option<&Coordinator> {
        self.coordinators.values().find(|c| c.level() == level)
    }

    /// Address of the local coordinator at `level`, once it has one.
    pub fn coordinator_address(&self, level: HierarchyLevel) -> Option<Hrmid> {
        self.coordinator_at(level).and_then(|c| c.core.hrmid)
    }

    /// Whether this node hosts the coordinator of the highest level.
    pub fn is_root(&self) -> bool {
        let top = HierarchyLevel::new(self.config.depth.saturating_sub(1));
        self.coordinator_at(top).is_some()
    }

    pub fn members(&self) -> impl Iterator<Item = &ClusterMember> {
        self.members.values()
    }

    pub fn member(&self, id: EntityId) -> Option<&ClusterMember> {
        self.members.get(&id)
    }

    pub fn channels(&self) -> impl Iterator<Item = &ComChannel> {
        self.channels.values()
    }

    pub fn channel(&self, id: ChannelId) -> Option<&ComChannel> {
        self.channels.get(&id)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &ComSession> {
        self.sessions.values()
    }

    pub fn session(&self, id: SessionId) -> Option<&ComSession> {
        self.sessions.get(&id)
    }

    pub fn session_to(&self, peer: &NetworkAddress) -> Option<&ComSession> {
        if *peer == self.local {
            return self.sessions.get(&self.loopback);
        }
        self.session_by_peer
            .get(peer)
            .and_then(|id| self.sessions.get(id))
    }

    pub fn loopback_session(&self) -> SessionId {
        self.loopback
    }

    pub fn node_addresses(&self) -> Vec<Hrmid> {
        self.node_addresses.keys().copied().collect()
    }

    pub fn arg(&self) -> &RoutingGraph<ClusterName, ArgLink> {
        &self.arg
    }

    pub fn hrg(&self) -> &RoutingGraph<Hrmid, RoutingEntry> {
        &self.hrg
    }

    pub fn proxies(&self) -> &ProxyTable {
        &self.proxies
    }

    pub fn drain_events(&mut self) -> Vec<HierarchyEvent> {
        std::mem::take(&mut self.events)
    }

    /// Local name of the entity a channel belongs to.
    pub fn channel_local_name(&self, channel: ChannelId) -> Option<ClusterName> {
        match self.channels.get(&channel)?.parent {
            ChannelParent::Cluster(id) => self.clusters.get(&id).map(|c| c.name),
            ChannelParent::Member(id) => self.members.get(&id).map(|m| m.name),
        }
    }

    // ── Internal bookkeeping ───────────────────────────────────────

    pub(crate) fn emit(&mut self, event: HierarchyEvent) {
        self.events.push(event);
    }

    pub(crate) fn mark_hierarchy_changed(&mut self) {
        self.last_hierarchy_change = self.now();
    }

    pub(crate) fn mark_elections_dirty(&mut self, level: HierarchyLevel) {
        for cluster in self.clusters.values_mut().filter(|c| c.level() == level) {
            cluster.election_dirty = true;
        }
    }

    pub(crate) fn has_local_coordinator_at(&self, level: HierarchyLevel) -> bool {
        self.coordinators.values().any(|c| c.level() == level)
    }

    pub(crate) fn cluster_of_channel(&self, channel: ChannelId) -> Option<EntityId> {
        match self.channels.get(&channel)?.parent {
            ChannelParent::Cluster(id) => Some(id),
            ChannelParent::Member(_) => None,
        }
    }

    pub(crate) fn add_node_address(&mut self, address: Hrmid, granter: EntityId) {
        if self.node_addresses.insert(address, granter).is_some() {
            return;
        }
        let local = self.local.clone();
        self.routing.map_address_to_network_address(address, &local);
        self.hrg.add_node(address);
        info!(node = %self.local, address = %address, "Node address assigned");
        self.emit(HierarchyEvent::NodeAddressAssigned { address });
        self.announce_node_addresses();
        self.mark_base_shares_changed();
    }

    pub(crate) fn remove_node_address(&mut self, address: Hrmid) {
        if self.node_addresses.remove(&address).is_none() {
            return;
        }
        self.routing.unmap_address(address);
        self.hrg.remove_node(&address);
        info!(node = %self.local, address = %address, "Node address revoked");
        self.emit(HierarchyEvent::NodeAddressRevoked { address });
        self.announce_node_addresses();
        self.mark_base_shares_changed();
    }

    /// Base coordinators share routes to this node's own addresses.
    fn mark_base_shares_changed(&mut self) {
        for c in self
            .coordinators
            .values_mut()
            .filter(|c| c.level().is_base_level())
        {
            c.routes_changed = true;
        }
    }

    // ── Channels ───────────────────────────────────────────────────

    pub(crate) fn create_channel(
        &mut self,
        parent: ChannelParent,
        session: SessionId,
        peer_name: ClusterName,
        peer_address: NetworkAddress,
        state: ChannelState,
        link_active: bool,
    ) -> ChannelId {
        let now = self.now();
        let id = self.ids.next_channel_id();
        let channel = ComChannel::new(
            id,
            parent,
            session,
            peer_name,
            peer_address,
            state,
            link_active,
            self.config.packet_history_size,
            now,
        );
        self.channels.insert(id, channel);
        match parent {
            ChannelParent::Cluster(entity) => {
                if let Some(cluster) = self.clusters.get_mut(&entity) {
                    cluster.core.register_channel(id);
                }
            }
            ChannelParent::Member(entity) => {
                if let Some(member) = self.members.get_mut(&entity) {
                    member.core.register_channel(id);
                    member.channel = Some(id);
                }
            }
        }
        if let Some(s) = self.sessions.get_mut(&session) {
            s.register_channel(id);
        }
        trace!(channel = %id, session = %session, peer = %peer_name, "Channel created");
        id
    }

    /// Close a channel and unregister it from its entity, its session and
    /// the muxer.
    pub(crate) fn unregister_channel(&mut self, channel: ChannelId) {
        let local = self.channel_local_name(channel);
        let Some(mut ch) = self.channels.remove(&channel) else {
            return;
        };
        ch.close();
        let local = local.unwrap_or_else(|| ClusterName::wildcard(ch.peer_name.level));
        match ch.parent {
            ChannelParent::Cluster(entity) => {
                if let Some(cluster) = self.clusters.get_mut(&entity) {
                    cluster.core.unregister_channel(channel);
                }
            }
            ChannelParent::Member(entity) => {
                if let Some(member) = self.members.get_mut(&entity) {
                    member.core.unregister_channel(channel);
                    if member.channel == Some(channel) {
                        member.channel = None;
                    }
                }
            }
        }
        let now = self.now();
        if let Some(s) = self.sessions.get_mut(&ch.session) {
            s.unregister_channel(channel, local, ch.peer_name, now);
        }
        self.muxer.unregister_channel(channel);
        self.processor.forget_channel(channel);
        debug!(channel = %channel, local = %local, peer = %ch.peer_name, "Channel closed");
        self.emit(HierarchyEvent::ChannelClosed {
            channel,
            local,
            peer: ch.peer_name,
            node: ch.peer_address,
        });
    }

    /// Wrap a packet into an envelope and hand it to the channel's session.
    /// Closed channels drop everything; inactive links only carry messages
    /// that ignore link activation.
    pub(crate) fn send_on_channel(&mut self, channel: ChannelId, packet: SignalingPacket) -> bool {
        let Some(local) = self.channel_local_name(channel) else {
            warn!(channel = %channel, kind = %packet.kind(), "Send on unknown channel");
            return false;
        };
        let now = self.now();
        let Some(ch) = self.channels.get_mut(&channel) else {
            return false;
        };
        if ch.is_closed() {
            debug!(channel = %channel, kind = %packet.kind(), "Dropping packet on closed channel");
            return false;
        }
        if !ch.link_active && !packet.message.ignores_link_activation() {
            debug!(channel = %channel, kind = %packet.kind(), "Dropping packet on inactive link");
            return false;
        }
        ch.record_packet(PacketDirection::Outbound, &packet, now);
        let session = ch.session;
        let envelope = Envelope {
            source: local,
            destination: ch.peer_name,
            packet,
        };
        self.send_session(session, SessionPacket::Envelope(envelope))
    }

    pub(crate) fn send_message(&mut self, channel: ChannelId, message: SignalingMessage) -> bool {
        self.send_on_channel(channel, SignalingPacket::new(message))
    }

    // ── Sessions ───────────────────────────────────────────────────

    /// Session towards `peer`, created on demand. The local address maps to
    /// the loopback session.
    pub(crate) fn session_for_peer(&mut self, peer: &NetworkAddress) -> SessionId {
        if *peer == self.local {
            return self.loopback;
        }
        if let Some(id) = self.session_by_peer.get(peer) {
            return *id;
        }
        let now = self.now();
        let id = self.ids.next_session_id();
        self.sessions.insert(
            id,
            ComSession::new(id, peer.clone(), false, self.config.session_timeout(), now),
        );
        self.session_by_peer.insert(peer.clone(), id);
        debug!(session = %id, peer = %peer, "Session opened");
        id
    }

    pub(crate) fn send_session(&mut self, session: SessionId, packet: SessionPacket) -> bool {
        let Some(s) = self.sessions.get(&session) else {
            warn!(session = %session, "Send on unknown session");
            return false;
        };
        if s.loopback {
            self.loopback_queue.push_back(packet);
            return true;
        }
        let peer = s.peer.clone();
        let sent = self.transport.send(&peer, packet);
        if !sent {
            debug!(peer = %peer, "Transport refused packet");
        }
        sent
    }

    /// A physical link to `peer` came up.
    pub fn on_peer_connected(&mut self, peer: &NetworkAddress) {
        if *peer == self.local {
            return;
        }
        let session = self.session_for_peer(peer);
        info!(node = %self.local, peer = %peer, "Physical link up");
        let hello = SessionPacket::Hello {
            sender: self.local.clone(),
            answer: false,
        };
        self.send_session(session, hello);
    }

    /// The physical link to `peer` went down; its session is obsolete.
    pub fn on_peer_disconnected(&mut self, peer: &NetworkAddress) {
        if let Some(session) = self.session_by_peer.get(peer).copied() {
            self.event_session_obsolete(session, "link down");
        }
    }

    fn handle_hello(&mut self, session: SessionId, sender: &NetworkAddress, answer: bool) {
        if session == self.loopback {
            return;
        }
        let route = self.transport.route_to(sender);
        if let Some(s) = self.sessions.get_mut(&session) {
            s.route = route;
            s.established = true;
        }
        debug!(node = %self.local, peer = %sender, answer, "Hello received");
        if !answer {
            let reply = SessionPacket::Hello {
                sender: self.local.clone(),
                answer: true,
            };
            self.send_session(session, reply);
        }
        self.request_base_membership(session);
    }

    /// Make the base cluster (created on demand) ask the neighbor behind
    /// `session` to join.
    pub(crate) fn request_base_membership(&mut self, session: SessionId) {
        let base = self.ensure_base_cluster();
        if let Err(e) =
            self.request_membership(base, session, ClusterName::wildcard(HierarchyLevel::BASE))
        {
            warn!(session = %session, error = %e, "Base membership request failed");
        }
    }

    /// Force-invalidate every channel of a session, then drop it.
    pub fn event_session_obsolete(&mut self, session: SessionId, reason: &str) {
        let Some(s) = self.sessions.get(&session) else {
            return;
        };
        if s.loopback {
            return;
        }
        let channels = s.channels().to_vec();
        let peer = s.peer.clone();
        warn!(node = %self.local, peer = %peer, reason, channels = channels.len(), "Session obsolete");

        for channel in channels {
            match self.channels.get(&channel).map(|c| c.parent) {
                Some(ChannelParent::Cluster(_)) => self.event_cluster_member_lost(channel),
                Some(ChannelParent::Member(member)) => self.event_membership_lost(member),
                None => {}
            }
        }
        self.sessions.remove(&session);
        self.session_by_peer.remove(&peer);
        self.muxer.unregister_session(session);
        self.processor.forget_session(session);
        self.emit(HierarchyEvent::SessionClosed { peer });
    }

    // ── Receive path ───────────────────────────────────────────────

    /// Entry point for everything a peer (or the loopback) delivers.
    pub fn receive(&mut self, from: &NetworkAddress, packet: SessionPacket) {
        let now = self.now();
        let session = self.session_for_peer(from);
        if let Some(s) = self.sessions.get_mut(&session) {
            s.touch(now);
        }
        match packet {
            SessionPacket::Hello { sender, answer } => self.handle_hello(session, &sender, answer),
            SessionPacket::KeepAlive { sender } => {
                trace!(peer = %sender, "Keep-alive received");
            }
            SessionPacket::Envelope(envelope) => self.handle_envelope(session, envelope),
        }
    }

    pub fn receive_bytes(&mut self, from: &NetworkAddress, bytes: &[u8]) -> Result<(), HierarchyError> {
        let packet = SessionPacket::from_bytes(bytes)?;
        self.receive(from, packet);
        Ok(())
    }

    fn endpoints(&self, session: SessionId) -> Vec<ChannelEndpoint> {
        let Some(s) = self.sessions.get(&session) else {
            return Vec::new();
        };
        s.channels()
            .iter()
            .filter_map(|id| {
                let ch = self.channels.get(id)?;
                let local = self.channel_local_name(*id)?;
                let anchor = match ch.parent {
                    ChannelParent::Cluster(_) => ChannelAnchor::Cluster,
                    ChannelParent::Member(m) => match self.members.get(&m)?.kind {
                        MembershipKind::Base => ChannelAnchor::Member,
                        MembershipKind::CoordinatorAsMember { .. } => {
                            ChannelAnchor::CoordinatorAsMember
                        }
                    },
                };
                Some(ChannelEndpoint {
                    channel: *id,
                    local,
                    peer: ch.peer_name,
                    state: ch.state(),
                    anchor,
                })
            })
            .collect()
    }

    fn handle_envelope(&mut self, session: SessionId, envelope: Envelope) {
        let endpoints = self.endpoints(session);
        match self.muxer.resolve(session, &envelope, &endpoints) {
            Some(channel) => self.deliver(session, channel, envelope),
            None => {
                if matches!(envelope.packet.message, SignalingMessage::MembershipRequest { .. }) {
                    if let Some(s) = self.sessions.get_mut(&session) {
                        s.inbox.push_back(envelope);
                        self.processor.enqueue(WorkItem::Session(session));
                    }
                    return;
                }
                let closed = self
                    .sessions
                    .get(&session)
                    .and_then(|s| s.find_closed(&envelope.destination, &envelope.source))
                    .map(|c| c.channel);
                match closed {
                    Some(channel) => debug!(
                        channel = %channel,
                        kind = %envelope.packet.kind(),
                        source = %envelope.source,
                        "Dropping packet for closed channel"
                    ),
                    None => error!(
                        node = %self.local,
                        session = %session,
                        kind = %envelope.packet.kind(),
                        source = %envelope.source,
                        destination = %envelope.destination,
                        "No channel for envelope"
                    ),
                }
            }
        }
    }

    fn deliver(&mut self, session: SessionId, channel: ChannelId, envelope: Envelope) {
        let now = self.now();
        let Some(ch) = self.channels.get_mut(&channel) else {
            return;
        };
        let source = envelope.source;
        if ch.is_open()
            && source.has_coordinator()
            && source.same_cluster(&ch.peer_name)
            && source != ch.peer_name
        {
            ch.peer_name = source;
        }
        ch.record_packet(PacketDirection::Inbound, &envelope.packet, now);
        ch.inbox.push_back(envelope.packet);
        self.muxer
            .register(session, source, envelope.destination, channel);
        self.processor.enqueue(WorkItem::Channel(channel));
    }

    /// Run exactly one queued handler. Returns false if nothing was queued.
    pub fn process_one(&mut self) -> bool {
        let Some(item) = self.processor.next() else {
            return false;
        };
        match item {
            WorkItem::Channel(channel) => {
                let packet = self
                    .channels
                    .get_mut(&channel)
                    .and_then(|ch| ch.inbox.pop_front());
                if let Some(packet) = packet {
                    self.dispatch(channel, packet);
                }
            }
            WorkItem::Session(session) => {
                let envelope = self
                    .sessions
                    .get_mut(&session)
                    .and_then(|s| s.inbox.pop_front());
                if let Some(envelope) = envelope {
                    self.handle_membership_request(session, envelope);
                }
            }
        }
        true
    }

    /// Drain loopback traffic, queued handlers and pending elections until
    /// nothing is left. Returns the number of handlers run.
    pub fn process_all(&mut self) -> usize {
        let mut handled = 0;
        for _ in 0..MAX_PROCESSING_STEPS {
            if let Some(packet) = self.loopback_queue.pop_front() {
                let local = self.local.clone();
                self.receive(&local, packet);
                continue;
            }
            if self.process_one() {
                handled += 1;
                continue;
            }
            if self.run_elections() {
                continue;
            }
            return handled;
        }
        warn!(node = %self.local, handled, "Processing step limit reached");
        handled
    }

    fn dispatch(&mut self, channel: ChannelId, packet: SignalingPacket) {
        let Some(parent) = self.channels.get(&channel).map(|c| c.parent) else {
            return;
        };
        trace!(node = %self.local, channel = %channel, kind = %packet.kind(), "Dispatching");
        match parent {
            ChannelParent::Cluster(cluster) => self.dispatch_to_cluster(cluster, channel, packet),
            ChannelParent::Member(member) => self.dispatch_to_member(member, channel, packet),
        }
    }

    fn dispatch_to_cluster(&mut self, cluster: EntityId, channel: ChannelId, packet: SignalingPacket) {
        match &packet.message {
            SignalingMessage::MembershipAck { source, priority } => {
                self.handle_membership_ack(channel, *source, *priority)
            }
            SignalingMessage::ClusterLeft { reason } => {
                info!(channel = %channel, reason = %reason, "Member left cluster");
                self.event_cluster_member_lost(channel);
            }
            SignalingMessage::RequestAddress { address } => {
                self.event_received_requested_hrmid(channel, *address)
            }
            SignalingMessage::AnnounceAddresses { addresses } => {
                self.handle_announced_addresses(channel, addresses)
            }
            SignalingMessage::LinkActivation { active } => {
                self.handle_link_activation(channel, *active)
            }
            SignalingMessage::RouteReport { routes, .. } => {
                self.handle_route_report(cluster, channel, routes)
            }
            SignalingMessage::PriorityUpdate { priority } => {
                if let Some(ch) = self.channels.get_mut(&channel) {
                    ch.peer_priority = *priority;
                }
                if let Some(c) = self.clusters.get_mut(&cluster) {
                    c.election_dirty = true;
                }
            }
            SignalingMessage::AnnounceCoordinator { .. } => self.handle_announce(channel, &packet),
            SignalingMessage::InvalidateCoordinator { .. } => {
                self.handle_invalidate(channel, &packet)
            }
            other => warn!(
                channel = %channel,
                kind = %other.kind(),
                "Unexpected message for cluster"
            ),
        }
    }

    fn dispatch_to_member(&mut self, member: EntityId, channel: ChannelId, packet: SignalingPacket) {
        match &packet.message {
            SignalingMessage::MembershipRequest { .. } => self.acknowledge_membership(member),
            SignalingMessage::AssignAddress { address, .. } => {
                self.handle_assign_address(member, channel, *address)
            }
            SignalingMessage::RevokeAddresses { addresses } => {
                self.handle_revoke_addresses(member, channel, addresses)
            }
            SignalingMessage::MembershipCanceled { source, .. } => {
                info!(channel = %channel, cluster = %source, "Membership canceled by cluster");
                self.event_membership_lost(member);
            }
            SignalingMessage::ClusterLeft { reason } => {
                info!(channel = %channel, reason = %reason, "Cluster left");
                self.event_membership_lost(member);
            }
            SignalingMessage::RouteShare { routes } => self.handle_route_share(member, routes),
            SignalingMessage::PriorityUpdate { priority } => {
                if let Some(m) = self.members.get_mut(&member) {
                    m.remote.priority = *priority;
                }
            }
            SignalingMessage::AnnounceCoordinator { .. } => self.handle_announce(channel, &packet),
            SignalingMessage::InvalidateCoordinator { .. } => {
                self.handle_invalidate(channel, &packet)
            }
            other => warn!(
                channel = %channel,
                kind = %other.kind(),
                "Unexpected message for cluster member"
            ),
        }
    }

    // ── Timers ─────────────────────────────────────────────────────

    /// Periodic work: timeouts, keep-alives, scheduled distribution,
    /// elections, announcements, expiry and the route phases. Ends by
    /// draining everything the work produced.
    pub fn tick(&mut self) {
        let now = self.now();
        self.check_session_timeouts(now);
        self.send_keepalives(now);
        self.expire_half_open_channels(now);
        self.close_idle_sessions();
        self.ensure_neighbor_memberships();
        self.expire_proxies(now);
        self.run_scheduled_distributions(now);
        self.announce_due(now);
        self.reconcile_higher_clusters();
        self.run_elections();
        self.run_route_phases();
        self.process_all();
    }

    fn check_session_timeouts(&mut self, now: DateTime<Utc>) {
        let obsolete: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| s.is_obsolete(now))
            .map(|s| s.id)
            .collect();
        for session in obsolete {
            self.event_session_obsolete(session, "idle timeout");
        }
    }

    fn send_keepalives(&mut self, now: DateTime<Utc>) {
        let interval = self.config.keepalive_interval();
        let due: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| !s.loopback && elapsed(s.last_keepalive, now, interval))
            .map(|s| s.id)
            .collect();
        for session in due {
            if let Some(s) = self.sessions.get_mut(&session) {
                s.last_keepalive = now;
            }
            let keepalive = SessionPacket::KeepAlive {
                sender: self.local.clone(),
            };
            self.send_session(session, keepalive);
        }
    }

    /// Membership requests that were never answered are given up.
    fn expire_half_open_channels(&mut self, now: DateTime<Utc>) {
        let timeout = self.config.rendezvous_timeout();
        let stale: Vec<ChannelId> = self
            .channels
            .values()
            .filter(|ch| ch.state() == ChannelState::HalfOpen && elapsed(ch.created, now, timeout))
            .map(|ch| ch.id)
            .collect();
        for channel in stale {
            warn!(channel = %channel, "Membership request unanswered, giving up");
            self.event_cluster_member_lost(channel);
        }
    }

    /// Sessions to non-neighbors without any channel are closed.
    fn close_idle_sessions(&mut self) {
        let idle: Vec<(SessionId, NetworkAddress)> = self
            .sessions
            .values()
            .filter(|s| !s.loopback && !s.established && s.is_idle())
            .map(|s| (s.id, s.peer.clone()))
            .collect();
        for (session, peer) in idle {
            debug!(session = %session, peer = %peer, "Closing idle session");
            self.sessions.remove(&session);
            self.session_by_peer.remove(&peer);
            self.muxer.unregister_session(session);
            self.processor.forget_session(session);
        }
    }

    /// Every physical neighbor is asked to join the base cluster, also after
    /// the base cluster was torn down and rebuilt.
    fn ensure_neighbor_memberships(&mut self) {
        let base = self.local_cluster_at(HierarchyLevel::BASE);
        let missing: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| !s.loopback && s.established)
            .filter(|s| {
                let Some(base) = base.and_then(|id| self.clusters.get(&id)) else {
                    return true;
                };
                !base
                    .core
                    .channels()
                    .iter()
                    .any(|ch| self.channels.get(ch).map(|c| c.session) == Some(s.id))
            })
            .map(|s| s.id)
            .collect();
        for session in missing {
            self.request_base_membership(session);
        }
    }

    fn reconcile_higher_clusters(&mut self) {
        let higher: Vec<EntityId> = self
            .clusters
            .values()
            .filter(|c| c.core.is_valid() && c.level().is_higher_level())
            .map(|c| c.core.id)
            .collect();
        for cluster in higher {
            self.update_cluster_members(cluster);
        }
    }
}

impl std::fmt::Debug for HrmController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HrmController")
            .field("local", &self.local)
            .field("clusters", &self.clusters.len())
            .field("coordinators", &self.coordinators.len())
            .field("members", &self.members.len())
            .field("channels", &self.channels.len())
            .field("sessions", &self.sessions.len())
            .finish()
    }
}
