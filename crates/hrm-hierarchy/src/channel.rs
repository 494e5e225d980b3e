//! ComChannel: the logical endpoint between one local entity and one peer
//! entity, multiplexed over a session.

use std::collections::{BTreeSet, VecDeque};

use chrono::{DateTime, Utc};

use hrm_protocol::{
    ClusterName, Hrmid, MessageKind, NetworkAddress, Priority, RoutingTable, SignalingPacket,
};

use crate::ids::{ChannelId, EntityId, SessionId};
use crate::HierarchyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    HalfOpen,
    Open,
    Closed,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HalfOpen => write!(f, "half-open"),
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// The local entity a channel belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChannelParent {
    Cluster(EntityId),
    Member(EntityId),
}

impl ChannelParent {
    pub fn entity(&self) -> EntityId {
        match self {
            Self::Cluster(id) | Self::Member(id) => *id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone)]
pub struct PacketRecord {
    pub direction: PacketDirection,
    pub kind: MessageKind,
    pub packet_id: String,
    pub at: DateTime<Utc>,
}

/// Bounded ring of recently seen packets, for diagnostics.
#[derive(Debug, Clone)]
pub struct PacketHistory {
    capacity: usize,
    records: VecDeque<PacketRecord>,
}

impl PacketHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: VecDeque::new(),
        }
    }

    pub fn record(&mut self, record: PacketRecord) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PacketRecord> {
        self.records.iter()
    }
}

#[derive(Debug, Clone)]
pub struct ComChannel {
    pub id: ChannelId,
    pub parent: ChannelParent,
    pub session: SessionId,
    /// Identity of the remote entity. The wildcard name until the peer
    /// acknowledges a membership request.
    pub peer_name: ClusterName,
    pub peer_address: NetworkAddress,
    pub peer_priority: Priority,
    /// Last address assigned to (or requested by) the peer.
    pub peer_hrmid: Option<Hrmid>,
    /// Addresses the peer announced as its own.
    pub peer_announced: BTreeSet<Hrmid>,
    /// Addresses assigned to the peer through this channel.
    pub assigned: BTreeSet<Hrmid>,
    /// Addresses the peer assigned to us through this channel.
    pub received: BTreeSet<Hrmid>,
    /// Numeric slots of the parent cluster consumed by the peer.
    pub consumed_slots: BTreeSet<u32>,
    /// Routes the peer reported upward.
    pub reported_routes: RoutingTable,
    /// Routes last shared to the peer.
    pub last_shared: RoutingTable,
    pub link_active: bool,
    pub inbox: VecDeque<SignalingPacket>,
    pub history: PacketHistory,
    pub created: DateTime<Utc>,
    state: ChannelState,
}

impl ComChannel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: ChannelId,
        parent: ChannelParent,
        session: SessionId,
        peer_name: ClusterName,
        peer_address: NetworkAddress,
        state: ChannelState,
        link_active: bool,
        history_size: usize,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            parent,
            session,
            peer_name,
            peer_address,
            peer_priority: Priority::default(),
            peer_hrmid: None,
            peer_announced: BTreeSet::new(),
            assigned: BTreeSet::new(),
            received: BTreeSet::new(),
            consumed_slots: BTreeSet::new(),
            reported_routes: RoutingTable::new(),
            last_shared: RoutingTable::new(),
            link_active,
            inbox: VecDeque::new(),
            history: PacketHistory::new(history_size),
            created: now,
            state,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ChannelState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state == ChannelState::Closed
    }

    /// HalfOpen -> Open. Opening an open channel is a no-op; a closed
    /// channel never reopens.
    pub fn open(&mut self) -> Result<bool, HierarchyError> {
        match self.state {
            ChannelState::HalfOpen => {
                self.state = ChannelState::Open;
                Ok(true)
            }
            ChannelState::Open => Ok(false),
            ChannelState::Closed => Err(HierarchyError::InvalidTransition {
                channel: self.id.0,
                from: self.state.to_string(),
                to: ChannelState::Open.to_string(),
            }),
        }
    }

    /// Any state -> Closed. Returns false if already closed.
    pub fn close(&mut self) -> bool {
        if self.state == ChannelState::Closed {
            return false;
        }
        self.state = ChannelState::Closed;
        self.link_active = false;
        self.inbox.clear();
        true
    }

    /// Whether the peer's identity is still unknown.
    pub fn awaits_peer(&self) -> bool {
        self.state == ChannelState::HalfOpen && self.peer_name.is_wildcard()
    }

    /// Record an address assigned to the peer through this channel.
    pub fn record_assigned(&mut self, address: Hrmid, slot: u32) {
        self.assigned.insert(address);
        self.consumed_slots.insert(slot);
        self.peer_hrmid = Some(address);
    }

    /// Forget an address assigned to the peer. Returns true if it was known.
    pub fn record_revoked(&mut self, address: Hrmid, slot: u32) -> bool {
        self.consumed_slots.remove(&slot);
        if self.peer_hrmid == Some(address) {
            self.peer_hrmid = None;
        }
        self.assigned.remove(&address)
    }

    /// Drop all assigned addresses and consumed slots, returning the
    /// addresses.
    pub fn take_assigned(&mut self) -> Vec<Hrmid> {
        self.consumed_slots.clear();
        std::mem::take(&mut self.assigned).into_iter().collect()
    }

    pub fn record_packet(
        &mut self,
        direction: PacketDirection,
        packet: &SignalingPacket,
        now: DateTime<Utc>,
    ) {
        self.history.record(PacketRecord {
            direction,
            kind: packet.kind(),
            packet_id: packet.id.clone(),
            at: now,
        });
    }
}
