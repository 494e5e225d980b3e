//! Signaling message schema.
//!
//! Everything that travels between nodes is a [`SessionPacket`]. Session-level
//! packets (`Hello`, `KeepAlive`) manage the physical neighborhood; all
//! cluster signaling travels inside an [`Envelope`] that names the source and
//! destination entity so the receiving session can find the right channel.

use serde::{Deserialize, Serialize};

use crate::address::Hrmid;
use crate::error::ProtocolError;
use crate::identity::{ClusterName, NetworkAddress, Priority};
use crate::types::RoutingTable;

/// One hop of an announcement flood: which node forwarded it and through
/// which of its entities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassedCluster {
    pub node: NetworkAddress,
    pub cluster: ClusterName,
}

/// The cluster signaling protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingMessage {
    /// A cluster asks a peer entity to become its member.
    MembershipRequest {
        requesting: ClusterName,
        destination: ClusterName,
        priority: Priority,
    },
    /// The member accepts and names the entity it created for the membership.
    MembershipAck {
        source: ClusterName,
        priority: Priority,
    },
    /// Membership denied, or the member left the cluster.
    ClusterLeft { reason: String },
    /// The cluster cancels a membership.
    MembershipCanceled {
        source: ClusterName,
        destination: ClusterName,
    },
    AssignAddress {
        sender: ClusterName,
        receiver: ClusterName,
        address: Hrmid,
    },
    RevokeAddresses { addresses: Vec<Hrmid> },
    /// A member asks for a specific, previously held address.
    RequestAddress { address: Hrmid },
    /// A member tells the cluster every address its node currently holds.
    AnnounceAddresses { addresses: Vec<Hrmid> },
    /// A coordinator (de)selects the superior cluster reached through this channel.
    LinkActivation { active: bool },
    AnnounceCoordinator {
        sender_cluster: ClusterName,
        origin: NetworkAddress,
        priority: Priority,
        ttl: u32,
        passed_clusters: Vec<PassedCluster>,
        sideways: bool,
    },
    InvalidateCoordinator {
        sender_cluster: ClusterName,
        origin: NetworkAddress,
        ttl: u32,
        passed_clusters: Vec<PassedCluster>,
    },
    RouteShare { routes: RoutingTable },
    RouteReport {
        source: Hrmid,
        destination: Hrmid,
        routes: RoutingTable,
    },
    PriorityUpdate { priority: Priority },
}

/// Discriminant of [`SignalingMessage`], used for dispatch and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    MembershipRequest,
    MembershipAck,
    ClusterLeft,
    MembershipCanceled,
    AssignAddress,
    RevokeAddresses,
    RequestAddress,
    AnnounceAddresses,
    LinkActivation,
    AnnounceCoordinator,
    InvalidateCoordinator,
    RouteShare,
    RouteReport,
    PriorityUpdate,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MembershipRequest => "membership_request",
            Self::MembershipAck => "membership_ack",
            Self::ClusterLeft => "cluster_left",
            Self::MembershipCanceled => "membership_canceled",
            Self::AssignAddress => "assign_address",
            Self::RevokeAddresses => "revoke_addresses",
            Self::RequestAddress => "request_address",
            Self::AnnounceAddresses => "announce_addresses",
            Self::LinkActivation => "link_activation",
            Self::AnnounceCoordinator => "announce_coordinator",
            Self::InvalidateCoordinator => "invalidate_coordinator",
            Self::RouteShare => "route_share",
            Self::RouteReport => "route_report",
            Self::PriorityUpdate => "priority_update",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "membership_request" => Some(Self::MembershipRequest),
            "membership_ack" => Some(Self::MembershipAck),
            "cluster_left" => Some(Self::ClusterLeft),
            "membership_canceled" => Some(Self::MembershipCanceled),
            "assign_address" => Some(Self::AssignAddress),
            "revoke_addresses" => Some(Self::RevokeAddresses),
            "request_address" => Some(Self::RequestAddress),
            "announce_addresses" => Some(Self::AnnounceAddresses),
            "link_activation" => Some(Self::LinkActivation),
            "announce_coordinator" => Some(Self::AnnounceCoordinator),
            "invalidate_coordinator" => Some(Self::InvalidateCoordinator),
            "route_share" => Some(Self::RouteShare),
            "route_report" => Some(Self::RouteReport),
            "priority_update" => Some(Self::PriorityUpdate),
            _ => None,
        }
    }

    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        Self::from_str(s).ok_or_else(|| ProtocolError::UnknownMessageKind(s.to_string()))
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SignalingMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::MembershipRequest { .. } => MessageKind::MembershipRequest,
            Self::MembershipAck { .. } => MessageKind::MembershipAck,
            Self::ClusterLeft { .. } => MessageKind::ClusterLeft,
            Self::MembershipCanceled { .. } => MessageKind::MembershipCanceled,
            Self::AssignAddress { .. } => MessageKind::AssignAddress,
            Self::RevokeAddresses { .. } => MessageKind::RevokeAddresses,
            Self::RequestAddress { .. } => MessageKind::RequestAddress,
            Self::AnnounceAddresses { .. } => MessageKind::AnnounceAddresses,
            Self::LinkActivation { .. } => MessageKind::LinkActivation,
            Self::AnnounceCoordinator { .. } => MessageKind::AnnounceCoordinator,
            Self::InvalidateCoordinator { .. } => MessageKind::InvalidateCoordinator,
            Self::RouteShare { .. } => MessageKind::RouteShare,
            Self::RouteReport { .. } => MessageKind::RouteReport,
            Self::PriorityUpdate { .. } => MessageKind::PriorityUpdate,
        }
    }

    /// Announcement floods must be delivered even over inactive links.
    pub fn ignores_link_activation(&self) -> bool {
        matches!(
            self,
            Self::AnnounceCoordinator { .. }
                | Self::InvalidateCoordinator { .. }
                | Self::LinkActivation { .. }
                | Self::MembershipCanceled { .. }
                | Self::ClusterLeft { .. }
                | Self::MembershipAck { .. }
                | Self::MembershipRequest { .. }
                | Self::RevokeAddresses { .. }
                | Self::PriorityUpdate { .. }
        )
    }
}

/// A signaling message plus its packet id and source-route trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingPacket {
    pub id: String,
    /// Append-only list of hop descriptions, preserved across forwarding.
    pub trail: Vec<String>,
    pub message: SignalingMessage,
}

impl SignalingPacket {
    pub fn new(message: SignalingMessage) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            trail: Vec::new(),
            message,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }

    pub fn add_hop(&mut self, hop: impl Into<String>) {
        self.trail.push(hop.into());
    }

    /// A copy carrying `message` that keeps this packet's id and trail and
    /// records `hop`.
    pub fn forwarded(&self, hop: impl Into<String>, message: SignalingMessage) -> Self {
        let mut trail = self.trail.clone();
        trail.push(hop.into());
        Self {
            id: self.id.clone(),
            trail,
            message,
        }
    }
}

/// Signaling packet addressed from one entity to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub source: ClusterName,
    pub destination: ClusterName,
    pub packet: SignalingPacket,
}

/// Everything that crosses a physical link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionPacket {
    Hello { sender: NetworkAddress, answer: bool },
    KeepAlive { sender: NetworkAddress },
    Envelope(Envelope),
}

impl SessionPacket {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
