//! HRM Hierarchy - cluster/coordinator lifecycle and channel multiplexing
//!
//! Implements the control plane of the hierarchical routing overlay:
//! - Base clusters formed from physical neighbors, recursive clustering of
//!   coordinators up to the configured depth
//! - Membership signaling over logical channels multiplexed onto sessions
//! - Hierarchical address (HRMID) allocation with reservations and reuse
//! - Coordinator announcement flooding and superior-cluster selection
//! - Route share and report phases between coordinators and members

pub mod address_pool;
pub mod channel;
pub mod clock;
pub mod cluster;
pub mod config;
pub mod controller;
pub mod coordinator;
pub mod election;
pub mod entity;
pub mod events;
pub mod flooding;
pub mod graph;
pub mod ids;
pub mod member;
pub mod muxer;
pub mod processor;
pub mod proxy;
pub mod rendezvous;
pub mod routing;
pub mod session;
pub mod transport;

pub use channel::{ChannelParent, ChannelState, ComChannel, PacketDirection};
pub use clock::{Clock, ManualClock, SystemClock};
pub use cluster::Cluster;
pub use config::HierarchyConfig;
pub use controller::HrmController;
pub use coordinator::Coordinator;
pub use election::{ElectionCandidate, ElectionOutcome, Elector, HighestPriorityElector};
pub use events::HierarchyEvent;
pub use ids::{ChannelId, EntityId, IdAllocator, SessionId};
pub use member::{ClusterMember, MembershipKind};
pub use rendezvous::ConnectionRendezvous;
pub use routing::{RoutingSink, SharedRoutingTable};
pub use session::ComSession;
pub use transport::Transport;

use hrm_protocol::{ClusterName, HierarchyLevel, Priority, ProtocolError};
use thiserror::Error;

/// Errors originating from the hierarchy layer.
#[derive(Error, Debug)]
pub enum HierarchyError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Priority regression at {level}: {current} -> {requested}")]
    PriorityRegression {
        level: HierarchyLevel,
        current: Priority,
        requested: Priority,
    },

    #[error("No superior channel for coordinator {0}")]
    NoSuperiorChannel(ClusterName),

    #[error("Superior channel CH{channel} of coordinator {coordinator} is not active")]
    InactiveSuperiorChannel {
        coordinator: ClusterName,
        channel: u64,
    },

    #[error("Invalid transition of channel CH{channel}: {from} -> {to}")]
    InvalidTransition {
        channel: u64,
        from: String,
        to: String,
    },

    #[error("Invalid hierarchy level {0}")]
    InvalidLevel(HierarchyLevel),

    #[error("Unknown entity: {0}")]
    UnknownEntity(String),

    #[error("Unknown channel: CH{0}")]
    UnknownChannel(u64),

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Address space of {capacity} slots exhausted")]
    AddressSpaceExhausted { capacity: u32 },

    #[error("Rendezvous timed out for {0}")]
    RendezvousTimeout(String),

    #[error("Membership denied: {0}")]
    MembershipDenied(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}
