//! Notifications the controller emits for the runtime and for tests.

use hrm_protocol::{ClusterName, Hrmid, NetworkAddress};

use crate::ids::ChannelId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HierarchyEvent {
    ClusterCreated {
        cluster: ClusterName,
    },
    ClusterInvalidated {
        cluster: ClusterName,
    },
    CoordinatorElected {
        coordinator: ClusterName,
    },
    CoordinatorResigned {
        coordinator: ClusterName,
        reason: String,
    },
    /// A channel reached the open state; completes connection rendezvous.
    ChannelEstablished {
        channel: ChannelId,
        local: ClusterName,
        peer: ClusterName,
        /// Node hosting the peer entity.
        node: NetworkAddress,
    },
    ChannelClosed {
        channel: ChannelId,
        local: ClusterName,
        peer: ClusterName,
        node: NetworkAddress,
    },
    MembershipJoined {
        cluster: ClusterName,
        peer: NetworkAddress,
    },
    MembershipLost {
        cluster: ClusterName,
    },
    AddressAssigned {
        cluster: ClusterName,
        address: Hrmid,
        peer: NetworkAddress,
    },
    NodeAddressAssigned {
        address: Hrmid,
    },
    NodeAddressRevoked {
        address: Hrmid,
    },
    CoordinatorAddressChanged {
        coordinator: ClusterName,
        address: Option<Hrmid>,
    },
    SuperiorSelected {
        coordinator: ClusterName,
        superior: Option<ClusterName>,
    },
    SessionClosed {
        peer: NetworkAddress,
    },
}
