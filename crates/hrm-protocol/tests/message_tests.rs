//! Tests for the signaling message schema.
//!
//! Verifies:
//! - MessageKind string mappings
//! - Packet ids and trail preservation across forwarding
//! - Session packet byte encoding
//! - Routing table replace/merge/filter semantics

use hrm_protocol::address::*;
use hrm_protocol::identity::*;
use hrm_protocol::messages::*;
use hrm_protocol::types::*;

fn name(id: u64, level: u8) -> ClusterName {
    ClusterName::new(id, HierarchyLevel::new(level), 0)
}

// ═══════════════════════════════════════════════════════════════
// MessageKind
// ═══════════════════════════════════════════════════════════════

#[test]
fn message_kind_roundtrip_all() {
    let kinds = [
        MessageKind::MembershipRequest,
        MessageKind::MembershipAck,
        MessageKind::ClusterLeft,
        MessageKind::MembershipCanceled,
        MessageKind::AssignAddress,
        MessageKind::RevokeAddresses,
        MessageKind::RequestAddress,
        MessageKind::AnnounceAddresses,
        MessageKind::LinkActivation,
        MessageKind::AnnounceCoordinator,
        MessageKind::InvalidateCoordinator,
        MessageKind::RouteShare,
        MessageKind::RouteReport,
        MessageKind::PriorityUpdate,
    ];
    for kind in kinds {
        assert_eq!(MessageKind::from_str(kind.as_str()), Some(kind));
    }
    assert!(MessageKind::parse("bogus").is_err());
}

#[test]
fn message_reports_its_kind() {
    let msg = SignalingMessage::RequestAddress {
        address: Hrmid::new(1),
    };
    assert_eq!(msg.kind(), MessageKind::RequestAddress);
    assert!(!msg.ignores_link_activation());
    let flood = SignalingMessage::InvalidateCoordinator {
        sender_cluster: name(1, 0),
        origin: NetworkAddress::new("a"),
        ttl: 3,
        passed_clusters: vec![],
    };
    assert!(flood.ignores_link_activation());
}

// ═══════════════════════════════════════════════════════════════
// SignalingPacket
// ═══════════════════════════════════════════════════════════════

#[test]
fn packet_has_uuid_id() {
    let packet = SignalingPacket::new(SignalingMessage::ClusterLeft {
        reason: "denied".into(),
    });
    assert_eq!(packet.id.len(), 36);
    assert!(packet.trail.is_empty());
}

#[test]
fn forwarding_preserves_id_and_trail() {
    let mut packet = SignalingPacket::new(SignalingMessage::LinkActivation { active: true });
    packet.add_hop("a");
    let forwarded = packet.forwarded("b", SignalingMessage::LinkActivation { active: false });
    assert_eq!(forwarded.id, packet.id);
    assert_eq!(forwarded.trail, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(packet.trail.len(), 1, "original trail is untouched");
}

// ═══════════════════════════════════════════════════════════════
// SessionPacket
// ═══════════════════════════════════════════════════════════════

#[test]
fn envelope_bytes_roundtrip() {
    let envelope = Envelope {
        source: name(1, 0),
        destination: name(2, 0),
        packet: SignalingPacket::new(SignalingMessage::MembershipRequest {
            requesting: name(1, 0),
            destination: ClusterName::wildcard(HierarchyLevel::BASE),
            priority: Priority::new(5),
        }),
    };
    let packet = SessionPacket::Envelope(envelope.clone());
    let bytes = packet.to_bytes().unwrap();
    let parsed = SessionPacket::from_bytes(&bytes).unwrap();
    assert_eq!(parsed, SessionPacket::Envelope(envelope));
}

#[test]
fn hello_is_tagged() {
    let hello = SessionPacket::Hello {
        sender: NetworkAddress::new("a"),
        answer: false,
    };
    let json: serde_json::Value = serde_json::from_slice(&hello.to_bytes().unwrap()).unwrap();
    assert_eq!(json["kind"], "hello");
    assert_eq!(json["sender"], "a");
}

#[test]
fn garbage_bytes_are_rejected() {
    assert!(SessionPacket::from_bytes(b"not json").is_err());
}

// ═══════════════════════════════════════════════════════════════
// RoutingTable
// ═══════════════════════════════════════════════════════════════

#[test]
fn routing_table_replaces_same_route() {
    let mut table = RoutingTable::new();
    let a = Hrmid::new(1);
    let b = Hrmid::new(2);
    assert!(table.add(RoutingEntry::direct_neighbor(a, b)));
    assert!(!table.add(RoutingEntry::direct_neighbor(a, b)));
    assert!(table.add(RoutingEntry::new(a, b, Hrmid::new(3), 2)));
    assert_eq!(table.len(), 1);
    assert_eq!(table.iter().next().unwrap().hop_count, 2);
}

#[test]
fn routing_table_merge_and_filter() {
    let a = Hrmid::new(1);
    let b = Hrmid::new(2);
    let c = Hrmid::new(3);
    let mut left: RoutingTable = [RoutingEntry::direct_neighbor(a, b)].into_iter().collect();
    let right: RoutingTable = [RoutingEntry::direct_neighbor(b, c)].into_iter().collect();
    assert!(left.merge(&right));
    assert!(!left.merge(&right));
    assert_eq!(left.len(), 2);
    let for_b = left.relevant_for(b);
    assert_eq!(for_b.len(), 2, "b is next hop of one entry and source of the other");
    let for_c = left.relevant_for(c);
    assert_eq!(for_c.len(), 1);
}

#[test]
fn chaining_keeps_first_hop() {
    let a = Hrmid::new(1);
    let b = Hrmid::new(2);
    let c = Hrmid::new(3);
    let first = RoutingEntry::direct_neighbor(a, b);
    let second = RoutingEntry::direct_neighbor(b, c);
    let chained = first.chain(&second).unwrap();
    assert_eq!(chained.source, a);
    assert_eq!(chained.destination, c);
    assert_eq!(chained.next_hop, b);
    assert_eq!(chained.hop_count, 2);
    assert!(second.chain(&first).is_none());
}
