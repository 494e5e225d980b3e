//! End-to-end tests of the hierarchy control plane.
//!
//! Verifies:
//! - Base clusters, elections and recursive clustering up to the root
//! - Unique hierarchical addresses for every node
//! - Requested addresses survive reconnects and displace later holders
//! - Shared routes only carry entries that concern the receiving member
//! - Members announce their own addresses to the clusters they join
//! - Session timeouts clean up members, slots and routes
//! - Announcement floods stay within the expansion radius
//! - Floods that come around a ring are forwarded once per channel
//! - Priority changes move the root and switch superiors

mod common;

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use common::TestNetwork;
use hrm_hierarchy::{
    ChannelParent, ElectionCandidate, ElectionOutcome, Elector, HierarchyConfig, HierarchyError,
    HierarchyEvent, PacketDirection,
};
use hrm_protocol::{
    ClusterName, HierarchyLevel, Hrmid, MessageKind, NetworkAddress, Priority, SignalingMessage,
};

const L0: HierarchyLevel = HierarchyLevel::BASE;

fn l(level: u8) -> HierarchyLevel {
    HierarchyLevel::new(level)
}

fn assert_unique(addresses: &[Hrmid]) {
    let set: BTreeSet<_> = addresses.iter().collect();
    assert_eq!(set.len(), addresses.len(), "duplicate addresses: {addresses:?}");
}

/// Wins every election it is asked about.
struct EveryoneWins {
    priorities: BTreeMap<HierarchyLevel, Priority>,
    default: Priority,
}

impl EveryoneWins {
    fn boxed(priority: u64) -> Box<dyn Elector> {
        Box::new(Self {
            priorities: BTreeMap::new(),
            default: Priority::new(priority),
        })
    }
}

impl Elector for EveryoneWins {
    fn current_priority(&self, level: HierarchyLevel) -> Priority {
        self.priorities.get(&level).copied().unwrap_or(self.default)
    }

    fn set_priority(&mut self, level: HierarchyLevel, priority: Priority) {
        self.priorities.insert(level, priority);
    }

    fn decide(
        &self,
        _cluster: &ClusterName,
        _local: &ElectionCandidate,
        _candidates: &[ElectionCandidate],
    ) -> ElectionOutcome {
        ElectionOutcome::Won
    }

    fn on_announcement_received(
        &mut self,
        _level: HierarchyLevel,
        _priority: Priority,
        _winner: &NetworkAddress,
        _covered_peers: &[NetworkAddress],
    ) -> bool {
        false
    }

    fn on_coordinator_invalidated(&mut self, _level: HierarchyLevel, _winner: &NetworkAddress) -> bool {
        false
    }
}

// ═══════════════════════════════════════════════════════════════
// Convergence
// ═══════════════════════════════════════════════════════════════

#[test]
fn two_nodes_elect_highest_priority_as_root() {
    let mut net = TestNetwork::new(&[("a", 1), ("b", 2)]);
    net.link("a", "b");
    net.converge();

    let b = net.node("b");
    assert!(b.is_root());
    assert!(!net.node("a").is_root());
    assert!(b.coordinator_at(L0).is_some());
    assert!(b.coordinator_at(l(1)).is_some());
    assert_eq!(b.coordinator_address(l(2)), Some(Hrmid::ZERO));
    assert!(net.node("a").coordinators().next().is_none());

    let a_addrs = net.addresses("a");
    let b_addrs = net.addresses("b");
    assert_eq!(a_addrs.len(), 1);
    assert_eq!(b_addrs.len(), 1);
    assert_ne!(a_addrs[0], b_addrs[0]);
    assert!(a_addrs[0].is_within(&b_addrs[0], L0));
    assert!(!a_addrs[0].is_zero());
}

#[test]
fn hello_exchange_opens_one_base_channel() {
    let mut net = TestNetwork::new(&[("a", 1), ("b", 2)]);
    net.link("a", "b");
    net.converge();

    let a = net.node("a");
    let base = a.cluster_at(L0).expect("base cluster");
    let channels = a
        .channels()
        .filter(|c| c.parent == ChannelParent::Cluster(base.core.id))
        .count();
    assert_eq!(channels, 1);
}

#[test]
fn three_node_line_assigns_unique_addresses() {
    let mut net = TestNetwork::new(&[("a", 1), ("b", 2), ("c", 3)]);
    net.link("a", "b");
    net.link("b", "c");
    net.converge();

    assert!(net.node("c").is_root());
    assert!(!net.node("a").is_root());
    assert!(!net.node("b").is_root());

    for name in ["a", "b", "c"] {
        assert!(!net.addresses(name).is_empty(), "{name} has no address");
    }
    assert_unique(&net.all_addresses());
}

#[test]
fn members_learn_routes_from_coordinator() {
    let mut net = TestNetwork::new(&[("a", 1), ("b", 2)]);
    net.link("a", "b");
    net.converge();

    let b_addr = net.addresses("b")[0];
    let a_addr = net.addresses("a")[0];
    assert_eq!(net.routing("a").lookup(b_addr), Some(NetworkAddress::new("b")));
    assert_eq!(net.routing("b").lookup(a_addr), Some(NetworkAddress::new("a")));
    assert!(!net.routing("a").snapshot().routes.is_empty());
}

// ═══════════════════════════════════════════════════════════════
// Route sharing
// ═══════════════════════════════════════════════════════════════

#[test]
fn shared_routes_concern_their_peer() {
    let mut net = TestNetwork::new(&[("a", 1), ("b", 9), ("c", 2), ("e", 3)]);
    net.link("b", "a");
    net.link("b", "c");
    net.link("c", "e");
    net.converge();

    let mut checked = 0;
    for name in ["a", "b", "c", "e"] {
        for ch in net.node(name).channels() {
            let Some(peer) = ch.peer_hrmid else {
                continue;
            };
            for entry in ch.last_shared.iter() {
                assert!(
                    entry.source == peer || entry.next_hop == peer,
                    "{name} shared {entry} with {peer}"
                );
                checked += 1;
            }
        }
    }
    assert!(checked > 0);
}

#[test]
fn cluster_records_addresses_announced_by_member() {
    let mut net = TestNetwork::new(&[("a", 1), ("b", 2)]);
    net.link("a", "b");
    net.converge();

    let own: BTreeSet<Hrmid> = net.addresses("a").into_iter().collect();
    assert!(!own.is_empty());

    let b = net.node("b");
    let base = b.cluster_at(L0).expect("base cluster").core.id;
    let channel = b
        .channels()
        .find(|ch| ch.parent == ChannelParent::Cluster(base) && ch.peer_address == NetworkAddress::new("a"))
        .expect("channel to a");
    assert_eq!(channel.peer_announced, own);
}

// ═══════════════════════════════════════════════════════════════
// Address reuse
// ═══════════════════════════════════════════════════════════════

#[test]
fn reconnecting_node_gets_its_address_back() {
    let mut net = TestNetwork::new(&[("a", 1), ("b", 9), ("c", 2)]);
    net.link("b", "a");
    net.link("b", "c");
    net.converge();
    let before = net.addresses("a");
    assert_eq!(before.len(), 1);

    net.unlink("b", "a");
    net.converge();
    assert!(net.addresses("a").is_empty());

    net.link("b", "a");
    net.converge();
    assert_eq!(net.addresses("a"), before);
    assert_unique(&net.all_addresses());
}

#[test]
fn requester_displaces_later_holder() {
    let mut net = TestNetwork::new(&[("a", 1), ("b", 9), ("c", 2), ("e", 3)]);
    net.link("b", "a");
    net.link("b", "c");
    net.converge();
    let a_addr = net.addresses("a")[0];

    net.unlink("b", "a");
    net.converge();
    net.link("b", "e");
    net.converge();
    assert_eq!(net.addresses("e"), vec![a_addr]);

    net.link("b", "a");
    net.converge();
    assert_eq!(net.addresses("a"), vec![a_addr]);
    let e_addrs = net.addresses("e");
    assert_eq!(e_addrs.len(), 1);
    assert_ne!(e_addrs[0], a_addr);
    assert_unique(&net.all_addresses());
}

// ═══════════════════════════════════════════════════════════════
// Failure handling
// ═══════════════════════════════════════════════════════════════

#[test]
fn silent_peer_times_out() {
    let mut net = TestNetwork::new(&[("a", 1), ("b", 9), ("c", 2)]);
    net.link("b", "a");
    net.link("b", "c");
    net.converge();
    let a_addr = net.addresses("a")[0];
    assert!(net.routing("b").lookup(a_addr).is_some());

    net.mute("a");
    for _ in 0..4 {
        net.advance(Duration::from_secs(5));
        net.tick_all();
        net.settle();
    }

    let b = net.node("b");
    assert!(b.session_to(&NetworkAddress::new("a")).is_none());
    assert!(b.session_to(&NetworkAddress::new("c")).is_some());
    let base = b.cluster_at(L0).expect("base cluster survives");
    assert_eq!(base.pool.used_count(), 2);
    assert!(net.routing("b").lookup(a_addr).is_none());
    assert_eq!(net.addresses("c").len(), 1);
}

#[test]
fn timeout_closes_every_channel_of_the_session() {
    let config = HierarchyConfig {
        depth: 2,
        ..HierarchyConfig::immediate()
    };
    let mut net = TestNetwork::with_config(&[("a", 1), ("b", 2)], config);
    net.set_elector("a", EveryoneWins::boxed(1));
    net.set_elector("b", EveryoneWins::boxed(2));
    net.link("a", "b");
    net.converge();

    let a = NetworkAddress::new("a");
    let session = net.node("b").session_to(&a).expect("session to a");
    assert!(session.channels().len() >= 3, "{:?}", session.channels());

    net.mute("a");
    for _ in 0..8 {
        net.advance(Duration::from_secs(5));
        net.tick_all();
        net.settle();
    }

    let b = net.node("b");
    assert!(b.session_to(&a).is_none());
    assert!(!b.channels().any(|ch| ch.peer_address == a && !ch.is_closed()));
    assert!(!b.members().any(|m| m.remote.node == a));
    assert!(!net.routing("b").snapshot().mappings.values().any(|node| *node == a));
}

#[test]
fn announcements_respect_expansion_radius() {
    let config = HierarchyConfig {
        expansion_radius: 2,
        ..HierarchyConfig::immediate()
    };
    let mut net = TestNetwork::with_config(
        &[("a", 5), ("b", 1), ("c", 2), ("d", 3), ("e", 4)],
        config,
    );
    net.link("a", "b");
    net.link("b", "c");
    net.link("c", "d");
    net.link("d", "e");
    net.converge();

    for name in ["a", "b", "c", "d", "e"] {
        for proxy in net.node(name).proxies().iter() {
            assert!(proxy.distance <= 2, "{name} knows {proxy:?}");
        }
    }
    let far = NetworkAddress::new("e");
    assert!(!net
        .node("a")
        .proxies()
        .iter()
        .any(|p| p.level() == L0 && p.node == far));
}

// ═══════════════════════════════════════════════════════════════
// Flooding
// ═══════════════════════════════════════════════════════════════

#[test]
fn ring_flood_is_forwarded_once_per_channel() {
    let config = HierarchyConfig {
        depth: 1,
        expansion_radius: 3,
        packet_history_size: 4096,
        ..HierarchyConfig::immediate()
    };
    let mut net = TestNetwork::with_config(&[("a", 1), ("b", 2), ("c", 3), ("d", 4)], config);
    net.link("a", "b");
    net.link("b", "c");
    net.link("c", "d");
    net.link("d", "a");
    net.converge();

    let is_flood =
        |kind: MessageKind| matches!(kind, MessageKind::AnnounceCoordinator | MessageKind::InvalidateCoordinator);
    let mut arrived_twice = false;
    for name in ["a", "b", "c", "d"] {
        let node = net.node(name);
        let loopback = node.loopback_session();
        let mut arrivals: BTreeMap<String, usize> = BTreeMap::new();
        for ch in node.channels().filter(|ch| ch.session != loopback) {
            let mut sent = BTreeSet::new();
            for record in ch.history.iter().filter(|r| is_flood(r.kind)) {
                match record.direction {
                    PacketDirection::Inbound => {
                        *arrivals.entry(record.packet_id.clone()).or_default() += 1;
                    }
                    PacketDirection::Outbound => {
                        assert!(
                            sent.insert(record.packet_id.clone()),
                            "{name} sent {} twice on {}",
                            record.packet_id,
                            ch.id
                        );
                    }
                }
            }
        }
        arrived_twice |= arrivals.values().any(|count| *count > 1);
    }
    assert!(arrived_twice, "no flood came around the ring");
}

// ═══════════════════════════════════════════════════════════════
// Priorities
// ═══════════════════════════════════════════════════════════════

#[test]
fn priority_regression_is_rejected() {
    let mut net = TestNetwork::new(&[("a", 4)]);
    let err = net
        .node_mut("a")
        .event_priority_changed(L0, Priority::new(2))
        .unwrap_err();
    assert!(matches!(err, HierarchyError::PriorityRegression { .. }));

    let err = net
        .node_mut("a")
        .event_priority_changed(l(7), Priority::new(9))
        .unwrap_err();
    assert!(matches!(err, HierarchyError::InvalidLevel(_)));
}

#[test]
fn raised_priority_moves_root_and_superior() {
    let mut net = TestNetwork::new(&[("a", 1), ("b", 2), ("c", 3)]);
    net.link("a", "b");
    net.link("b", "c");
    net.converge();
    assert!(net.node("c").is_root());

    net.node_mut("a")
        .event_priority_changed(l(1), Priority::new(10))
        .unwrap();
    net.converge();

    let a = net.node("a");
    assert!(a.is_root());
    assert!(!net.node("c").is_root());

    let own_l1 = a.cluster_at(l(1)).expect("level 1 cluster").name;
    let link = a
        .coordinator_at(L0)
        .and_then(|c| c.superior().copied())
        .expect("superior selected");
    let member = a.member(link.membership).expect("superior membership");
    assert!(member.remote.name.same_cluster(&own_l1));
}

#[test]
fn superior_switch_deactivates_previous_link() {
    let mut net = TestNetwork::new(&[("a", 1), ("b", 2), ("c", 3)]);
    net.link("a", "b");
    net.link("b", "c");
    net.converge();
    let before = net
        .node("a")
        .coordinator_at(L0)
        .and_then(|c| c.superior().copied())
        .expect("initial superior");
    let (old_node, old_cluster) = net
        .node("a")
        .member(before.membership)
        .map(|m| (m.remote.node.clone(), m.remote.name))
        .expect("superior membership");
    net.node_mut("a").drain_events();

    net.node_mut("a")
        .event_priority_changed(l(1), Priority::new(10))
        .unwrap();
    net.converge();

    let a = net.node("a");
    let coordinator = a.coordinator_at(L0).expect("base coordinator");
    let id = coordinator.core.id;
    let after = coordinator.superior().copied().expect("superior selected");
    assert_ne!(after.channel, before.channel);
    assert_ne!(after.membership, before.membership);
    if let Some(old) = a.channel(before.channel) {
        assert!(!old.link_active);
        assert!(old.history.iter().any(|r| {
            r.direction == PacketDirection::Outbound && r.kind == MessageKind::LinkActivation
        }));
    }
    assert!(a
        .member(before.membership)
        .map_or(true, |m| m.core.hrmid.is_none()));
    assert!(a.channel(after.channel).is_some_and(|ch| ch.link_active));

    let host = net.node(old_node.as_str());
    let a_addr = NetworkAddress::new("a");
    for cluster in host.clusters().filter(|c| c.name.same_cluster(&old_cluster)) {
        for ch in host
            .channels()
            .filter(|ch| ch.parent == ChannelParent::Cluster(cluster.core.id) && ch.peer_address == a_addr)
        {
            assert!(!ch.link_active);
            assert!(ch.assigned.is_empty(), "{:?} still assigned", ch.assigned);
        }
    }

    let events = net.node_mut("a").drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        HierarchyEvent::SuperiorSelected {
            superior: Some(_),
            ..
        }
    )));

    let last_id = |net: &TestNetwork, channel| {
        net.node("a")
            .channel(channel)
            .and_then(|ch| ch.history.iter().last().map(|r| r.packet_id.clone()))
    };
    let old_last = last_id(&net, before.channel);
    net.node_mut("a")
        .send_superior_coordinator(
            id,
            SignalingMessage::PriorityUpdate {
                priority: Priority::new(10),
            },
        )
        .unwrap();

    let a = net.node("a");
    let record = a
        .channel(after.channel)
        .and_then(|ch| ch.history.iter().last())
        .expect("recorded send");
    assert_eq!(record.direction, PacketDirection::Outbound);
    assert_eq!(record.kind, MessageKind::PriorityUpdate);
    assert_eq!(last_id(&net, before.channel), old_last);
}
