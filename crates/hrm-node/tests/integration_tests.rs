//! Integration tests for the node runtime.
//!
//! These tests run real tokio event loops over the in-memory network:
//! - Small topologies converge to a single root with addressed nodes
//! - The coordinator address accessor waits for elections
//! - Connecting two nodes waits for their base channel
//! - Link loss reshapes the hierarchy

use std::collections::BTreeSet;
use std::time::Duration;

use hrm_hierarchy::{HierarchyConfig, HierarchyError};
use hrm_node::config::{RuntimeConfig, SimulationConfig};
use hrm_node::{HrmNode, MemoryNetwork, NodeConfig, Simulation, Topology};
use hrm_protocol::{HierarchyLevel, Hrmid, NetworkAddress};

const CONVERGENCE: Duration = Duration::from_secs(10);

fn config(nodes: usize, topology: Topology) -> NodeConfig {
    NodeConfig {
        node: RuntimeConfig {
            tick_interval_ms: 10,
            poll_interval_ms: 10,
        },
        hierarchy: HierarchyConfig::immediate(),
        simulation: SimulationConfig {
            nodes,
            topology,
            ..SimulationConfig::default()
        },
        ..NodeConfig::default()
    }
}

async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

// ═══════════════════════════════════════════════════════════════
// Convergence
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn two_nodes_converge() {
    let sim = Simulation::start(&config(2, Topology::Line)).unwrap();
    sim.wait_converged(CONVERGENCE).await.unwrap();

    assert_eq!(sim.root().await, Some(NetworkAddress::new("node-1")));
    let all = sim.all_addresses().await;
    assert_eq!(all.len(), 2);
    assert_ne!(all[0], all[1]);
    sim.shutdown().await;
}

#[tokio::test]
async fn line_of_three_assigns_unique_addresses() {
    let sim = Simulation::start(&config(3, Topology::Line)).unwrap();
    sim.wait_converged(CONVERGENCE).await.unwrap();

    let all = sim.all_addresses().await;
    let unique: BTreeSet<Hrmid> = all.iter().copied().collect();
    assert_eq!(unique.len(), all.len());
    assert!(all.len() >= 3);

    let report = sim.report().await;
    assert_eq!(report.iter().filter(|s| s.is_root).count(), 1);
    assert!(report.iter().all(|s| !s.addresses.is_empty()));
    sim.shutdown().await;
}

#[tokio::test]
async fn root_holds_zero_address() {
    let sim = Simulation::start(&config(2, Topology::Line)).unwrap();
    sim.wait_converged(CONVERGENCE).await.unwrap();

    let root = sim.node(1).unwrap();
    let top = HierarchyLevel::new(HierarchyConfig::default().depth - 1);
    let address = root
        .wait_for_coordinator_address(top, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(address, Hrmid::ZERO);
    sim.shutdown().await;
}

#[tokio::test]
async fn empty_simulation_is_rejected() {
    assert!(Simulation::start(&config(0, Topology::Star)).is_err());
}

// ═══════════════════════════════════════════════════════════════
// Runtime
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn lone_node_never_gets_coordinator_address() {
    let network = MemoryNetwork::new();
    let (node, events) =
        HrmNode::new(&config(1, Topology::Line), NetworkAddress::new("solo"), &network).unwrap();
    let runner = node.clone();
    let task = tokio::spawn(async move { runner.run(events).await });

    let result = node
        .wait_for_coordinator_address(HierarchyLevel::BASE, Duration::from_millis(200))
        .await;
    assert!(result.is_err());

    node.shutdown();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn connect_waits_for_base_channel() {
    let sim = Simulation::start(&config(3, Topology::Line)).unwrap();
    sim.wait_converged(CONVERGENCE).await.unwrap();

    let channel = sim.connect(0, 2, CONVERGENCE).await.unwrap();
    let (first, last) = (sim.node(0).unwrap(), sim.node(2).unwrap());
    let controller = first.controller();
    {
        let controller = controller.lock().await;
        let ch = controller.channel(channel).expect("channel registered");
        assert_eq!(&ch.peer_address, last.address());
        assert!(!ch.is_closed());
    }
    let again = first
        .wait_for_channel(last.address(), HierarchyLevel::BASE, Duration::from_millis(10))
        .await;
    assert!(again.is_ok());
    sim.shutdown().await;
}

#[tokio::test]
async fn connect_rejects_unknown_nodes() {
    let sim = Simulation::start(&config(2, Topology::Line)).unwrap();
    assert!(sim.connect(0, 5, Duration::from_millis(50)).await.is_err());
    sim.shutdown().await;
}

#[tokio::test]
async fn waiting_for_unlinked_peer_times_out() {
    let sim = Simulation::start(&config(2, Topology::Line)).unwrap();
    let result = sim
        .node(0)
        .unwrap()
        .wait_for_channel(
            &NetworkAddress::new("nowhere"),
            HierarchyLevel::BASE,
            Duration::from_millis(100),
        )
        .await;
    assert!(matches!(result, Err(HierarchyError::RendezvousTimeout(_))));
    sim.shutdown().await;
}

#[tokio::test]
async fn losing_a_link_reshapes_hierarchy() {
    let sim = Simulation::start(&config(3, Topology::Star)).unwrap();
    sim.wait_converged(CONVERGENCE).await.unwrap();

    let (center, cut) = (sim.node(0).unwrap(), sim.node(2).unwrap());
    sim.network().unlink(center.address(), cut.address());

    let survivors = [sim.node(0).unwrap(), sim.node(1).unwrap()];
    let survivors = &survivors;
    let reshaped = wait_until(CONVERGENCE, move || async move {
        let mut roots = 0;
        for node in survivors {
            if node.node_addresses().await.is_empty() {
                return false;
            }
            if node.is_root().await {
                roots += 1;
            }
        }
        roots == 1 && cut.node_addresses().await.is_empty()
    })
    .await;
    assert!(reshaped);
    sim.shutdown().await;
}
