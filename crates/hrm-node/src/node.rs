//! The HrmNode runtime that drives one controller.
//!
//! Owns the controller behind an async mutex and runs the event loop:
//! network events are fed into the controller, a periodic tick runs its
//! timers, and controller events complete the connection rendezvous.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};

use hrm_hierarchy::{
    ChannelId, ConnectionRendezvous, HierarchyError, HierarchyEvent, HrmController,
};
use hrm_protocol::{HierarchyLevel, Hrmid, NetworkAddress};

use crate::config::NodeConfig;
use crate::network::{MemoryNetwork, NetworkEvent};

/// Channels keyed by (peer node, level).
pub type ChannelRendezvous = ConnectionRendezvous<(NetworkAddress, HierarchyLevel), ChannelId>;

/// Snapshot of a node for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub address: String,
    pub priority: u64,
    pub is_root: bool,
    /// Levels this node coordinates.
    pub coordinator_levels: Vec<u8>,
    /// Node addresses in dotted form.
    pub addresses: Vec<String>,
    pub sessions: usize,
    pub channels: usize,
    pub known_coordinators: usize,
}

/// One overlay node.
#[derive(Clone)]
pub struct HrmNode {
    address: NetworkAddress,
    controller: Arc<Mutex<HrmController>>,
    rendezvous: Arc<ChannelRendezvous>,
    tick_interval: Duration,
    poll_interval: Duration,
    shutdown: Arc<watch::Sender<bool>>,
}

impl HrmNode {
    /// Attach a node to `network`. The returned receiver feeds [`HrmNode::run`].
    pub fn new(
        config: &NodeConfig,
        address: NetworkAddress,
        network: &MemoryNetwork,
    ) -> Result<(Self, mpsc::UnboundedReceiver<NetworkEvent>), anyhow::Error> {
        let (transport, events) = network.attach(address.clone());
        let controller = HrmController::new(config.hierarchy.clone(), Box::new(transport))?;
        let (shutdown, _) = watch::channel(false);
        let node = Self {
            address,
            controller: Arc::new(Mutex::new(controller)),
            rendezvous: Arc::new(ChannelRendezvous::new()),
            tick_interval: Duration::from_millis(config.node.tick_interval_ms.max(1)),
            poll_interval: Duration::from_millis(config.node.poll_interval_ms.max(1)),
            shutdown: Arc::new(shutdown),
        };
        Ok((node, events))
    }

    pub fn address(&self) -> &NetworkAddress {
        &self.address
    }

    pub fn controller(&self) -> Arc<Mutex<HrmController>> {
        self.controller.clone()
    }

    pub fn rendezvous(&self) -> Arc<ChannelRendezvous> {
        self.rendezvous.clone()
    }

    /// Stop the event loop.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Run the event loop until shutdown or until the network drops the node.
    pub async fn run(
        &self,
        mut events: mpsc::UnboundedReceiver<NetworkEvent>,
    ) -> Result<(), anyhow::Error> {
        let mut shutdown = self.shutdown.subscribe();
        let mut tick = tokio::time::interval(self.tick_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(node = %self.address, "Node is running");

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        tracing::info!(node = %self.address, "Network closed");
                        break;
                    };
                    self.handle_network_event(event).await;
                }
                _ = tick.tick() => {
                    self.on_tick().await;
                }
                _ = shutdown.changed() => {
                    tracing::info!(node = %self.address, "Shutting down");
                    break;
                }
            }
        }
        Ok(())
    }

    async fn handle_network_event(&self, event: NetworkEvent) {
        let mut controller = self.controller.lock().await;
        match event {
            NetworkEvent::LinkUp(peer) => {
                tracing::debug!(node = %self.address, peer = %peer, "Peer connected");
                controller.on_peer_connected(&peer);
            }
            NetworkEvent::LinkDown(peer) => {
                tracing::debug!(node = %self.address, peer = %peer, "Peer disconnected");
                controller.on_peer_disconnected(&peer);
            }
            NetworkEvent::Packet { from, data } => {
                if let Err(e) = controller.receive_bytes(&from, &data) {
                    tracing::warn!(node = %self.address, peer = %from, error = %e, "Dropping malformed packet");
                }
            }
        }
        controller.process_all();
        let events = controller.drain_events();
        drop(controller);
        self.publish(events);
    }

    async fn on_tick(&self) {
        let mut controller = self.controller.lock().await;
        controller.tick();
        let events = controller.drain_events();
        drop(controller);
        self.publish(events);
    }

    fn publish(&self, events: Vec<HierarchyEvent>) {
        for event in events {
            match &event {
                HierarchyEvent::ChannelEstablished { channel, peer, node, .. } => {
                    self.rendezvous.complete(&(node.clone(), peer.level), *channel);
                }
                HierarchyEvent::ChannelClosed { channel, peer, node, .. } => {
                    let key = (node.clone(), peer.level);
                    if self.rendezvous.get(&key) == Some(*channel) {
                        self.rendezvous.reset(&key);
                    }
                }
                HierarchyEvent::CoordinatorElected { coordinator } => {
                    tracing::info!(node = %self.address, coordinator = %coordinator, "Coordinator elected");
                }
                HierarchyEvent::NodeAddressAssigned { address } => {
                    tracing::info!(node = %self.address, address = %address, "Node address assigned");
                }
                _ => {}
            }
            tracing::trace!(node = %self.address, event = ?event, "Hierarchy event");
        }
    }

    /// Wait until a channel at `level` to an entity on `peer` is open.
    pub async fn wait_for_channel(
        &self,
        peer: &NetworkAddress,
        level: HierarchyLevel,
        timeout: Duration,
    ) -> Result<ChannelId, HierarchyError> {
        self.rendezvous.wait(&(peer.clone(), level), timeout).await
    }

    /// Address of the local coordinator at `level`. Re-checks every poll
    /// interval until it exists or `timeout` passes.
    pub async fn wait_for_coordinator_address(
        &self,
        level: HierarchyLevel,
        timeout: Duration,
    ) -> Result<Hrmid, anyhow::Error> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(address) = self.controller.lock().await.coordinator_address(level) {
                return Ok(address);
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("no coordinator address at {level} on {}", self.address);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    pub async fn node_addresses(&self) -> Vec<Hrmid> {
        self.controller.lock().await.node_addresses()
    }

    pub async fn is_root(&self) -> bool {
        self.controller.lock().await.is_root()
    }

    pub async fn status(&self) -> NodeStatus {
        let controller = self.controller.lock().await;
        let depth = controller.config().depth;
        let mut coordinator_levels: Vec<u8> =
            controller.coordinators().map(|c| c.level().value()).collect();
        coordinator_levels.sort_unstable();
        NodeStatus {
            address: self.address.to_string(),
            priority: controller.config().priority,
            is_root: controller.is_root(),
            coordinator_levels,
            addresses: controller
                .node_addresses()
                .iter()
                .map(|a| a.to_dotted(depth))
                .collect(),
            sessions: controller.sessions().filter(|s| !s.loopback).count(),
            channels: controller.channels().count(),
            known_coordinators: controller.proxies().len(),
        }
    }
}
