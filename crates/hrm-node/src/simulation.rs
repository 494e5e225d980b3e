//! A set of nodes on one in-memory network.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::task::JoinHandle;

use hrm_hierarchy::{ChannelId, HierarchyConfig};
use hrm_protocol::{HierarchyLevel, Hrmid, NetworkAddress};

use crate::config::NodeConfig;
use crate::network::MemoryNetwork;
use crate::node::{HrmNode, NodeStatus};

/// Running simulation.
pub struct Simulation {
    network: MemoryNetwork,
    nodes: Vec<HrmNode>,
    tasks: Vec<JoinHandle<()>>,
}

impl Simulation {
    /// Spawn `config.simulation.nodes` nodes and link them in the configured
    /// topology. Must be called inside a tokio runtime.
    pub fn start(config: &NodeConfig) -> Result<Self, anyhow::Error> {
        let sim = &config.simulation;
        if sim.nodes == 0 {
            anyhow::bail!("simulation needs at least one node");
        }
        let mut rng = match sim.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let network = MemoryNetwork::new();
        let mut nodes = Vec::with_capacity(sim.nodes);
        let mut tasks = Vec::with_capacity(sim.nodes);
        for index in 0..sim.nodes {
            let priority = if sim.random_priorities {
                rng.gen_range(1..=1000)
            } else {
                index as u64 + 1
            };
            let node_config = NodeConfig {
                hierarchy: HierarchyConfig {
                    priority,
                    ..config.hierarchy.clone()
                },
                ..config.clone()
            };
            let address = NetworkAddress::new(format!("node-{index}"));
            let (node, events) = HrmNode::new(&node_config, address, &network)?;
            let runner = node.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = runner.run(events).await {
                    tracing::error!(node = %runner.address(), error = %e, "Node loop failed");
                }
            }));
            tracing::info!(node = %node.address(), priority, "Node started");
            nodes.push(node);
        }

        for (a, b) in sim.topology.edges(sim.nodes) {
            network.link(nodes[a].address(), nodes[b].address());
        }

        Ok(Self {
            network,
            nodes,
            tasks,
        })
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    pub fn nodes(&self) -> &[HrmNode] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> Option<&HrmNode> {
        self.nodes.get(index)
    }

    /// Link nodes `a` and `b` and wait until both ends see the base channel
    /// between them. Returns the channel on `a`.
    pub async fn connect(
        &self,
        a: usize,
        b: usize,
        timeout: Duration,
    ) -> Result<ChannelId, anyhow::Error> {
        let (Some(first), Some(second)) = (self.nodes.get(a), self.nodes.get(b)) else {
            anyhow::bail!("cannot connect unknown nodes {a} and {b}");
        };
        self.network.link(first.address(), second.address());
        let channel = first
            .wait_for_channel(second.address(), HierarchyLevel::BASE, timeout)
            .await?;
        second
            .wait_for_channel(first.address(), HierarchyLevel::BASE, timeout)
            .await?;
        tracing::info!(a = %first.address(), b = %second.address(), channel = %channel, "Nodes connected");
        Ok(channel)
    }

    /// Wait until exactly one root exists and every node has an address.
    pub async fn wait_converged(&self, timeout: Duration) -> Result<(), anyhow::Error> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_converged().await {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("hierarchy did not converge within {timeout:?}");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn is_converged(&self) -> bool {
        let mut roots = 0;
        for node in &self.nodes {
            if node.is_root().await {
                roots += 1;
            }
            if self.nodes.len() > 1 && node.node_addresses().await.is_empty() {
                return false;
            }
        }
        roots == 1
    }

    pub async fn root(&self) -> Option<NetworkAddress> {
        for node in &self.nodes {
            if node.is_root().await {
                return Some(node.address().clone());
            }
        }
        None
    }

    pub async fn all_addresses(&self) -> Vec<Hrmid> {
        let mut all = Vec::new();
        for node in &self.nodes {
            all.extend(node.node_addresses().await);
        }
        all
    }

    pub async fn report(&self) -> Vec<NodeStatus> {
        let mut report = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            report.push(node.status().await);
        }
        report
    }

    /// Stop every node and wait for their loops to finish.
    pub async fn shutdown(self) {
        for node in &self.nodes {
            node.shutdown();
        }
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Node task failed to join");
            }
        }
    }
}
