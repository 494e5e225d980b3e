//! HRM Node - runtime for the hierarchical routing overlay
//!
//! Drives an [`hrm_hierarchy::HrmController`] from a tokio event loop:
//! - Network events (link up/down, inbound packets) from an in-memory network
//! - Periodic timer tick for sessions, elections, announcements and route phases
//! - Connection rendezvous completion from controller events
//!
//! The binary simulates a network of nodes in a line, ring or star topology.

pub mod config;
pub mod network;
pub mod node;
pub mod simulation;

pub use config::{NodeConfig, Topology};
pub use network::{MemoryNetwork, MemoryTransport, NetworkEvent};
pub use node::{HrmNode, NodeStatus};
pub use simulation::Simulation;
