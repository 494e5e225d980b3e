//! HRM - Core identity types and signaling message definitions
//!
//! Defines the vocabulary shared by every node of the hierarchical routing
//! overlay: hierarchy levels, cluster names, hierarchical addresses
//! (HRMIDs), priorities, routing entries and the tagged signaling schema
//! exchanged between cluster entities.

pub mod address;
pub mod constants;
pub mod error;
pub mod identity;
pub mod messages;
pub mod types;

pub use address::*;
pub use constants::*;
pub use error::*;
pub use identity::*;
pub use messages::*;
pub use types::*;
