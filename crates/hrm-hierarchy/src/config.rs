//! Tunables of the hierarchy layer.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use hrm_protocol::{
    Priority, ADDRESS_SETTLE_SECS, ANNOUNCE_INTERVAL_SECS, DEFAULT_ADDRESSES_PER_LEVEL,
    DEFAULT_EXPANSION_RADIUS, DEFAULT_HIERARCHY_DEPTH, KEEPALIVE_INTERVAL_SECS,
    MAX_HIERARCHY_DEPTH, PACKET_HISTORY_SIZE, PROXY_EXPIRY_SECS, RENDEZVOUS_TIMEOUT_SECS,
    SESSION_TIMEOUT_SECS, SHARE_INTERVAL_SECS,
};

use crate::HierarchyError;

/// Configuration of one controller. Durations are stored in milliseconds so
/// the struct maps 1:1 onto a TOML table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HierarchyConfig {
    /// Number of hierarchy levels, including the base level.
    pub depth: u8,
    /// Numeric sub-addresses per cluster; slot 0 is never handed out.
    pub addresses_per_level: u32,
    /// Give members back their previous slot when possible.
    pub address_reuse: bool,
    /// Allow coordinators without a firm address to hand out addresses.
    pub distribute_relative_addresses: bool,
    /// Share routes on every phase even if nothing changed.
    pub periodic_sharing: bool,
    /// Priority this node uses in elections.
    pub priority: u64,
    /// Cluster hops an announcement travels.
    pub expansion_radius: u32,
    pub address_settle_ms: u64,
    pub share_interval_ms: u64,
    pub session_timeout_ms: u64,
    pub keepalive_interval_ms: u64,
    pub announce_interval_ms: u64,
    pub proxy_expiry_ms: u64,
    pub rendezvous_timeout_ms: u64,
    pub packet_history_size: usize,
}

impl Default for HierarchyConfig {
    fn default() -> Self {
        Self {
            depth: DEFAULT_HIERARCHY_DEPTH,
            addresses_per_level: DEFAULT_ADDRESSES_PER_LEVEL,
            address_reuse: true,
            distribute_relative_addresses: false,
            periodic_sharing: false,
            priority: 1,
            expansion_radius: DEFAULT_EXPANSION_RADIUS,
            address_settle_ms: ADDRESS_SETTLE_SECS * 1000,
            share_interval_ms: SHARE_INTERVAL_SECS * 1000,
            session_timeout_ms: SESSION_TIMEOUT_SECS * 1000,
            keepalive_interval_ms: KEEPALIVE_INTERVAL_SECS * 1000,
            announce_interval_ms: ANNOUNCE_INTERVAL_SECS * 1000,
            proxy_expiry_ms: PROXY_EXPIRY_SECS * 1000,
            rendezvous_timeout_ms: RENDEZVOUS_TIMEOUT_SECS * 1000,
            packet_history_size: PACKET_HISTORY_SIZE,
        }
    }
}

impl HierarchyConfig {
    pub fn validate(&self) -> Result<(), HierarchyError> {
        if self.depth == 0 || self.depth > MAX_HIERARCHY_DEPTH {
            return Err(HierarchyError::InvalidConfig(format!(
                "depth must be within 1..={}, got {}",
                MAX_HIERARCHY_DEPTH, self.depth
            )));
        }
        if self.addresses_per_level < 2 || self.addresses_per_level > DEFAULT_ADDRESSES_PER_LEVEL
        {
            return Err(HierarchyError::InvalidConfig(format!(
                "addresses_per_level must be within 2..={}, got {}",
                DEFAULT_ADDRESSES_PER_LEVEL, self.addresses_per_level
            )));
        }
        if self.expansion_radius == 0 {
            return Err(HierarchyError::InvalidConfig(
                "expansion_radius must be at least 1".into(),
            ));
        }
        if self.packet_history_size == 0 {
            return Err(HierarchyError::InvalidConfig(
                "packet_history_size must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn local_priority(&self) -> Priority {
        Priority::new(self.priority)
    }

    pub fn address_settle(&self) -> Duration {
        Duration::from_millis(self.address_settle_ms)
    }

    pub fn share_interval(&self) -> Duration {
        Duration::from_millis(self.share_interval_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms)
    }

    pub fn proxy_expiry(&self) -> Duration {
        Duration::from_millis(self.proxy_expiry_ms)
    }

    pub fn rendezvous_timeout(&self) -> Duration {
        Duration::from_millis(self.rendezvous_timeout_ms)
    }

    /// A configuration where nothing waits for wall-clock time. Used by
    /// deterministic simulations and tests.
    pub fn immediate() -> Self {
        Self {
            address_settle_ms: 0,
            share_interval_ms: 0,
            ..Self::default()
        }
    }
}
