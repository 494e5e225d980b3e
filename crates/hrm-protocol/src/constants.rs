/// Default number of hierarchy levels (level 0 is the base level).
pub const DEFAULT_HIERARCHY_DEPTH: u8 = 3;

/// Number of address bits reserved for each hierarchy level inside an HRMID.
pub const HRMID_BITS_PER_LEVEL: u32 = 8;

/// Maximum hierarchy depth an HRMID can encode (64 bits / bits per level).
pub const MAX_HIERARCHY_DEPTH: u8 = (u64::BITS / HRMID_BITS_PER_LEVEL) as u8;

/// Default number of numeric sub-addresses per cluster (slot 0 is never handed out).
pub const DEFAULT_ADDRESSES_PER_LEVEL: u32 = 1 << HRMID_BITS_PER_LEVEL;

/// Default radius (in cluster hops) of coordinator announcement floods.
pub const DEFAULT_EXPANSION_RADIUS: u32 = 4;

/// Session idle timeout in seconds before a session is declared obsolete.
pub const SESSION_TIMEOUT_SECS: u64 = 15;

/// Keep-alive interval for physical sessions in seconds.
pub const KEEPALIVE_INTERVAL_SECS: u64 = 5;

/// Interval between periodic coordinator announcements in seconds.
pub const ANNOUNCE_INTERVAL_SECS: u64 = 5;

/// Coordinator proxies not refreshed within this window are dropped.
pub const PROXY_EXPIRY_SECS: u64 = 20;

/// Minimum time between two share (or report) phases of one coordinator.
pub const SHARE_INTERVAL_SECS: u64 = 2;

/// Time the hierarchy has to be stable before addresses are (re)distributed.
pub const ADDRESS_SETTLE_SECS: u64 = 1;

/// Maximum time a caller waits for a coordinator connection rendezvous.
pub const RENDEZVOUS_TIMEOUT_SECS: u64 = 10;

/// Number of packets remembered per channel for diagnostics.
pub const PACKET_HISTORY_SIZE: usize = 64;

/// Number of closed channels remembered per session for diagnostics.
pub const CLOSED_CHANNEL_HISTORY_SIZE: usize = 32;

/// Protocol version string.
pub const PROTOCOL_VERSION: &str = "/hrm/signaling/1.0.0";
