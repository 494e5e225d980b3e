//! Tests for the identity value types.
//!
//! Verifies:
//! - NetworkAddress behavior as a map key
//! - HierarchyLevel bounds, increments and comparisons
//! - ClusterName equality and coordinator compatibility
//! - Priority ordering

use hrm_protocol::constants::*;
use hrm_protocol::identity::*;

// ═══════════════════════════════════════════════════════════════
// NetworkAddress
// ═══════════════════════════════════════════════════════════════

#[test]
fn network_address_display() {
    let addr = NetworkAddress::new("node-a");
    assert_eq!(format!("{}", addr), "node-a");
    assert_eq!(addr.as_str(), "node-a");
}

#[test]
fn network_address_hash_consistency() {
    use std::collections::HashSet;
    let mut set = HashSet::new();
    set.insert(NetworkAddress::new("node-a"));
    assert!(set.contains(&NetworkAddress::new("node-a")));
    assert!(!set.contains(&NetworkAddress::new("node-b")));
}

// ═══════════════════════════════════════════════════════════════
// HierarchyLevel
// ═══════════════════════════════════════════════════════════════

#[test]
fn base_level_is_zero() {
    assert!(HierarchyLevel::BASE.is_base_level());
    assert!(!HierarchyLevel::BASE.is_higher_level());
    assert_eq!(HierarchyLevel::default(), HierarchyLevel::BASE);
}

#[test]
fn level_inc_and_dec_produce_new_values() {
    let base = HierarchyLevel::BASE;
    let one = base.inc();
    assert_eq!(one.value(), 1);
    assert_eq!(base.value(), 0, "inc must not mutate the original");
    assert_eq!(one.dec(), Some(base));
    assert_eq!(base.dec(), None);
}

#[test]
fn highest_level_depends_on_depth() {
    let depth = DEFAULT_HIERARCHY_DEPTH;
    assert!(!HierarchyLevel::new(0).is_highest(depth));
    assert!(!HierarchyLevel::new(1).is_highest(depth));
    assert!(HierarchyLevel::new(2).is_highest(depth));
    assert!(HierarchyLevel::new(0).is_highest(1));
}

#[test]
fn highest_level_check_does_not_overflow() {
    assert!(HierarchyLevel::new(u8::MAX).is_highest(3));
    assert!(HierarchyLevel::new(u8::MAX).is_highest(u8::MAX));
    assert!(!HierarchyLevel::new(1).is_highest(3));
}

#[test]
fn checked_level_rejects_out_of_range() {
    assert!(HierarchyLevel::checked(2, 3).is_ok());
    assert!(HierarchyLevel::checked(3, 3).is_err());
    assert!(!HierarchyLevel::new(5).is_valid(3));
}

#[test]
fn level_ordering() {
    let l0 = HierarchyLevel::new(0);
    let l1 = HierarchyLevel::new(1);
    assert!(l1.is_higher_than(&l0));
    assert!(!l0.is_higher_than(&l1));
    assert!(l0 < l1);
    assert_eq!(format!("{}", l1), "L1");
}

// ═══════════════════════════════════════════════════════════════
// ClusterName
// ═══════════════════════════════════════════════════════════════

#[test]
fn cluster_name_equality_uses_all_fields() {
    let a = ClusterName::new(7, HierarchyLevel::BASE, 3);
    let b = ClusterName::new(7, HierarchyLevel::BASE, 3);
    let c = ClusterName::new(7, HierarchyLevel::BASE, 4);
    let d = ClusterName::new(7, HierarchyLevel::new(1), 3);
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_ne!(a, d);
}

#[test]
fn cluster_name_same_cluster_ignores_coordinator() {
    let a = ClusterName::new(7, HierarchyLevel::BASE, 3);
    let c = a.with_coordinator(9);
    assert!(a.same_cluster(&c));
    assert_ne!(a, c);
}

#[test]
fn coordinator_compatibility_treats_zero_as_unknown() {
    let unknown = ClusterName::new(7, HierarchyLevel::BASE, 0);
    let three = ClusterName::new(7, HierarchyLevel::BASE, 3);
    let four = ClusterName::new(7, HierarchyLevel::BASE, 4);
    assert!(unknown.coordinator_compatible(&three));
    assert!(three.coordinator_compatible(&unknown));
    assert!(three.coordinator_compatible(&three));
    assert!(!three.coordinator_compatible(&four));
}

#[test]
fn wildcard_name() {
    let w = ClusterName::wildcard(HierarchyLevel::new(1));
    assert!(w.is_wildcard());
    assert!(!w.has_coordinator());
    assert_eq!(w.level, HierarchyLevel::new(1));
}

#[test]
fn cluster_name_serialization_roundtrip() {
    let name = ClusterName::new(42, HierarchyLevel::new(2), 17);
    let json = serde_json::to_string(&name).unwrap();
    let parsed: ClusterName = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, name);
}

// ═══════════════════════════════════════════════════════════════
// Priority
// ═══════════════════════════════════════════════════════════════

#[test]
fn priority_comparison() {
    let low = Priority::new(1);
    let high = Priority::new(10);
    assert!(high.is_higher_than(&low));
    assert!(!low.is_higher_than(&high));
    assert!(!low.is_higher_than(&low));
}
