//! State shared by every control entity (Cluster, Coordinator,
//! ClusterMember).

use chrono::{DateTime, Utc};

use hrm_protocol::{HierarchyLevel, Hrmid, Priority};

use crate::ids::{ChannelId, EntityId};
use crate::HierarchyError;

#[derive(Debug, Clone)]
pub struct EntityCore {
    pub id: EntityId,
    pub level: HierarchyLevel,
    pub hrmid: Option<Hrmid>,
    pub created: DateTime<Utc>,
    priority: Priority,
    /// In registration order.
    channels: Vec<ChannelId>,
    valid: bool,
}

impl EntityCore {
    pub fn new(id: EntityId, level: HierarchyLevel, priority: Priority, now: DateTime<Utc>) -> Self {
        Self {
            id,
            level,
            hrmid: None,
            created: now,
            priority,
            channels: Vec::new(),
            valid: true,
        }
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Priorities only ever grow; a lower value is rejected.
    pub fn set_priority(&mut self, priority: Priority) -> Result<bool, HierarchyError> {
        if priority < self.priority {
            return Err(HierarchyError::PriorityRegression {
                level: self.level,
                current: self.priority,
                requested: priority,
            });
        }
        let changed = priority != self.priority;
        self.priority = priority;
        Ok(changed)
    }

    pub fn channels(&self) -> &[ChannelId] {
        &self.channels
    }

    pub fn register_channel(&mut self, channel: ChannelId) {
        if !self.channels.contains(&channel) {
            self.channels.push(channel);
        }
    }

    pub fn unregister_channel(&mut self, channel: ChannelId) -> bool {
        let before = self.channels.len();
        self.channels.retain(|c| *c != channel);
        before != self.channels.len()
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// One-way. Returns false if the entity was already invalid.
    pub fn invalidate(&mut self) -> bool {
        std::mem::replace(&mut self.valid, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core() -> EntityCore {
        EntityCore::new(EntityId(1), HierarchyLevel::BASE, Priority::new(5), Utc::now())
    }

    #[test]
    fn priority_downgrade_is_rejected() {
        let mut c = core();
        assert!(c.set_priority(Priority::new(7)).unwrap());
        assert!(!c.set_priority(Priority::new(7)).unwrap());
        let err = c.set_priority(Priority::new(3)).unwrap_err();
        assert!(matches!(err, HierarchyError::PriorityRegression { .. }));
        assert_eq!(c.priority(), Priority::new(7));
    }

    #[test]
    fn channels_keep_registration_order() {
        let mut c = core();
        c.register_channel(ChannelId(3));
        c.register_channel(ChannelId(1));
        c.register_channel(ChannelId(3));
        assert_eq!(c.channels(), &[ChannelId(3), ChannelId(1)]);
        assert!(c.unregister_channel(ChannelId(3)));
        assert!(!c.unregister_channel(ChannelId(3)));
    }

    #[test]
    fn invalidation_is_one_way() {
        let mut c = core();
        assert!(c.invalidate());
        assert!(!c.invalidate());
        assert!(!c.is_valid());
    }
}
