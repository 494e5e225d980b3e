//! ComChannelMuxer: resolves an incoming envelope to one channel of a
//! session.
//!
//! Resolution order:
//! 1. the cached `(session, source, destination) -> channel` pair,
//! 2. an exact match of (destination, source) against (local, peer),
//! 3. a half-open channel whose peer is still the wildcard, on destination,
//! 4. a tolerant match on cluster id and level. Coordinator id mismatches are
//!    tolerated unless the channel is anchored by a Cluster (local id) or a
//!    CoordinatorAsClusterMember (local and remote id); zero always matches.

use std::collections::BTreeMap;

use hrm_protocol::{ClusterName, Envelope};

use crate::channel::ChannelState;
use crate::ids::{ChannelId, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelAnchor {
    /// Channel of a local cluster to one of its members.
    Cluster,
    /// Channel of a local coordinator's membership in a superior cluster.
    CoordinatorAsMember,
    /// Channel of a local base-level membership.
    Member,
}

/// What the muxer needs to know about a registered channel.
#[derive(Debug, Clone)]
pub struct ChannelEndpoint {
    pub channel: ChannelId,
    pub local: ClusterName,
    pub peer: ClusterName,
    pub state: ChannelState,
    pub anchor: ChannelAnchor,
}

impl ChannelEndpoint {
    fn exact(&self, destination: &ClusterName, source: &ClusterName) -> bool {
        self.local == *destination && self.peer == *source
    }

    fn wildcard(&self, destination: &ClusterName, source: &ClusterName) -> bool {
        self.state == ChannelState::HalfOpen
            && self.peer.is_wildcard()
            && self.peer.level == source.level
            && self.local.same_cluster(destination)
            && self.local.coordinator_compatible(destination)
    }

    fn tolerant(&self, destination: &ClusterName, source: &ClusterName) -> bool {
        if !self.local.same_cluster(destination) || !self.peer.same_cluster(source) {
            return false;
        }
        match self.anchor {
            ChannelAnchor::Cluster => self.local.coordinator_compatible(destination),
            ChannelAnchor::CoordinatorAsMember => {
                self.local.coordinator_compatible(destination)
                    && self.peer.coordinator_compatible(source)
            }
            ChannelAnchor::Member => true,
        }
    }
}

#[derive(Debug, Default)]
pub struct ComChannelMuxer {
    pairs: BTreeMap<(SessionId, ClusterName, ClusterName), ChannelId>,
}

impl ComChannelMuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache that envelopes from `source` to `target` on `session` belong to
    /// `channel`.
    pub fn register(
        &mut self,
        session: SessionId,
        source: ClusterName,
        target: ClusterName,
        channel: ChannelId,
    ) {
        self.pairs.insert((session, source, target), channel);
    }

    pub fn lookup(
        &self,
        session: SessionId,
        source: &ClusterName,
        target: &ClusterName,
    ) -> Option<ChannelId> {
        self.pairs.get(&(session, *source, *target)).copied()
    }

    pub fn unregister_channel(&mut self, channel: ChannelId) {
        self.pairs.retain(|_, c| *c != channel);
    }

    pub fn unregister_session(&mut self, session: SessionId) {
        self.pairs.retain(|(s, _, _), _| *s != session);
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Find the channel of `session` an envelope is meant for. `endpoints`
    /// are the session's registered channels in registration order.
    pub fn resolve(
        &self,
        session: SessionId,
        envelope: &Envelope,
        endpoints: &[ChannelEndpoint],
    ) -> Option<ChannelId> {
        let destination = &envelope.destination;
        let source = &envelope.source;
        let live = || endpoints.iter().filter(|e| e.state != ChannelState::Closed);

        if let Some(cached) = self.lookup(session, source, destination) {
            if live().any(|e| e.channel == cached) {
                return Some(cached);
            }
        }
        if let Some(e) = live().find(|e| e.exact(destination, source)) {
            return Some(e.channel);
        }
        if let Some(e) = live().find(|e| e.wildcard(destination, source)) {
            return Some(e.channel);
        }
        live()
            .filter(|e| e.tolerant(destination, source))
            .find(|e| e.state == ChannelState::Open)
            .or_else(|| live().find(|e| e.tolerant(destination, source)))
            .map(|e| e.channel)
    }
}
