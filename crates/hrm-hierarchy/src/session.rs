//! ComSession: one per physical peer (or the loopback), carrying the
//! channels of every local entity that talks to that peer.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};

use hrm_protocol::{ClusterName, Envelope, NetworkAddress, Route, CLOSED_CHANNEL_HISTORY_SIZE};

use crate::clock::elapsed;
use crate::ids::{ChannelId, SessionId};

/// A channel that used to live on the session.
#[derive(Debug, Clone)]
pub struct ClosedChannel {
    pub channel: ChannelId,
    pub local: ClusterName,
    pub peer: ClusterName,
    pub closed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ComSession {
    pub id: SessionId,
    pub peer: NetworkAddress,
    pub loopback: bool,
    /// Set once a Hello was exchanged with a physical neighbor.
    pub established: bool,
    pub route: Option<Route>,
    pub last_activity: DateTime<Utc>,
    pub last_keepalive: DateTime<Utc>,
    pub timeout: Duration,
    /// Envelopes that do not belong to a channel yet (membership requests).
    pub inbox: VecDeque<Envelope>,
    channels: Vec<ChannelId>,
    closed: VecDeque<ClosedChannel>,
}

impl ComSession {
    pub fn new(
        id: SessionId,
        peer: NetworkAddress,
        loopback: bool,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            peer,
            loopback,
            established: loopback,
            route: None,
            last_activity: now,
            last_keepalive: now,
            timeout,
            inbox: VecDeque::new(),
            channels: Vec::new(),
            closed: VecDeque::new(),
        }
    }

    pub fn channels(&self) -> &[ChannelId] {
        &self.channels
    }

    pub fn register_channel(&mut self, channel: ChannelId) {
        if !self.channels.contains(&channel) {
            self.channels.push(channel);
        }
    }

    /// Remove a channel and remember it in the closed history.
    pub fn unregister_channel(
        &mut self,
        channel: ChannelId,
        local: ClusterName,
        peer: ClusterName,
        now: DateTime<Utc>,
    ) -> bool {
        let before = self.channels.len();
        self.channels.retain(|c| *c != channel);
        if before == self.channels.len() {
            return false;
        }
        if self.closed.len() == CLOSED_CHANNEL_HISTORY_SIZE {
            self.closed.pop_front();
        }
        self.closed.push_back(ClosedChannel {
            channel,
            local,
            peer,
            closed_at: now,
        });
        true
    }

    /// Most recent closed channel matching an envelope's (destination, source).
    pub fn find_closed(&self, destination: &ClusterName, source: &ClusterName) -> Option<&ClosedChannel> {
        self.closed
            .iter()
            .rev()
            .find(|c| c.local.same_cluster(destination) && c.peer.same_cluster(source))
    }

    pub fn closed_history(&self) -> impl Iterator<Item = &ClosedChannel> {
        self.closed.iter()
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity = now;
    }

    pub fn is_obsolete(&self, now: DateTime<Utc>) -> bool {
        !self.loopback && elapsed(self.last_activity, now, self.timeout)
    }

    /// Whether the session can be closed: no channels and nothing queued.
    pub fn is_idle(&self) -> bool {
        self.channels.is_empty() && self.inbox.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hrm_protocol::HierarchyLevel;

    fn session(now: DateTime<Utc>) -> ComSession {
        ComSession::new(
            SessionId(1),
            NetworkAddress::new("b"),
            false,
            Duration::from_secs(15),
            now,
        )
    }

    #[test]
    fn obsolete_after_timeout() {
        let now = Utc::now();
        let mut s = session(now);
        assert!(!s.is_obsolete(now + chrono::Duration::seconds(10)));
        assert!(s.is_obsolete(now + chrono::Duration::seconds(15)));
        s.touch(now + chrono::Duration::seconds(10));
        assert!(!s.is_obsolete(now + chrono::Duration::seconds(15)));
    }

    #[test]
    fn loopback_never_times_out() {
        let now = Utc::now();
        let s = ComSession::new(
            SessionId(2),
            NetworkAddress::new("a"),
            true,
            Duration::from_secs(1),
            now,
        );
        assert!(s.established);
        assert!(!s.is_obsolete(now + chrono::Duration::hours(1)));
    }

    #[test]
    fn unregistered_channels_go_to_closed_history() {
        let now = Utc::now();
        let mut s = session(now);
        let local = ClusterName::new(1, HierarchyLevel::BASE, 0);
        let peer = ClusterName::new(2, HierarchyLevel::BASE, 0);
        s.register_channel(ChannelId(5));
        s.register_channel(ChannelId(5));
        assert_eq!(s.channels().len(), 1);
        assert!(s.unregister_channel(ChannelId(5), local, peer, now));
        assert!(!s.unregister_channel(ChannelId(5), local, peer, now));
        assert!(s.is_idle());
        let closed = s.find_closed(&local.with_coordinator(3), &peer).unwrap();
        assert_eq!(closed.channel, ChannelId(5));
    }

    #[test]
    fn closed_history_is_bounded() {
        let now = Utc::now();
        let mut s = session(now);
        let name = ClusterName::new(1, HierarchyLevel::BASE, 0);
        for i in 0..(CLOSED_CHANNEL_HISTORY_SIZE as u64 + 5) {
            s.register_channel(ChannelId(i));
            s.unregister_channel(ChannelId(i), name, name, now);
        }
        assert_eq!(s.closed_history().count(), CLOSED_CHANNEL_HISTORY_SIZE);
    }
}
