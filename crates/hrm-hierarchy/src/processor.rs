//! Serialized work queue between the receive path and the entity handlers.
//!
//! The receive path only enqueues: a packet lands in its channel's inbox (or
//! the session's inbox if it creates a channel) and a work item is queued.
//! `HrmController::process_one` pops one item and runs exactly one handler,
//! so a channel's packets are handled in arrival order, one at a time.

use std::collections::VecDeque;

use crate::ids::{ChannelId, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkItem {
    /// Handle the oldest packet in the channel's inbox.
    Channel(ChannelId),
    /// Handle the oldest envelope in the session's inbox.
    Session(SessionId),
}

#[derive(Debug, Default)]
pub struct PacketProcessor {
    queue: VecDeque<WorkItem>,
    processed: u64,
}

impl PacketProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, item: WorkItem) {
        self.queue.push_back(item);
    }

    pub fn next(&mut self) -> Option<WorkItem> {
        let item = self.queue.pop_front();
        if item.is_some() {
            self.processed += 1;
        }
        item
    }

    /// Drop queued work for a channel that was torn down.
    pub fn forget_channel(&mut self, channel: ChannelId) {
        self.queue.retain(|item| *item != WorkItem::Channel(channel));
    }

    pub fn forget_session(&mut self, session: SessionId) {
        self.queue.retain(|item| *item != WorkItem::Session(session));
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }
}
