//! Keyed rendezvous with a bounded wait.
//!
//! Callers that need a channel between two entities wait on the
//! `(source, target)` key until whoever establishes the channel completes it.
//! Completion wakes every waiter at once.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;

use crate::HierarchyError;

pub struct ConnectionRendezvous<K: Ord + Clone, V: Clone> {
    slots: Mutex<BTreeMap<K, watch::Sender<Option<V>>>>,
}

impl<K: Ord + Clone, V: Clone> Default for ConnectionRendezvous<K, V> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(BTreeMap::new()),
        }
    }
}

impl<K: Ord + Clone + std::fmt::Debug, V: Clone> ConnectionRendezvous<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    fn receiver(&self, key: &K) -> watch::Receiver<Option<V>> {
        let mut slots = match self.slots.lock() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        };
        slots
            .entry(key.clone())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }

    /// Publish the value for `key` and wake every waiter.
    pub fn complete(&self, key: &K, value: V) {
        let mut slots = match self.slots.lock() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        };
        let sender = slots
            .entry(key.clone())
            .or_insert_with(|| watch::channel(None).0);
        sender.send_replace(Some(value));
    }

    /// Forget the value for `key` so later waiters block again.
    pub fn reset(&self, key: &K) {
        let slots = match self.slots.lock() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(sender) = slots.get(key) {
            sender.send_replace(None);
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let receiver = self.receiver(key);
        let value = receiver.borrow().clone();
        value
    }

    /// Wait until `key` is completed or `timeout` passes.
    pub async fn wait(&self, key: &K, timeout: Duration) -> Result<V, HierarchyError> {
        let mut receiver = self.receiver(key);
        let result = tokio::time::timeout(timeout, async {
            loop {
                let current = receiver.borrow_and_update().clone();
                if let Some(value) = current {
                    return Some(value);
                }
                if receiver.changed().await.is_err() {
                    return None;
                }
            }
        })
        .await;
        match result {
            Ok(Some(value)) => Ok(value),
            _ => Err(HierarchyError::RendezvousTimeout(format!("{:?}", key))),
        }
    }
}
