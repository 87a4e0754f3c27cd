use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use crate::types::{LiveEvent, ScanId};

pub type ObserverId = Uuid;

/// Where the executor sends live events. Publishing never blocks.
pub trait Publisher: Send + Sync {
    fn publish(&self, scan_id: ScanId, event: LiveEvent);
}

/// Fans live events out to every observer subscribed to a scan.
///
/// Each observer owns a bounded queue. An observer whose queue is full or
/// closed is dropped on the next publish, so one slow client can never stall
/// a scan or the other observers.
#[derive(Clone, Default)]
pub struct BroadcastHub {
    topics: Arc<DashMap<ScanId, HashMap<ObserverId, mpsc::Sender<LiveEvent>>>>,
}

impl fmt::Debug for BroadcastHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastHub")
            .field("topic_count", &self.topics.len())
            .finish()
    }
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `tx` for events of `scan_id`.
    pub fn subscribe(&self, scan_id: ScanId, tx: mpsc::Sender<LiveEvent>) -> ObserverId {
        let id = Uuid::new_v4();
        self.topics.entry(scan_id).or_default().insert(id, tx);
        tracing::debug!(scan_id, observer = %id, "observer subscribed");
        id
    }

    /// Subscribe with a fresh queue of `capacity` events.
    pub fn subscribe_channel(
        &self,
        scan_id: ScanId,
        capacity: usize,
    ) -> (ObserverId, mpsc::Receiver<LiveEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (self.subscribe(scan_id, tx), rx)
    }

    /// Remove an observer. Unknown ids are ignored.
    pub fn unsubscribe(&self, scan_id: ScanId, id: ObserverId) {
        if let Some(mut observers) = self.topics.get_mut(&scan_id) {
            observers.remove(&id);
        }
        self.topics.remove_if(&scan_id, |_, observers| observers.is_empty());
    }

    pub fn observer_count(&self, scan_id: ScanId) -> usize {
        self.topics.get(&scan_id).map_or(0, |o| o.len())
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

impl Publisher for BroadcastHub {
    fn publish(&self, scan_id: ScanId, event: LiveEvent) {
        {
            let Some(mut observers) = self.topics.get_mut(&scan_id) else {
                return;
            };
            observers.retain(|id, tx| match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(scan_id, observer = %id, "observer lagging, evicting");
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(scan_id, observer = %id, "observer gone");
                    false
                }
            });
        }
        // The shard guard above must be released before removing.
        self.topics.remove_if(&scan_id, |_, observers| observers.is_empty());
    }
}
