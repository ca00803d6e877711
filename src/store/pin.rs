use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::codec::{StreamKey, Timestamp};

/// Registry of in-flight reads. Retention never evicts at or after the oldest
/// pinned timestamp of a stream.
#[derive(Default)]
pub struct PinRegistry {
    next_id: AtomicU64,
    pins: Mutex<HashMap<u64, (StreamKey, Timestamp)>>,
}

impl PinRegistry {
    pub fn pin(self: &Arc<Self>, key: StreamKey, from: Timestamp) -> ReadPin {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.pins.lock().insert(id, (key, from));
        ReadPin {
            id,
            registry: Arc::clone(self),
        }
    }

    /// Oldest pinned timestamp for `key`, if any read is in flight.
    pub fn oldest(&self, key: &StreamKey) -> Option<Timestamp> {
        self.pins
            .lock()
            .values()
            .filter(|(k, _)| k == key)
            .map(|(_, ts)| *ts)
            .min()
    }

    pub fn active(&self) -> usize {
        self.pins.lock().len()
    }
}

/// Guard for one in-flight read; released on drop.
pub struct ReadPin {
    id: u64,
    registry: Arc<PinRegistry>,
}

impl Drop for ReadPin {
    fn drop(&mut self) {
        self.registry.pins.lock().remove(&self.id);
    }
}
