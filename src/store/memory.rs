use std::collections::{BTreeSet, HashMap, HashSet};

use parking_lot::Mutex;

use super::{StoreSummary, StoredSample, WriteError};
use crate::codec::{StreamKey, Timestamp};

#[derive(Default)]
struct State {
    /// Stored timestamps per stream, for duplicate suppression and eviction.
    keys: HashMap<StreamKey, BTreeSet<Timestamp>>,
    rows: usize,
    tags: HashMap<String, String>,
}

/// Volatile backend. Optionally capped, in which case writes past the cap fail
/// the way a full disk would.
pub struct MemoryBackend {
    state: Mutex<State>,
    max_samples: Option<usize>,
}

impl MemoryBackend {
    pub fn new(max_samples: Option<usize>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            max_samples,
        }
    }

    pub fn commit(&self, batch: &[StoredSample]) -> Result<Vec<bool>, WriteError> {
        let mut state = self.state.lock();

        // Dry run first so a failing batch leaves no partial state behind.
        let mut seen: HashSet<(&StreamKey, Timestamp)> = HashSet::with_capacity(batch.len());
        let keys: Vec<StreamKey> = batch.iter().map(|s| s.sample.stream_key()).collect();
        let mut inserted = Vec::with_capacity(batch.len());
        for (key, stored) in keys.iter().zip(batch) {
            let ts = stored.sample.timestamp;
            let exists = state
                .keys
                .get(key)
                .is_some_and(|stream| stream.contains(&ts));
            inserted.push(!exists && seen.insert((key, ts)));
        }

        let new_rows = inserted.iter().filter(|i| **i).count();
        if let Some(limit) = self.max_samples {
            if state.rows + new_rows > limit {
                return Err(WriteError::Full(format!(
                    "memory backend limit of {limit} samples reached"
                )));
            }
        }

        for (key, (stored, is_new)) in keys.iter().zip(batch.iter().zip(&inserted)) {
            if *is_new {
                state
                    .keys
                    .entry(key.clone())
                    .or_default()
                    .insert(stored.sample.timestamp);
            }
        }
        state.rows += new_rows;

        Ok(inserted)
    }

    pub fn evict(&self, cutoffs: &[(StreamKey, Timestamp)]) -> usize {
        let mut state = self.state.lock();
        let mut removed = 0;
        for (key, keep_from) in cutoffs {
            if let Some(stream) = state.keys.get_mut(key) {
                let kept = stream.split_off(keep_from);
                removed += stream.len();
                *stream = kept;
            }
        }
        state.rows -= removed;
        removed
    }

    pub fn set_tag(&self, device_id: &str, tag: &str) {
        self.state
            .lock()
            .tags
            .insert(device_id.to_string(), tag.to_string());
    }

    pub fn tags(&self) -> HashMap<String, String> {
        self.state.lock().tags.clone()
    }

    pub fn summary(&self) -> StoreSummary {
        let state = self.state.lock();
        let mut devices = HashSet::new();
        let mut oldest: Option<Timestamp> = None;
        let mut newest: Option<Timestamp> = None;
        let mut streams = 0;
        for (key, stream) in &state.keys {
            let (Some(first), Some(last)) = (stream.first(), stream.last()) else {
                continue;
            };
            streams += 1;
            devices.insert(key.device_id.as_str());
            oldest = Some(oldest.map_or(*first, |o| o.min(*first)));
            newest = Some(newest.map_or(*last, |n| n.max(*last)));
        }
        StoreSummary {
            total_records: state.rows as u64,
            oldest_record: oldest,
            newest_record: newest,
            streams,
            devices: devices.len(),
        }
    }
}
