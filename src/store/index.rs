//! In-memory tail index over committed samples.
//!
//! Each stream owns its own `RwLock`, so a reader of one stream never waits on
//! a writer of another, and a reader of the same stream waits at most for one
//! batch publish. Entries are kept sorted by `(timestamp, seq)`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;

use super::{Cursor, QueryError, StoredSample};
use crate::codec::{StreamKey, Timestamp};

#[derive(Default)]
struct StreamLog {
    entries: VecDeque<Arc<StoredSample>>,
}

impl StreamLog {
    fn insert(&mut self, entry: Arc<StoredSample>) {
        let key = entry.order_key();
        match self.entries.back() {
            Some(last) if last.order_key() > key => {
                let pos = self.entries.partition_point(|e| e.order_key() <= key);
                self.entries.insert(pos, entry);
            }
            _ => self.entries.push_back(entry),
        }
    }

    fn head(&self) -> Option<Timestamp> {
        self.entries.back().map(|e| e.sample.timestamp)
    }
}

/// Outcome of evicting one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction {
    pub key: StreamKey,
    pub removed: usize,
    /// Timestamp of the oldest sample still resident.
    pub keep_from: Timestamp,
}

pub struct TailIndex {
    streams: DashMap<StreamKey, Arc<RwLock<StreamLog>>>,
    resident: AtomicUsize,
    read_timeout: Duration,
}

impl TailIndex {
    pub fn new(read_timeout: Duration) -> Self {
        Self {
            streams: DashMap::new(),
            resident: AtomicUsize::new(0),
            read_timeout,
        }
    }

    fn stream(&self, key: &StreamKey) -> Option<Arc<RwLock<StreamLog>>> {
        self.streams.get(key).map(|s| Arc::clone(s.value()))
    }

    /// Publish a committed batch. Each stream is updated under one write lock.
    pub fn publish(&self, entries: Vec<Arc<StoredSample>>) {
        let count = entries.len();
        let mut grouped: Vec<(StreamKey, Vec<Arc<StoredSample>>)> = Vec::new();
        for entry in entries {
            let key = entry.sample.stream_key();
            match grouped.iter_mut().find(|(k, _)| *k == key) {
                Some((_, group)) => group.push(entry),
                None => grouped.push((key, vec![entry])),
            }
        }

        for (key, group) in grouped {
            let log = Arc::clone(self.streams.entry(key).or_default().value());
            let mut log = log.write();
            for entry in group {
                log.insert(entry);
            }
        }
        self.resident.fetch_add(count, Ordering::Relaxed);
    }

    /// Newest committed timestamp of a stream.
    pub fn head(&self, key: &StreamKey) -> Option<Timestamp> {
        self.stream(key).and_then(|log| log.read().head())
    }

    /// Oldest and newest resident timestamps of a stream.
    pub fn bounds(&self, key: &StreamKey) -> Result<Option<(Timestamp, Timestamp)>, QueryError> {
        let Some(log) = self.stream(key) else {
            return Ok(None);
        };
        let log = self.read_lock(key, &log)?;
        Ok(log
            .entries
            .front()
            .zip(log.entries.back())
            .map(|(a, b)| (a.sample.timestamp, b.sample.timestamp)))
    }

    /// Samples selected by `cursor`, oldest first.
    pub fn recent(
        &self,
        key: &StreamKey,
        cursor: Cursor,
    ) -> Result<Vec<Arc<StoredSample>>, QueryError> {
        let Some(log) = self.stream(key) else {
            return Ok(Vec::new());
        };
        let log = self.read_lock(key, &log)?;
        let start = match cursor {
            Cursor::Last(n) => log.entries.len().saturating_sub(n),
            Cursor::Since(ts) => log.entries.partition_point(|e| e.sample.timestamp <= ts),
        };
        Ok(log.entries.range(start..).cloned().collect())
    }

    /// Samples with `from <= timestamp <= to`, oldest first.
    pub fn range(
        &self,
        key: &StreamKey,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Vec<Arc<StoredSample>>, QueryError> {
        let Some(log) = self.stream(key) else {
            return Ok(Vec::new());
        };
        let log = self.read_lock(key, &log)?;
        let start = log.entries.partition_point(|e| e.sample.timestamp < from);
        let end = log.entries.partition_point(|e| e.sample.timestamp <= to);
        if start >= end {
            return Ok(Vec::new());
        }
        Ok(log.entries.range(start..end).cloned().collect())
    }

    /// Drop the oldest samples of a stream that are older than `cutoff` or
    /// beyond `max_count`, but never at or after `protect_from`.
    pub fn evict(
        &self,
        key: &StreamKey,
        cutoff: Option<Timestamp>,
        max_count: Option<usize>,
        protect_from: Option<Timestamp>,
    ) -> Option<Eviction> {
        let log = self.stream(key)?;
        let mut log = log.write();

        let mut removed = 0;
        let mut last_removed = None;
        while let Some(front) = log.entries.front() {
            let ts = front.sample.timestamp;
            if protect_from.is_some_and(|p| ts >= p) {
                break;
            }
            let too_old = cutoff.is_some_and(|c| ts < c);
            let too_many = max_count.is_some_and(|max| log.entries.len() > max);
            if !too_old && !too_many {
                break;
            }
            last_removed = log.entries.pop_front().map(|e| e.sample.timestamp);
            removed += 1;
        }

        self.resident.fetch_sub(removed, Ordering::Relaxed);
        // An emptied stream keeps nothing at or before its last evicted sample.
        let keep_from = match (log.entries.front(), last_removed) {
            (Some(front), _) => front.sample.timestamp,
            (None, Some(last)) => Timestamp::from_nanos(last.as_nanos().saturating_add(1)),
            (None, None) => return None,
        };
        Some(Eviction {
            key: key.clone(),
            removed,
            keep_from,
        })
    }

    pub fn keys(&self) -> Vec<StreamKey> {
        let mut keys: Vec<StreamKey> = self.streams.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn resident(&self) -> usize {
        self.resident.load(Ordering::Relaxed)
    }

    fn read_lock<'a>(
        &self,
        key: &StreamKey,
        log: &'a RwLock<StreamLog>,
    ) -> Result<parking_lot::RwLockReadGuard<'a, StreamLog>, QueryError> {
        log.try_read_for(self.read_timeout)
            .ok_or_else(|| QueryError::Busy {
                stream: key.to_string(),
                waited: self.read_timeout,
            })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::codec::{Sample, SensorType};

    fn entry(seq: u64, ts: i64) -> Arc<StoredSample> {
        let mut fields = BTreeMap::new();
        fields.insert("x".to_string(), seq as f64);
        Arc::new(StoredSample {
            seq,
            out_of_order: false,
            sample: Sample {
                device_id: "d".to_string(),
                sensor: SensorType::Accelerometer,
                timestamp: Timestamp::from_nanos(ts),
                mono_ns: None,
                fields,
            },
        })
    }

    fn key() -> StreamKey {
        StreamKey::new("d", SensorType::Accelerometer)
    }

    fn timestamps(entries: &[Arc<StoredSample>]) -> Vec<i64> {
        entries.iter().map(|e| e.sample.timestamp.as_nanos()).collect()
    }

    #[test]
    fn test_publish_keeps_timestamp_then_seq_order() {
        let index = TailIndex::new(Duration::from_millis(10));
        index.publish(vec![entry(1, 10), entry(2, 30), entry(3, 20), entry(4, 20)]);

        let all = index.recent(&key(), Cursor::Last(usize::MAX)).expect("recent");
        assert_eq!(timestamps(&all), vec![10, 20, 20, 30]);
        let seqs: Vec<u64> = all.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 3, 4, 2]);
        assert_eq!(index.head(&key()), Some(Timestamp::from_nanos(30)));
        assert_eq!(index.resident(), 4);
    }

    #[test]
    fn test_recent_cursors() {
        let index = TailIndex::new(Duration::from_millis(10));
        index.publish((1..=5).map(|i| entry(i, i as i64 * 10)).collect());

        let last = index.recent(&key(), Cursor::Last(2)).expect("last");
        assert_eq!(timestamps(&last), vec![40, 50]);

        let since = index
            .recent(&key(), Cursor::Since(Timestamp::from_nanos(30)))
            .expect("since");
        assert_eq!(timestamps(&since), vec![40, 50]);

        let unknown = index
            .recent(&StreamKey::new("x", SensorType::Gyroscope), Cursor::Last(5))
            .expect("unknown stream");
        assert!(unknown.is_empty());
    }

    #[test]
    fn test_range_is_inclusive() {
        let index = TailIndex::new(Duration::from_millis(10));
        index.publish((1..=5).map(|i| entry(i, i as i64 * 10)).collect());
        let got = index
            .range(&key(), Timestamp::from_nanos(20), Timestamp::from_nanos(40))
            .expect("range");
        assert_eq!(timestamps(&got), vec![20, 30, 40]);
        let none = index
            .range(&key(), Timestamp::from_nanos(41), Timestamp::from_nanos(49))
            .expect("empty range");
        assert!(none.is_empty());
    }

    #[test]
    fn test_evict_respects_protection() {
        let index = TailIndex::new(Duration::from_millis(10));
        index.publish((1..=10).map(|i| entry(i, i as i64)).collect());

        // Age says drop everything below 8, but a reader holds from 5.
        let ev = index
            .evict(
                &key(),
                Some(Timestamp::from_nanos(8)),
                None,
                Some(Timestamp::from_nanos(5)),
            )
            .expect("stream exists");
        assert_eq!(ev.removed, 4);
        assert_eq!(ev.keep_from, Timestamp::from_nanos(5));

        let ev = index
            .evict(&key(), None, Some(3), None)
            .expect("stream exists");
        assert_eq!(ev.removed, 3);
        assert_eq!(ev.keep_from, Timestamp::from_nanos(8));
        assert_eq!(index.resident(), 3);
    }

    #[test]
    fn test_read_times_out_while_writer_holds_lock() {
        let index = TailIndex::new(Duration::from_millis(5));
        index.publish(vec![entry(1, 1)]);
        let log = index.stream(&key()).expect("stream");
        let _guard = log.write();

        let err = index.recent(&key(), Cursor::Last(1)).unwrap_err();
        assert!(matches!(err, QueryError::Busy { .. }));
    }

    #[test]
    fn test_concurrent_publish() {
        let index = Arc::new(TailIndex::new(Duration::from_millis(100)));
        let mut handles = Vec::new();
        for t in 0..4u64 {
            let index = Arc::clone(&index);
            handles.push(std::thread::spawn(move || {
                for i in 0..250u64 {
                    let seq = t * 1000 + i;
                    index.publish(vec![entry(seq, seq as i64)]);
                }
            }));
        }
        for h in handles {
            h.join().expect("thread should not panic");
        }
        let all = index.recent(&key(), Cursor::Last(usize::MAX)).expect("recent");
        assert_eq!(all.len(), 1000);
        assert!(all.windows(2).all(|w| w[0].order_key() <= w[1].order_key()));
    }
}
