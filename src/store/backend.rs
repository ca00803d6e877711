use std::collections::HashMap;

use anyhow::{Context, Result};

use super::memory::MemoryBackend;
use super::sqlite::SqliteBackend;
use super::{QueryError, RetentionPolicy, StoreSummary, StoredSample, WriteError};
use crate::codec::{StreamKey, Timestamp};
use crate::config::{BackendKind, StoreConfig};

/// Durable side of the store, selected by `store.backend`.
///
/// Uses enum dispatch rather than trait objects; every call is synchronous and
/// is run on the blocking pool by the store.
pub enum Backend {
    Sqlite(SqliteBackend),
    Memory(MemoryBackend),
}

impl Backend {
    pub fn open(cfg: &StoreConfig) -> Result<Self> {
        match cfg.backend {
            BackendKind::Sqlite => Ok(Self::Sqlite(
                SqliteBackend::open(cfg).context("opening sqlite backend")?,
            )),
            BackendKind::Memory => Ok(Self::Memory(MemoryBackend::new(cfg.memory_max_samples))),
        }
    }

    /// Returns the backend name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sqlite(_) => "sqlite",
            Self::Memory(_) => "memory",
        }
    }

    /// Persist a batch atomically. Per sample, `true` means newly stored.
    pub fn commit(&self, batch: &[StoredSample]) -> Result<Vec<bool>, WriteError> {
        match self {
            Self::Sqlite(b) => b.commit(batch),
            Self::Memory(b) => b.commit(batch),
        }
    }

    pub fn evict(&self, cutoffs: &[(StreamKey, Timestamp)]) -> Result<usize, WriteError> {
        match self {
            Self::Sqlite(b) => b.evict(cutoffs),
            Self::Memory(b) => Ok(b.evict(cutoffs)),
        }
    }

    pub fn set_tag(&self, device_id: &str, tag: &str) -> Result<(), WriteError> {
        match self {
            Self::Sqlite(b) => b.set_tag(device_id, tag),
            Self::Memory(b) => {
                b.set_tag(device_id, tag);
                Ok(())
            }
        }
    }

    pub fn tags(&self) -> Result<HashMap<String, String>, QueryError> {
        match self {
            Self::Sqlite(b) => b.reader().tags(),
            Self::Memory(b) => Ok(b.tags()),
        }
    }

    pub fn summary(&self) -> Result<StoreSummary, QueryError> {
        match self {
            Self::Sqlite(b) => b.reader().summary(),
            Self::Memory(b) => Ok(b.summary()),
        }
    }

    /// Samples to warm the read index with at startup, plus the next free sequence number.
    pub fn recover(&self, policy: &RetentionPolicy) -> Result<(Vec<StoredSample>, u64)> {
        match self {
            Self::Sqlite(b) => {
                let tail = b.reader().load_tail(policy).context("loading stored tail")?;
                let next_seq = b
                    .reader()
                    .max_seq()
                    .context("reading sequence high-water mark")?
                    .map_or(0, |m| m + 1);
                Ok((tail, next_seq))
            }
            Self::Memory(_) => Ok((Vec::new(), 0)),
        }
    }
}
