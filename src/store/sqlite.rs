//! SQLite backend.
//!
//! Samples use a long layout: one `samples` row per reading plus one
//! `sample_fields` row per numeric field. `REAL` columns hold IEEE doubles, so
//! values round-trip bit for bit. All writes go through a single connection
//! owned by the store writer; reads use a second connection so a long read
//! never holds the write lock.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension};

use super::{QueryError, RetentionPolicy, StoreSummary, StoredSample, WriteError};
use crate::codec::{Sample, SensorType, StreamKey, Timestamp};
use crate::config::StoreConfig;

const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS samples (
    device_id TEXT NOT NULL,
    sensor TEXT NOT NULL,
    ts_ns INTEGER NOT NULL,
    mono_ns INTEGER,
    seq INTEGER NOT NULL,
    out_of_order INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (device_id, sensor, ts_ns)
) WITHOUT ROWID;
CREATE TABLE IF NOT EXISTS sample_fields (
    device_id TEXT NOT NULL,
    sensor TEXT NOT NULL,
    ts_ns INTEGER NOT NULL,
    field TEXT NOT NULL,
    value REAL NOT NULL,
    PRIMARY KEY (device_id, sensor, ts_ns, field)
) WITHOUT ROWID;
CREATE TABLE IF NOT EXISTS device_tags (
    device_id TEXT PRIMARY KEY,
    tag TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_samples_ts ON samples (ts_ns);
";

/// Write side of the SQLite backend plus its reader.
pub struct SqliteBackend {
    writer: Mutex<Connection>,
    reader: SqliteReader,
}

impl SqliteBackend {
    pub fn open(cfg: &StoreConfig) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let mut conn = Connection::open_with_flags(&cfg.path, flags)
            .with_context(|| format!("opening {}", cfg.path.display()))?;
        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", cfg.journal_mode.pragma_value(), |row| {
                row.get(0)
            })
            .context("setting journal mode")?;
        tracing::debug!(journal_mode = %mode, path = %cfg.path.display(), "sqlite store opened");
        conn.pragma_update(None, "synchronous", cfg.sync_mode.pragma_value())
            .context("setting synchronous mode")?;
        conn.busy_timeout(cfg.busy_timeout)
            .context("setting busy timeout")?;
        initialize_schema(&mut conn)?;

        let reader = SqliteReader::open(&cfg.path, cfg.busy_timeout)?;

        Ok(Self {
            writer: Mutex::new(conn),
            reader,
        })
    }

    pub fn reader(&self) -> &SqliteReader {
        &self.reader
    }

    /// Insert a batch in one transaction. Returns, per sample, whether it was
    /// new (`false` means an identical key was already stored).
    pub fn commit(&self, batch: &[StoredSample]) -> Result<Vec<bool>, WriteError> {
        let mut conn = self.writer.lock();
        let tx = conn.transaction().map_err(write_error)?;
        let mut inserted = Vec::with_capacity(batch.len());
        {
            let mut insert_sample = tx
                .prepare_cached(
                    "INSERT OR IGNORE INTO samples
                        (device_id, sensor, ts_ns, mono_ns, seq, out_of_order)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )
                .map_err(write_error)?;
            let mut insert_field = tx
                .prepare_cached(
                    "INSERT INTO sample_fields (device_id, sensor, ts_ns, field, value)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )
                .map_err(write_error)?;

            for stored in batch {
                let s = &stored.sample;
                let changed = insert_sample
                    .execute(params![
                        s.device_id,
                        s.sensor.as_str(),
                        s.timestamp.as_nanos(),
                        s.mono_ns.map(to_i64),
                        to_i64(stored.seq),
                        stored.out_of_order,
                    ])
                    .map_err(write_error)?;
                if changed == 0 {
                    inserted.push(false);
                    continue;
                }
                for (name, value) in &s.fields {
                    insert_field
                        .execute(params![
                            s.device_id,
                            s.sensor.as_str(),
                            s.timestamp.as_nanos(),
                            name,
                            value,
                        ])
                        .map_err(write_error)?;
                }
                inserted.push(true);
            }
        }
        tx.commit().map_err(write_error)?;
        Ok(inserted)
    }

    /// Delete samples older than each stream's `keep_from`.
    pub fn evict(&self, cutoffs: &[(StreamKey, Timestamp)]) -> Result<usize, WriteError> {
        let mut conn = self.writer.lock();
        let tx = conn.transaction().map_err(write_error)?;
        let mut removed = 0;
        for (key, keep_from) in cutoffs {
            tx.execute(
                "DELETE FROM sample_fields WHERE device_id = ?1 AND sensor = ?2 AND ts_ns < ?3",
                params![key.device_id, key.sensor.as_str(), keep_from.as_nanos()],
            )
            .map_err(write_error)?;
            removed += tx
                .execute(
                    "DELETE FROM samples WHERE device_id = ?1 AND sensor = ?2 AND ts_ns < ?3",
                    params![key.device_id, key.sensor.as_str(), keep_from.as_nanos()],
                )
                .map_err(write_error)?;
        }
        tx.commit().map_err(write_error)?;
        Ok(removed)
    }

    pub fn set_tag(&self, device_id: &str, tag: &str) -> Result<(), WriteError> {
        let conn = self.writer.lock();
        conn.execute(
            "INSERT INTO device_tags (device_id, tag, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(device_id) DO UPDATE SET tag = excluded.tag, updated_at = excluded.updated_at",
            params![device_id, tag, Timestamp::now().as_nanos()],
        )
        .map_err(write_error)?;
        Ok(())
    }
}

/// Read path of a sensorhub database. The connection is opened read-write so
/// it can attach to the WAL index, but nothing is ever written through it.
pub struct SqliteReader {
    conn: Mutex<Connection>,
}

impl SqliteReader {
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags)
            .with_context(|| format!("opening {} for reading", path.display()))?;
        conn.busy_timeout(busy_timeout)
            .context("setting busy timeout")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn summary(&self) -> Result<StoreSummary, QueryError> {
        let conn = self.conn.lock();
        let (total, oldest, newest, devices): (i64, Option<i64>, Option<i64>, i64) = conn
            .query_row(
                "SELECT COUNT(*), MIN(ts_ns), MAX(ts_ns), COUNT(DISTINCT device_id) FROM samples",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .map_err(query_error)?;
        let streams: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM (SELECT DISTINCT device_id, sensor FROM samples)",
                [],
                |row| row.get(0),
            )
            .map_err(query_error)?;
        Ok(StoreSummary {
            total_records: u64::try_from(total).unwrap_or(0),
            oldest_record: oldest.map(Timestamp::from_nanos),
            newest_record: newest.map(Timestamp::from_nanos),
            streams: usize::try_from(streams).unwrap_or(0),
            devices: usize::try_from(devices).unwrap_or(0),
        })
    }

    pub fn devices(&self) -> Result<Vec<String>, QueryError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT DISTINCT device_id FROM samples ORDER BY device_id")
            .map_err(query_error)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(query_error)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(query_error)
    }

    pub fn tags(&self) -> Result<HashMap<String, String>, QueryError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT device_id, tag FROM device_tags")
            .map_err(query_error)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(query_error)?;
        rows.collect::<Result<HashMap<_, _>, _>>()
            .map_err(query_error)
    }

    /// Newest samples of every stream within `policy`, for warming the read index.
    pub fn load_tail(&self, policy: &RetentionPolicy) -> Result<Vec<StoredSample>, QueryError> {
        let conn = self.conn.lock();
        let heads: Vec<(String, String, i64)> = {
            let mut stmt = conn
                .prepare(
                    "SELECT device_id, sensor, MAX(ts_ns) FROM samples GROUP BY device_id, sensor",
                )
                .map_err(query_error)?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
                .map_err(query_error)?;
            rows.collect::<Result<_, _>>().map_err(query_error)?
        };

        let limit = policy
            .max_samples_per_stream
            .map_or(-1, |n| i64::try_from(n).unwrap_or(i64::MAX));

        let mut out = Vec::new();
        for (device_id, sensor_name, head) in heads {
            let Ok(sensor) = sensor_name.parse::<SensorType>() else {
                continue;
            };
            let from = policy
                .max_age
                .map_or(i64::MIN, |age| {
                    Timestamp::from_nanos(head).saturating_sub(age).as_nanos()
                });

            let mut rows: Vec<(i64, Option<i64>, i64, bool)> = {
                let mut stmt = conn
                    .prepare_cached(
                        "SELECT ts_ns, mono_ns, seq, out_of_order FROM samples
                         WHERE device_id = ?1 AND sensor = ?2 AND ts_ns >= ?3
                         ORDER BY ts_ns DESC LIMIT ?4",
                    )
                    .map_err(query_error)?;
                let mapped = stmt
                    .query_map(params![device_id, sensor_name, from, limit], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                    })
                    .map_err(query_error)?;
                mapped.collect::<Result<_, _>>().map_err(query_error)?
            };
            rows.reverse();
            let Some(oldest) = rows.first().map(|r| r.0) else {
                continue;
            };

            let mut fields: HashMap<i64, BTreeMap<String, f64>> = HashMap::new();
            {
                let mut stmt = conn
                    .prepare_cached(
                        "SELECT ts_ns, field, value FROM sample_fields
                         WHERE device_id = ?1 AND sensor = ?2 AND ts_ns >= ?3",
                    )
                    .map_err(query_error)?;
                let mapped = stmt
                    .query_map(params![device_id, sensor_name, oldest], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, f64>(2)?,
                        ))
                    })
                    .map_err(query_error)?;
                for row in mapped {
                    let (ts, name, value) = row.map_err(query_error)?;
                    fields.entry(ts).or_default().insert(name, value);
                }
            }

            for (ts, mono, seq, out_of_order) in rows {
                out.push(StoredSample {
                    seq: u64::try_from(seq).unwrap_or(0),
                    out_of_order,
                    sample: Sample {
                        device_id: device_id.clone(),
                        sensor: sensor.clone(),
                        timestamp: Timestamp::from_nanos(ts),
                        mono_ns: mono.and_then(|m| u64::try_from(m).ok()),
                        fields: fields.remove(&ts).unwrap_or_default(),
                    },
                });
            }
        }
        Ok(out)
    }

    /// Highest sequence number ever assigned.
    pub fn max_seq(&self) -> Result<Option<u64>, QueryError> {
        let conn = self.conn.lock();
        let max: Option<i64> = conn
            .query_row("SELECT MAX(seq) FROM samples", [], |row| row.get(0))
            .map_err(query_error)?;
        Ok(max.and_then(|m| u64::try_from(m).ok()))
    }

    /// Visit every sample of `device_id` ordered by sensor, then timestamp,
    /// with the sequence number and order flag it was committed with.
    pub fn for_each_sample<F>(&self, device_id: &str, mut f: F) -> Result<u64>
    where
        F: FnMut(StoredSample) -> Result<()>,
    {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT s.sensor, s.ts_ns, s.mono_ns, s.seq, s.out_of_order, f.field, f.value
             FROM samples s
             JOIN sample_fields f
               ON f.device_id = s.device_id AND f.sensor = s.sensor AND f.ts_ns = s.ts_ns
             WHERE s.device_id = ?1
             ORDER BY s.sensor, s.ts_ns, f.field",
        )?;
        let mut rows = stmt.query(params![device_id])?;

        let mut current: Option<StoredSample> = None;
        let mut count = 0u64;
        while let Some(row) = rows.next()? {
            let sensor_name: String = row.get(0)?;
            let ts = Timestamp::from_nanos(row.get(1)?);
            let mono: Option<i64> = row.get(2)?;
            let seq: i64 = row.get(3)?;
            let out_of_order: bool = row.get(4)?;
            let field: String = row.get(5)?;
            let value: f64 = row.get(6)?;

            let same = current.as_ref().is_some_and(|s| {
                s.sample.timestamp == ts && s.sample.sensor.as_str() == sensor_name
            });
            if !same {
                if let Some(done) = current.take() {
                    f(done)?;
                    count += 1;
                }
                current = Some(StoredSample {
                    seq: u64::try_from(seq).unwrap_or(0),
                    out_of_order,
                    sample: Sample {
                        device_id: device_id.to_string(),
                        sensor: sensor_name.parse()?,
                        timestamp: ts,
                        mono_ns: mono.and_then(|m| u64::try_from(m).ok()),
                        fields: BTreeMap::new(),
                    },
                });
            }
            if let Some(s) = current.as_mut() {
                s.sample.fields.insert(field, value);
            }
        }
        if let Some(done) = current.take() {
            f(done)?;
            count += 1;
        }
        Ok(count)
    }
}

fn initialize_schema(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction().context("starting schema transaction")?;
    tx.execute_batch("CREATE TABLE IF NOT EXISTS store_meta (version INTEGER NOT NULL);")
        .context("creating store_meta")?;
    let version: Option<i64> = tx
        .query_row("SELECT version FROM store_meta LIMIT 1", [], |row| row.get(0))
        .optional()
        .context("reading schema version")?;
    match version {
        None => {
            tx.execute(
                "INSERT INTO store_meta (version) VALUES (?1)",
                params![SCHEMA_VERSION],
            )
            .context("writing schema version")?;
            tx.execute_batch(SCHEMA).context("creating schema")?;
        }
        Some(SCHEMA_VERSION) => {}
        Some(other) => bail!("unsupported store schema version {other}, expected {SCHEMA_VERSION}"),
    }
    tx.commit().context("committing schema")?;
    Ok(())
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn write_error(err: rusqlite::Error) -> WriteError {
    match err.sqlite_error_code() {
        Some(ErrorCode::DiskFull) => WriteError::Full(err.to_string()),
        _ => WriteError::Commit(err.to_string()),
    }
}

fn query_error(err: rusqlite::Error) -> QueryError {
    QueryError::Backend(err.to_string())
}
