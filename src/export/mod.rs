//! Offline export of stored samples, one file per device.

pub mod health;

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::info;

use crate::codec;
use crate::config::{BackendKind, StoreConfig};
use crate::store::sqlite::{SqliteBackend, SqliteReader};
use crate::store::StoredSample;

const EXPORT_BATCH: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ExportFormat {
    /// One database per device, same layout as the live store.
    Sqlite,
    /// One JSON record per line.
    Ndjson,
}

impl ExportFormat {
    fn extension(self) -> &'static str {
        match self {
            Self::Sqlite => "db",
            Self::Ndjson => "ndjson",
        }
    }
}

#[derive(Debug, Default)]
pub struct ExportReport {
    pub files: Vec<PathBuf>,
    pub samples: u64,
}

/// Write every stored sample of `device` (or of every device) under `out`.
pub fn export(
    cfg: &StoreConfig,
    out: &Path,
    device: Option<&str>,
    format: ExportFormat,
) -> Result<ExportReport> {
    if cfg.backend != BackendKind::Sqlite {
        bail!("export reads the sqlite store; store.backend is {:?}", cfg.backend);
    }
    if !cfg.path.exists() {
        bail!("store database {} does not exist", cfg.path.display());
    }
    fs::create_dir_all(out).with_context(|| format!("creating {}", out.display()))?;

    let reader = SqliteReader::open(&cfg.path, cfg.busy_timeout)?;
    let devices = match device {
        Some(d) => vec![d.to_string()],
        None => reader.devices().context("listing devices")?,
    };

    let mut report = ExportReport::default();
    for device_id in devices {
        let path = out.join(format!("{}.{}", file_stem(&device_id), format.extension()));
        let written = match format {
            ExportFormat::Ndjson => export_ndjson(&reader, &device_id, &path)?,
            ExportFormat::Sqlite => export_sqlite(cfg, &reader, &device_id, &path)?,
        };
        info!(device = %device_id, samples = written, path = %path.display(), "device exported");
        report.samples += written;
        report.files.push(path);
    }
    Ok(report)
}

fn export_ndjson(reader: &SqliteReader, device_id: &str, path: &Path) -> Result<u64> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut w = BufWriter::new(file);
    let count = reader.for_each_sample(device_id, |stored| {
        w.write_all(&codec::encode(&stored.sample))?;
        w.write_all(b"\n")?;
        Ok(())
    })?;
    w.flush().with_context(|| format!("flushing {}", path.display()))?;
    Ok(count)
}

fn export_sqlite(
    cfg: &StoreConfig,
    reader: &SqliteReader,
    device_id: &str,
    path: &Path,
) -> Result<u64> {
    if path.exists() {
        fs::remove_file(path).with_context(|| format!("replacing {}", path.display()))?;
    }
    let target = SqliteBackend::open(&StoreConfig {
        path: path.to_path_buf(),
        ..cfg.clone()
    })?;

    let mut batch: Vec<StoredSample> = Vec::with_capacity(EXPORT_BATCH);
    let flush = |batch: &mut Vec<StoredSample>| -> Result<()> {
        target.commit(batch)?;
        batch.clear();
        Ok(())
    };

    let count = reader.for_each_sample(device_id, |stored| {
        batch.push(stored);
        if batch.len() >= EXPORT_BATCH {
            flush(&mut batch)?;
        }
        Ok(())
    })?;
    flush(&mut batch)?;
    Ok(count)
}

/// File-system safe name for a device id (peer addresses contain ':' and '.').
fn file_stem(device_id: &str) -> String {
    device_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::codec::{Sample, SensorType, Timestamp};

    fn stored(seq: u64, device: &str, ts: i64) -> StoredSample {
        let mut fields = BTreeMap::new();
        fields.insert("x".to_string(), 0.1 * ts as f64);
        fields.insert("y".to_string(), -1.5);
        StoredSample {
            seq,
            out_of_order: seq == 1,
            sample: Sample {
                device_id: device.to_string(),
                sensor: SensorType::Accelerometer,
                timestamp: Timestamp::from_nanos(ts),
                mono_ns: Some(ts as u64),
                fields,
            },
        }
    }

    fn seeded(dir: &Path) -> StoreConfig {
        let cfg = StoreConfig {
            path: dir.join("live.db"),
            ..Default::default()
        };
        let backend = SqliteBackend::open(&cfg).expect("open");
        backend
            .commit(&[
                stored(0, "phone-a", 1),
                stored(1, "phone-a", 2),
                stored(2, "10.0.0.9", 1),
            ])
            .expect("commit");
        cfg
    }

    #[test]
    fn test_export_ndjson_per_device() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = seeded(dir.path());
        let out = dir.path().join("out");

        let report = export(&cfg, &out, None, ExportFormat::Ndjson).expect("export");
        assert_eq!(report.samples, 3);
        assert_eq!(report.files.len(), 2);

        let text = fs::read_to_string(out.join("phone-a.ndjson")).expect("read");
        let samples: Vec<Sample> = text
            .lines()
            .map(|l| codec::decode(l.as_bytes()).expect("decode"))
            .collect();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[1], stored(1, "phone-a", 2).sample);
        assert!(out.join("10_0_0_9.ndjson").exists());
    }

    #[test]
    fn test_export_sqlite_single_device() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = seeded(dir.path());
        let out = dir.path().join("out");

        let report =
            export(&cfg, &out, Some("phone-a"), ExportFormat::Sqlite).expect("export");
        assert_eq!(report.samples, 2);

        let copy = SqliteReader::open(&out.join("phone-a.db"), cfg.busy_timeout).expect("open");
        assert_eq!(copy.summary().expect("summary").total_records, 2);
        assert_eq!(copy.devices().expect("devices"), vec!["phone-a".to_string()]);

        let mut exported = Vec::new();
        copy.for_each_sample("phone-a", |s| {
            exported.push((s.seq, s.out_of_order));
            Ok(())
        })
        .expect("iterate copy");
        assert_eq!(exported, vec![(0, false), (1, true)]);
    }

    #[test]
    fn test_export_requires_sqlite_backend() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = StoreConfig {
            backend: BackendKind::Memory,
            ..Default::default()
        };
        assert!(export(&cfg, dir.path(), None, ExportFormat::Ndjson).is_err());
    }
}
