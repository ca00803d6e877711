//! Window assembly: merges one device's sensor streams into a single
//! time-aligned table for display.

pub mod decimate;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Serialize, Serializer};

use crate::codec::{SensorType, StreamKey, Timestamp};
use crate::config::AggregateConfig;
use crate::store::{QueryError, Store, StoredSample};

/// One table cell. Missing cells are never interpolated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Cell {
    Present(f64),
    Missing,
}

impl Cell {
    pub fn value(self) -> Option<f64> {
        match self {
            Self::Present(v) => Some(v),
            Self::Missing => None,
        }
    }

    pub fn is_present(self) -> bool {
        matches!(self, Self::Present(_))
    }
}

impl Serialize for Cell {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Present(v) => serializer.serialize_f64(*v),
            Self::Missing => serializer.serialize_none(),
        }
    }
}

/// A table column: one field of one sensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Column {
    pub sensor: SensorType,
    pub field: String,
}

impl Column {
    /// Display name, e.g. `accelerometer.x`.
    pub fn name(&self) -> String {
        format!("{}.{}", self.sensor, self.field)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Row {
    pub timestamp: Timestamp,
    pub cells: Vec<Cell>,
}

/// A stretch where a sensor went quiet for longer than its nominal rate allows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Gap {
    pub sensor: SensorType,
    /// Last sample before the gap.
    pub after: Timestamp,
    /// First sample after the gap.
    pub before: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeriesSummary {
    pub sensor: SensorType,
    pub raw_samples: usize,
    pub shown_samples: usize,
    pub out_of_order: usize,
}

impl SeriesSummary {
    pub fn decimated(&self) -> bool {
        self.shown_samples < self.raw_samples
    }
}

/// A time-aligned multi-sensor table. Rows are the union of every shown
/// sample timestamp, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MultiSeriesTable {
    pub device_id: String,
    /// Effective window, after clipping to retained data. `None` when empty.
    pub from: Option<Timestamp>,
    pub to: Option<Timestamp>,
    pub columns: Vec<Column>,
    pub rows: Vec<Row>,
    pub gaps: Vec<Gap>,
    pub series: Vec<SeriesSummary>,
}

impl MultiSeriesTable {
    fn empty(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            from: None,
            to: None,
            columns: Vec::new(),
            rows: Vec::new(),
            gaps: Vec::new(),
            series: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, sensor: &SensorType, field: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| &c.sensor == sensor && c.field == field)
    }

    /// Number of rows in which `sensor` has at least one present cell.
    pub fn present_rows(&self, sensor: &SensorType) -> usize {
        let cols: Vec<usize> = self
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| &c.sensor == sensor)
            .map(|(i, _)| i)
            .collect();
        self.rows
            .iter()
            .filter(|r| cols.iter().any(|i| r.cells[*i].is_present()))
            .count()
    }
}

pub struct Aggregator {
    store: Arc<Store>,
    cfg: AggregateConfig,
}

impl Aggregator {
    pub fn new(store: Arc<Store>, cfg: AggregateConfig) -> Self {
        Self { store, cfg }
    }

    /// Assemble the window ending at the newest sample among `sensors` and
    /// reaching back `span`, clipped to the earliest retained sample.
    ///
    /// Reads are pinned for the duration of the call so retention cannot evict
    /// underneath it. With an unchanged store the result is identical call to call.
    pub fn window(
        &self,
        device_id: &str,
        sensors: &BTreeSet<SensorType>,
        span: Duration,
    ) -> Result<MultiSeriesTable, QueryError> {
        let keys: Vec<StreamKey> = sensors
            .iter()
            .map(|s| StreamKey::new(device_id, s.clone()))
            .collect();

        let mut earliest: Option<Timestamp> = None;
        let mut newest: Option<Timestamp> = None;
        for key in &keys {
            if let Some((first, last)) = self.store.bounds(key)? {
                earliest = Some(earliest.map_or(first, |e| e.min(first)));
                newest = Some(newest.map_or(last, |n| n.max(last)));
            }
        }
        let (Some(earliest), Some(to)) = (earliest, newest) else {
            return Ok(MultiSeriesTable::empty(device_id));
        };
        let from = to.saturating_sub(span).max(earliest);

        let _pins: Vec<_> = keys
            .iter()
            .map(|key| self.store.pin(key.clone(), from))
            .collect();

        let mut series = Vec::with_capacity(keys.len());
        for key in &keys {
            let samples = self.store.range(key, from, to)?;
            series.push((key.sensor.clone(), samples));
        }

        Ok(self.assemble(device_id, from, to, series))
    }

    fn assemble(
        &self,
        device_id: &str,
        from: Timestamp,
        to: Timestamp,
        series: Vec<(SensorType, Vec<Arc<StoredSample>>)>,
    ) -> MultiSeriesTable {
        let mut table = MultiSeriesTable::empty(device_id);
        table.from = Some(from);
        table.to = Some(to);

        let mut shown = Vec::with_capacity(series.len());
        for (sensor, samples) in series {
            table
                .gaps
                .extend(self.find_gaps(&sensor, &samples));
            let raw = samples.len();
            let out_of_order = samples.iter().filter(|s| s.out_of_order).count();
            let kept = decimate::decimate(samples, self.cfg.display_budget, self.cfg.decimation);
            table.series.push(SeriesSummary {
                sensor: sensor.clone(),
                raw_samples: raw,
                shown_samples: kept.len(),
                out_of_order,
            });

            let fields: BTreeSet<&str> = kept
                .iter()
                .flat_map(|s| s.sample.fields.keys().map(String::as_str))
                .collect();
            let base = table.columns.len();
            table.columns.extend(fields.iter().map(|f| Column {
                sensor: sensor.clone(),
                field: (*f).to_string(),
            }));
            let fields: Vec<String> = fields.into_iter().map(str::to_string).collect();
            shown.push((base, fields, kept));
        }

        let width = table.columns.len();
        let mut rows: BTreeMap<Timestamp, Vec<Cell>> = BTreeMap::new();
        for (base, fields, kept) in &shown {
            for stored in kept {
                let cells = rows
                    .entry(stored.sample.timestamp)
                    .or_insert_with(|| vec![Cell::Missing; width]);
                for (offset, field) in fields.iter().enumerate() {
                    if let Some(v) = stored.sample.field(field) {
                        cells[base + offset] = Cell::Present(v);
                    }
                }
            }
        }

        table.rows = rows
            .into_iter()
            .map(|(timestamp, cells)| Row { timestamp, cells })
            .collect();
        table
    }

    fn find_gaps(&self, sensor: &SensorType, samples: &[Arc<StoredSample>]) -> Vec<Gap> {
        let limit = self.cfg.gap_limit(sensor);
        samples
            .windows(2)
            .filter(|w| w[1].sample.timestamp.abs_diff(w[0].sample.timestamp) > limit)
            .map(|w| Gap {
                sensor: sensor.clone(),
                after: w[0].sample.timestamp,
                before: w[1].sample.timestamp,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::codec::Sample;
    use crate::config::{BackendKind, Decimation, StoreConfig};
    use crate::export::health::HealthMetrics;

    const MS: i64 = 1_000_000;
    const BASE: i64 = 1_700_000_000_000_000_000;

    fn sample(sensor: SensorType, ts: i64, fields: &[(&str, f64)]) -> Sample {
        Sample {
            device_id: "phone".to_string(),
            sensor,
            timestamp: Timestamp::from_nanos(ts),
            mono_ns: None,
            fields: fields.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        }
    }

    async fn store() -> (Arc<Store>, CancellationToken) {
        let cfg = StoreConfig {
            backend: BackendKind::Memory,
            ..Default::default()
        };
        let health = Arc::new(HealthMetrics::detached().expect("metrics"));
        let store = Store::open(&cfg, Duration::from_millis(5), health).expect("open");
        let cancel = CancellationToken::new();
        store.start(cancel.child_token()).await.expect("start");
        (Arc::new(store), cancel)
    }

    fn sensors(list: &[SensorType]) -> BTreeSet<SensorType> {
        list.iter().cloned().collect()
    }

    #[tokio::test]
    async fn test_accel_and_gps_align_by_timestamp() {
        let (store, _cancel) = store().await;
        let accel: Vec<Sample> = (0..100)
            .map(|i| {
                sample(
                    SensorType::Accelerometer,
                    BASE + i * 20 * MS,
                    &[("x", i as f64), ("y", 0.0), ("z", 9.8)],
                )
            })
            .collect();
        let gps: Vec<Sample> = (0..10)
            .map(|i| {
                sample(
                    SensorType::Location,
                    BASE + i * 200 * MS,
                    &[("lat", 52.0), ("lon", 13.0 + i as f64)],
                )
            })
            .collect();
        store.append_batch(accel).await.expect("accel");
        store.append_batch(gps).await.expect("gps");

        let agg = Aggregator::new(Arc::clone(&store), AggregateConfig::default());
        let table = agg
            .window(
                "phone",
                &sensors(&[SensorType::Accelerometer, SensorType::Location]),
                Duration::from_secs(2),
            )
            .expect("window");

        assert_eq!(table.rows.len(), 100);
        assert_eq!(table.present_rows(&SensorType::Accelerometer), 100);
        assert_eq!(table.present_rows(&SensorType::Location), 10);

        let lat = table
            .column_index(&SensorType::Location, "lat")
            .expect("lat column");
        for row in &table.rows {
            let on_fix = (row.timestamp.as_nanos() - BASE) % (200 * MS) == 0;
            assert_eq!(row.cells[lat].is_present(), on_fix, "at {}", row.timestamp);
        }
        assert!(table
            .rows
            .windows(2)
            .all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[tokio::test]
    async fn test_gap_marks_missing_cells() {
        let (store, _cancel) = store().await;
        let mut batch = Vec::new();
        for i in 0..20 {
            batch.push(sample(SensorType::Accelerometer, BASE + i * 20 * MS, &[("x", 1.0)]));
            // Gyro drops out between 100ms and 300ms.
            if !(6..15).contains(&i) {
                batch.push(sample(SensorType::Gyroscope, BASE + i * 20 * MS, &[("x", 2.0)]));
            }
        }
        store.append_batch(batch).await.expect("append");

        let agg = Aggregator::new(Arc::clone(&store), AggregateConfig::default());
        let table = agg
            .window(
                "phone",
                &sensors(&[SensorType::Accelerometer, SensorType::Gyroscope]),
                Duration::from_secs(1),
            )
            .expect("window");

        assert_eq!(table.rows.len(), 20);
        assert_eq!(
            table.gaps,
            vec![Gap {
                sensor: SensorType::Gyroscope,
                after: Timestamp::from_nanos(BASE + 5 * 20 * MS),
                before: Timestamp::from_nanos(BASE + 15 * 20 * MS),
            }]
        );
        let gyro = table
            .column_index(&SensorType::Gyroscope, "x")
            .expect("gyro column");
        let missing = table
            .rows
            .iter()
            .filter(|r| r.cells[gyro] == Cell::Missing)
            .count();
        assert_eq!(missing, 9);
    }

    #[tokio::test]
    async fn test_extreme_gap_factor_reports_no_gaps() {
        let (store, _cancel) = store().await;
        let batch: Vec<Sample> = [0i64, 1, 500]
            .into_iter()
            .map(|i| sample(SensorType::Location, BASE + i * 1_000 * MS, &[("lat", 1.0)]))
            .collect();
        store.append_batch(batch).await.expect("append");

        let cfg = AggregateConfig {
            gap_factor: 1e20,
            ..Default::default()
        };
        let agg = Aggregator::new(Arc::clone(&store), cfg);
        let table = agg
            .window("phone", &sensors(&[SensorType::Location]), Duration::from_secs(600))
            .expect("window");
        assert_eq!(table.rows.len(), 3);
        assert!(table.gaps.is_empty());
    }

    #[tokio::test]
    async fn test_empty_stream_yields_empty_table() {
        let (store, _cancel) = store().await;
        let agg = Aggregator::new(store, AggregateConfig::default());
        let table = agg
            .window(
                "nobody",
                &sensors(&[SensorType::Barometer]),
                Duration::from_secs(10),
            )
            .expect("window");
        assert!(table.is_empty());
        assert!(table.columns.is_empty());
        assert_eq!(table.from, None);
    }

    #[tokio::test]
    async fn test_span_clips_to_earliest_sample() {
        let (store, _cancel) = store().await;
        let batch = (0..5)
            .map(|i| sample(SensorType::Barometer, BASE + i * 1000 * MS, &[("p", 1013.0)]))
            .collect();
        store.append_batch(batch).await.expect("append");

        let agg = Aggregator::new(Arc::clone(&store), AggregateConfig::default());
        let table = agg
            .window(
                "phone",
                &sensors(&[SensorType::Barometer]),
                Duration::from_secs(3600),
            )
            .expect("window");
        assert_eq!(table.from, Some(Timestamp::from_nanos(BASE)));
        assert_eq!(table.to, Some(Timestamp::from_nanos(BASE + 4000 * MS)));
        assert_eq!(table.rows.len(), 5);
    }

    #[tokio::test]
    async fn test_window_is_idempotent_and_decimated() {
        let (store, _cancel) = store().await;
        let batch = (0..500)
            .map(|i| {
                sample(
                    SensorType::Accelerometer,
                    BASE + i * 20 * MS,
                    &[("x", ((i * 7) % 13) as f64)],
                )
            })
            .collect();
        store.append_batch(batch).await.expect("append");

        let cfg = AggregateConfig {
            display_budget: 50,
            decimation: Decimation::MinMax,
            ..Default::default()
        };
        let agg = Aggregator::new(Arc::clone(&store), cfg);
        let set = sensors(&[SensorType::Accelerometer]);

        let a = agg.window("phone", &set, Duration::from_secs(60)).expect("a");
        let b = agg.window("phone", &set, Duration::from_secs(60)).expect("b");
        assert_eq!(a, b);
        assert!(a.rows.len() <= 50);
        assert_eq!(a.series[0].raw_samples, 500);
        assert!(a.series[0].decimated());
    }
}
