use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::codec::SensorType;

/// Top-level configuration for the sensorhub agent.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Producer-facing listeners.
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Sample store configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Window assembly configuration.
    #[serde(default)]
    pub aggregate: AggregateConfig,

    /// Dashboard API and live refresh configuration.
    #[serde(default)]
    pub dashboard: DashboardConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Producer-facing listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Raw socket listen address. Empty disables the socket listener. Default: ":7070".
    #[serde(default = "default_tcp_addr")]
    pub tcp_addr: String,

    /// HTTP listen address for `POST /data`. Empty disables it. Default: ":8000".
    #[serde(default = "default_http_addr")]
    pub http_addr: String,

    /// Frame delimiting on the raw socket. Default: newline.
    #[serde(default)]
    pub framing: Framing,

    /// Largest accepted frame. Default: 1MiB.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// A session with no bytes for this long is closed. Default: 60s.
    #[serde(default = "default_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,

    /// Concurrent socket sessions. Default: 256.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Unacknowledged store writes a session may have outstanding. Default: 256.
    #[serde(default = "default_max_inflight_per_session")]
    pub max_inflight_per_session: usize,

    /// Use the peer IP as device id when a record names none. Default: true.
    #[serde(default = "default_true")]
    pub device_id_from_peer: bool,

    /// Sensors to keep. Empty keeps everything.
    #[serde(default)]
    pub sensors: Vec<String>,

    /// How far behind its stream head a sample may be before it is flagged. Default: 5ms.
    #[serde(default = "default_order_tolerance", with = "humantime_serde")]
    pub order_tolerance: Duration,
}

/// Frame delimiting for the raw socket listener.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// One JSON document per line.
    #[default]
    Newline,
    /// 4-byte big-endian length followed by a JSON document.
    LengthPrefixed,
}

/// Sample store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Durable backend. Default: sqlite.
    #[serde(default)]
    pub backend: BackendKind,

    /// Database file for the sqlite backend. Default: "sensorhub.db".
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// SQLite journal mode. Default: wal.
    #[serde(default)]
    pub journal_mode: JournalMode,

    /// SQLite synchronous mode. Default: normal.
    #[serde(default)]
    pub sync_mode: SyncMode,

    /// SQLite busy timeout. Default: 5s.
    #[serde(default = "default_busy_timeout", with = "humantime_serde")]
    pub busy_timeout: Duration,

    /// Write queue capacity; a full queue blocks producers. Default: 4096.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Maximum samples committed in one transaction. Default: 1024.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// How long the writer waits for a batch to fill before committing. Default: 2ms.
    #[serde(default = "default_max_linger", with = "humantime_serde")]
    pub max_linger: Duration,

    /// Upper bound on waiting for a stream's read lock. Default: 50ms.
    #[serde(default = "default_read_timeout", with = "humantime_serde")]
    pub read_timeout: Duration,

    /// Row cap for the memory backend; writes beyond it fail. Default: unlimited.
    #[serde(default)]
    pub memory_max_samples: Option<usize>,

    /// Background eviction policy.
    #[serde(default)]
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Sqlite,
    Memory,
}

/// SQLite journal mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalMode {
    #[default]
    Wal,
    Delete,
}

impl JournalMode {
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Wal => "wal",
            Self::Delete => "delete",
        }
    }
}

/// SQLite synchronous mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Full,
    #[default]
    Normal,
}

impl SyncMode {
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Normal => "normal",
        }
    }
}

/// Retention policy. Either bound may be disabled by setting it to null.
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// Evict samples older than this, measured from each stream's newest sample.
    /// Default: 10m.
    #[serde(default = "default_retention_max_age", with = "humantime_serde")]
    pub max_age: Option<Duration>,

    /// Keep at most this many samples per stream. Default: 100000.
    #[serde(default = "default_retention_max_samples")]
    pub max_samples_per_stream: Option<usize>,

    /// How often the eviction pass runs. Default: 5s.
    #[serde(default = "default_retention_interval", with = "humantime_serde")]
    pub interval: Duration,
}

/// Window assembly configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AggregateConfig {
    /// Expected sample rate per sensor, in Hz. Keys accept the same aliases
    /// as the wire format; two keys naming the same sensor are rejected.
    #[serde(default = "default_nominal_rates", deserialize_with = "deserialize_rates")]
    pub nominal_rates_hz: BTreeMap<SensorType, f64>,

    /// Rate assumed for sensors not listed above. Default: 10Hz.
    #[serde(default = "default_rate_hz")]
    pub default_rate_hz: f64,

    /// Consecutive samples further apart than `gap_factor` nominal intervals
    /// delimit a gap. Default: 1.5.
    #[serde(default = "default_gap_factor")]
    pub gap_factor: f64,

    /// Maximum points per series handed to the dashboard. Default: 2000.
    #[serde(default = "default_display_budget")]
    pub display_budget: usize,

    /// Decimation strategy when a series exceeds the display budget. Default: min_max.
    #[serde(default)]
    pub decimation: Decimation,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decimation {
    /// Keep every n-th sample.
    Stride,
    /// Keep the extremes of each bucket.
    #[default]
    MinMax,
}

/// Dashboard API and live refresh configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DashboardConfig {
    /// Listen address. Empty disables the dashboard API. Default: ":8501".
    #[serde(default = "default_dashboard_addr")]
    pub addr: String,

    /// Live refresh period, between 100ms and 5s. Default: 1s.
    #[serde(default = "default_refresh_interval", with = "humantime_serde")]
    pub refresh_interval: Duration,

    /// Also refresh when new samples are committed. Default: false.
    #[serde(default)]
    pub event_driven: bool,

    /// Live views, each driven by its own refresh loop.
    #[serde(default)]
    pub views: Vec<ViewConfig>,
}

/// A named live view.
#[derive(Debug, Clone, Deserialize)]
pub struct ViewConfig {
    pub name: String,
    pub device_id: String,
    pub sensors: Vec<String>,
    /// Default: 10s.
    #[serde(default = "default_view_span", with = "humantime_serde")]
    pub span: Duration,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_tcp_addr() -> String {
    ":7070".to_string()
}

fn default_http_addr() -> String {
    ":8000".to_string()
}

fn default_max_frame_bytes() -> usize {
    1024 * 1024 // 1MiB
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_max_sessions() -> usize {
    256
}

fn default_max_inflight_per_session() -> usize {
    256
}

fn default_order_tolerance() -> Duration {
    Duration::from_millis(5)
}

fn default_store_path() -> PathBuf {
    PathBuf::from("sensorhub.db")
}

fn default_busy_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_queue_capacity() -> usize {
    4096
}

fn default_batch_size() -> usize {
    1024
}

fn default_max_linger() -> Duration {
    Duration::from_millis(2)
}

fn default_read_timeout() -> Duration {
    Duration::from_millis(50)
}

fn default_retention_max_age() -> Option<Duration> {
    Some(Duration::from_secs(10 * 60))
}

fn default_retention_max_samples() -> Option<usize> {
    Some(100_000)
}

fn default_retention_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_nominal_rates() -> BTreeMap<SensorType, f64> {
    [
        ("accelerometer", 50.0),
        ("gyroscope", 50.0),
        ("magnetometer", 50.0),
        ("gravity", 50.0),
        ("orientation", 50.0),
        ("barometer", 1.0),
        ("location", 1.0),
    ]
    .into_iter()
    .filter_map(|(k, v)| k.parse().ok().map(|sensor| (sensor, v)))
    .collect()
}

fn deserialize_rates<'de, D>(deserializer: D) -> Result<BTreeMap<SensorType, f64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    let raw = BTreeMap::<String, f64>::deserialize(deserializer)?;
    let mut rates = BTreeMap::new();
    for (name, hz) in raw {
        let sensor: SensorType = name.parse().map_err(D::Error::custom)?;
        if rates.insert(sensor.clone(), hz).is_some() {
            return Err(D::Error::custom(format!(
                "sensor {sensor} is listed more than once (via {name:?})"
            )));
        }
    }
    Ok(rates)
}

fn default_rate_hz() -> f64 {
    10.0
}

fn default_gap_factor() -> f64 {
    1.5
}

fn default_display_budget() -> usize {
    2000
}

fn default_dashboard_addr() -> String {
    ":8501".to_string()
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_view_span() -> Duration {
    Duration::from_secs(10)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            ingest: IngestConfig::default(),
            store: StoreConfig::default(),
            aggregate: AggregateConfig::default(),
            dashboard: DashboardConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            tcp_addr: default_tcp_addr(),
            http_addr: default_http_addr(),
            framing: Framing::default(),
            max_frame_bytes: default_max_frame_bytes(),
            idle_timeout: default_idle_timeout(),
            max_sessions: default_max_sessions(),
            max_inflight_per_session: default_max_inflight_per_session(),
            device_id_from_peer: default_true(),
            sensors: Vec::new(),
            order_tolerance: default_order_tolerance(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            path: default_store_path(),
            journal_mode: JournalMode::default(),
            sync_mode: SyncMode::default(),
            busy_timeout: default_busy_timeout(),
            queue_capacity: default_queue_capacity(),
            batch_size: default_batch_size(),
            max_linger: default_max_linger(),
            read_timeout: default_read_timeout(),
            memory_max_samples: None,
            retention: RetentionConfig::default(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_age: default_retention_max_age(),
            max_samples_per_stream: default_retention_max_samples(),
            interval: default_retention_interval(),
        }
    }
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            nominal_rates_hz: default_nominal_rates(),
            default_rate_hz: default_rate_hz(),
            gap_factor: default_gap_factor(),
            display_budget: default_display_budget(),
            decimation: Decimation::default(),
        }
    }
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            addr: default_dashboard_addr(),
            refresh_interval: default_refresh_interval(),
            event_driven: false,
            views: Vec::new(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

const MIN_REFRESH_INTERVAL: Duration = Duration::from_millis(100);
const MAX_REFRESH_INTERVAL: Duration = Duration::from_secs(5);
const MIN_RATE_HZ: f64 = 0.001;
const MAX_RATE_HZ: f64 = 100_000.0;
const MAX_GAP_FACTOR: f64 = 1_000.0;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        self.ingest.validate()?;
        self.store.validate()?;
        self.aggregate.validate()?;
        self.dashboard.validate()?;
        Ok(())
    }
}

impl IngestConfig {
    fn validate(&self) -> Result<()> {
        if self.tcp_addr.is_empty() && self.http_addr.is_empty() {
            bail!("at least one of ingest.tcp_addr or ingest.http_addr is required");
        }
        if self.max_frame_bytes == 0 {
            bail!("ingest.max_frame_bytes must be positive");
        }
        if self.idle_timeout.is_zero() {
            bail!("ingest.idle_timeout must be positive");
        }
        if self.max_sessions == 0 {
            bail!("ingest.max_sessions must be positive");
        }
        if self.max_inflight_per_session == 0 {
            bail!("ingest.max_inflight_per_session must be positive");
        }
        self.sensor_filter()?;
        Ok(())
    }

    /// Resolved sensor allow-list; `None` keeps every sensor.
    pub fn sensor_filter(&self) -> Result<Option<HashSet<SensorType>>> {
        if self.sensors.is_empty() {
            return Ok(None);
        }
        let mut set = HashSet::with_capacity(self.sensors.len());
        for name in &self.sensors {
            let sensor = name
                .parse::<SensorType>()
                .with_context(|| format!("ingest.sensors: invalid sensor {name:?}"))?;
            set.insert(sensor);
        }
        Ok(Some(set))
    }
}

impl StoreConfig {
    fn validate(&self) -> Result<()> {
        if self.backend == BackendKind::Sqlite && self.path.as_os_str().is_empty() {
            bail!("store.path is required for the sqlite backend");
        }
        if self.queue_capacity == 0 {
            bail!("store.queue_capacity must be positive");
        }
        if self.batch_size == 0 {
            bail!("store.batch_size must be positive");
        }
        if self.read_timeout.is_zero() {
            bail!("store.read_timeout must be positive");
        }
        if self.memory_max_samples == Some(0) {
            bail!("store.memory_max_samples must be positive when set");
        }
        if self.retention.interval.is_zero() {
            bail!("store.retention.interval must be positive");
        }
        if self.retention.max_age.is_some_and(|d| d.is_zero()) {
            bail!("store.retention.max_age must be positive when set");
        }
        if self.retention.max_samples_per_stream == Some(0) {
            bail!("store.retention.max_samples_per_stream must be positive when set");
        }
        Ok(())
    }
}

impl AggregateConfig {
    fn validate(&self) -> Result<()> {
        for (sensor, hz) in &self.nominal_rates_hz {
            if !valid_rate(*hz) {
                bail!(
                    "aggregate.nominal_rates_hz.{sensor} must be between {MIN_RATE_HZ} and {MAX_RATE_HZ} Hz"
                );
            }
        }
        if !valid_rate(self.default_rate_hz) {
            bail!("aggregate.default_rate_hz must be between {MIN_RATE_HZ} and {MAX_RATE_HZ} Hz");
        }
        if !(1.0..=MAX_GAP_FACTOR).contains(&self.gap_factor) {
            bail!("aggregate.gap_factor must be between 1.0 and {MAX_GAP_FACTOR}");
        }
        if self.display_budget < 2 {
            bail!("aggregate.display_budget must be at least 2");
        }
        Ok(())
    }

    /// Expected spacing between two samples of `sensor`.
    ///
    /// Saturates instead of panicking on rates a validated config cannot hold.
    pub fn nominal_interval(&self, sensor: &SensorType) -> Duration {
        let hz = self
            .nominal_rates_hz
            .get(sensor)
            .copied()
            .unwrap_or(self.default_rate_hz);
        Duration::try_from_secs_f64(1.0 / hz).unwrap_or(Duration::MAX)
    }

    /// Spacing beyond which two consecutive samples of `sensor` delimit a gap.
    pub fn gap_limit(&self, sensor: &SensorType) -> Duration {
        let secs = self.nominal_interval(sensor).as_secs_f64() * self.gap_factor;
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

impl DashboardConfig {
    fn validate(&self) -> Result<()> {
        if self.refresh_interval < MIN_REFRESH_INTERVAL
            || self.refresh_interval > MAX_REFRESH_INTERVAL
        {
            bail!(
                "dashboard.refresh_interval {:?} must be between {:?} and {:?}",
                self.refresh_interval,
                MIN_REFRESH_INTERVAL,
                MAX_REFRESH_INTERVAL,
            );
        }

        let mut names = HashSet::with_capacity(self.views.len());
        for view in &self.views {
            if view.name.is_empty() {
                bail!("dashboard.views: name is required");
            }
            if !names.insert(view.name.as_str()) {
                bail!("dashboard.views: duplicate view name {:?}", view.name);
            }
            if view.device_id.is_empty() {
                bail!("dashboard.views.{}: device_id is required", view.name);
            }
            if view.sensors.is_empty() {
                bail!("dashboard.views.{}: sensors must not be empty", view.name);
            }
            if view.span.is_zero() {
                bail!("dashboard.views.{}: span must be positive", view.name);
            }
            view.sensor_set()?;
        }
        Ok(())
    }
}

impl ViewConfig {
    /// The view's sensors, parsed.
    pub fn sensor_set(&self) -> Result<std::collections::BTreeSet<SensorType>> {
        self.sensors
            .iter()
            .map(|name| {
                name.parse::<SensorType>().with_context(|| {
                    format!("dashboard.views.{}: invalid sensor {name:?}", self.name)
                })
            })
            .collect()
    }
}

fn valid_rate(hz: f64) -> bool {
    (MIN_RATE_HZ..=MAX_RATE_HZ).contains(&hz)
}

/// Expand the ":port" shorthand to an all-interfaces bind address.
pub fn bind_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}
