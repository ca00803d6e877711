//! Typed sensor samples and their wire/storage codec.
//!
//! A [`Sample`] is one timestamped reading of one sensor on one device. Samples
//! are immutable once parsed; the store hands them out as `Arc<Sample>`.

pub mod order;
pub mod parse;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use parse::{decode, encode, parse, parse_frame, DecodedFrame, FrameContext, ParseError};

/// Wall-clock instant in nanoseconds since the Unix epoch.
///
/// Compared with a total order; ties between samples are broken by the store's
/// arrival sequence, never by field values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    pub const fn as_nanos(self) -> i64 {
        self.0
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        let nanos = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or(i64::MAX);
        Self(nanos)
    }

    pub fn saturating_sub(self, d: Duration) -> Self {
        let nanos = i64::try_from(d.as_nanos()).unwrap_or(i64::MAX);
        Self(self.0.saturating_sub(nanos))
    }

    pub fn saturating_add(self, d: Duration) -> Self {
        let nanos = i64::try_from(d.as_nanos()).unwrap_or(i64::MAX);
        Self(self.0.saturating_add(nanos))
    }

    /// Absolute distance between two instants.
    pub fn abs_diff(self, other: Self) -> Duration {
        Duration::from_nanos(self.0.abs_diff(other.0))
    }

    /// RFC 3339 rendering with nanosecond precision.
    pub fn to_rfc3339(self) -> String {
        chrono::DateTime::from_timestamp_nanos(self.0)
            .to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of sensor producing a stream.
///
/// Names are matched case-insensitively, with the aliases the mobile producer
/// is known to emit (`gps`, `accel`, `pressure`, ...). Anything else is kept
/// verbatim (lowercased) as [`SensorType::Other`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum SensorType {
    Accelerometer,
    Gyroscope,
    Magnetometer,
    Barometer,
    Location,
    Gravity,
    Orientation,
    Other(String),
}

impl SensorType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Accelerometer => "accelerometer",
            Self::Gyroscope => "gyroscope",
            Self::Magnetometer => "magnetometer",
            Self::Barometer => "barometer",
            Self::Location => "location",
            Self::Gravity => "gravity",
            Self::Orientation => "orientation",
            Self::Other(name) => name,
        }
    }
}

impl FromStr for SensorType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        let sensor = match name.as_str() {
            "" => return Err(ParseError::EmptySensorName),
            "accelerometer" | "accel" | "acceleration" => Self::Accelerometer,
            "gyroscope" | "gyro" => Self::Gyroscope,
            "magnetometer" | "mag" | "magneticfield" => Self::Magnetometer,
            "barometer" | "pressure" => Self::Barometer,
            "location" | "gps" => Self::Location,
            "gravity" => Self::Gravity,
            "orientation" => Self::Orientation,
            _ => Self::Other(name),
        };
        Ok(sensor)
    }
}

impl TryFrom<String> for SensorType {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SensorType> for String {
    fn from(value: SensorType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a stream: one sensor on one device.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamKey {
    pub device_id: String,
    pub sensor: SensorType,
}

impl StreamKey {
    pub fn new(device_id: impl Into<String>, sensor: SensorType) -> Self {
        Self {
            device_id: device_id.into(),
            sensor,
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device_id, self.sensor)
    }
}

/// One timestamped sensor reading with one or more numeric fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub device_id: String,
    pub sensor: SensorType,
    pub timestamp: Timestamp,
    /// Producer-side monotonic clock, when the producer sends one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mono_ns: Option<u64>,
    pub fields: BTreeMap<String, f64>,
}

impl Sample {
    pub fn stream_key(&self) -> StreamKey {
        StreamKey::new(self.device_id.clone(), self.sensor.clone())
    }

    pub fn field(&self, name: &str) -> Option<f64> {
        self.fields.get(name).copied()
    }
}
