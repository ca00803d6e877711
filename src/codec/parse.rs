//! JSON frame decoding.
//!
//! Three frame shapes are accepted:
//! - a single record: `{"device_id", "sensor", "timestamp", "fields"}`
//! - a JSON array of single records
//! - the mobile logger batch: `{"deviceId", "payload": [{"name", "time", "values"}]}`
//!
//! Entries of a multi-sample frame are decoded independently so one bad entry
//! never takes its siblings down with it.

use std::collections::BTreeMap;

use serde_json::{Map, Number, Value};
use thiserror::Error;

use super::{Sample, SensorType, Timestamp};

/// Errors that can occur while decoding a frame or record.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("invalid json: {0}")]
    InvalidJson(String),

    #[error("expected a json object, found {found}")]
    NotAnObject { found: &'static str },

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("sensor name is empty")]
    EmptySensorName,

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("field {field} is not finite")]
    NonFiniteValue { field: String },

    #[error("record carries no numeric fields")]
    NoNumericFields,

    #[error("frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge { size: usize, limit: usize },
}

impl ParseError {
    /// Short label used for the parse-error metric.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidJson(_) => "invalid_json",
            Self::NotAnObject { .. } => "not_an_object",
            Self::MissingField(_) => "missing_field",
            Self::EmptySensorName => "empty_sensor",
            Self::InvalidTimestamp(_) => "invalid_timestamp",
            Self::NonFiniteValue { .. } => "non_finite",
            Self::NoNumericFields => "no_fields",
            Self::FrameTooLarge { .. } => "frame_too_large",
        }
    }
}

/// Per-session decoding context.
#[derive(Debug, Clone, Default)]
pub struct FrameContext {
    /// Device id used when a record does not name one (the peer address).
    pub fallback_device: Option<String>,
}

/// Result of decoding one frame: the good samples plus per-entry rejections.
#[derive(Debug, Default)]
pub struct DecodedFrame {
    pub samples: Vec<Sample>,
    pub rejected: Vec<ParseError>,
}

/// Parse exactly one self-describing record.
///
/// The device id, sensor name and timestamp are all required.
pub fn parse(raw: &[u8]) -> Result<Sample, ParseError> {
    let value = from_slice(raw)?;
    let obj = as_object(&value)?;
    parse_record(obj, None)
}

/// Decode one frame of any accepted shape.
///
/// Frame-level failures (bad JSON, wrong top-level type) are returned as `Err`;
/// entry-level failures land in [`DecodedFrame::rejected`].
pub fn parse_frame(raw: &[u8], ctx: &FrameContext) -> Result<DecodedFrame, ParseError> {
    let value = from_slice(raw)?;
    let mut frame = DecodedFrame::default();

    match &value {
        Value::Array(entries) => {
            for entry in entries {
                push_entry(&mut frame, as_object(entry).and_then(|o| {
                    parse_record(o, ctx.fallback_device.as_deref())
                }));
            }
        }
        Value::Object(obj) => match obj.get("payload") {
            Some(Value::Array(entries)) => {
                let device = string_field(obj, &["deviceId", "device_id"])
                    .or(ctx.fallback_device.as_deref());
                for entry in entries {
                    push_entry(
                        &mut frame,
                        as_object(entry).and_then(|o| parse_record(o, device)),
                    );
                }
            }
            Some(_) => return Err(ParseError::MissingField("payload")),
            None => push_entry(
                &mut frame,
                parse_record(obj, ctx.fallback_device.as_deref()),
            ),
        },
        other => {
            return Err(ParseError::NotAnObject {
                found: json_type(other),
            })
        }
    }

    Ok(frame)
}

/// Serialize a sample into its lossless storage form.
pub fn encode(sample: &Sample) -> Vec<u8> {
    let mut fields = Map::with_capacity(sample.fields.len());
    for (name, value) in &sample.fields {
        // Non-finite values are rejected on the way in, so from_f64 always succeeds.
        if let Some(n) = Number::from_f64(*value) {
            fields.insert(name.clone(), Value::Number(n));
        }
    }

    let mut obj = Map::with_capacity(5);
    obj.insert("device_id".into(), Value::String(sample.device_id.clone()));
    obj.insert("sensor".into(), Value::String(sample.sensor.to_string()));
    obj.insert(
        "timestamp".into(),
        Value::Number(Number::from(sample.timestamp.as_nanos())),
    );
    if let Some(mono) = sample.mono_ns {
        obj.insert("mono_ns".into(), Value::Number(Number::from(mono)));
    }
    obj.insert("fields".into(), Value::Object(fields));

    Value::Object(obj).to_string().into_bytes()
}

/// Inverse of [`encode`].
pub fn decode(raw: &[u8]) -> Result<Sample, ParseError> {
    parse(raw)
}

fn push_entry(frame: &mut DecodedFrame, result: Result<Sample, ParseError>) {
    match result {
        Ok(sample) => frame.samples.push(sample),
        Err(e) => frame.rejected.push(e),
    }
}

fn from_slice(raw: &[u8]) -> Result<Value, ParseError> {
    serde_json::from_slice(raw).map_err(|e| ParseError::InvalidJson(e.to_string()))
}

fn as_object(value: &Value) -> Result<&Map<String, Value>, ParseError> {
    value.as_object().ok_or(ParseError::NotAnObject {
        found: json_type(value),
    })
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn string_field<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .filter(|s| !s.trim().is_empty())
}

fn parse_record(
    obj: &Map<String, Value>,
    fallback_device: Option<&str>,
) -> Result<Sample, ParseError> {
    let device_id = string_field(obj, &["device_id", "deviceId"])
        .or(fallback_device)
        .ok_or(ParseError::MissingField("device_id"))?
        .to_string();

    let sensor: SensorType = string_field(obj, &["sensor", "sensor_type", "name"])
        .ok_or(ParseError::MissingField("sensor"))?
        .parse()?;

    let timestamp = ["timestamp", "time"]
        .iter()
        .find_map(|k| obj.get(*k))
        .ok_or(ParseError::MissingField("timestamp"))
        .and_then(parse_timestamp)?;

    let mono_ns = ["mono_ns", "elapsed_ns"]
        .iter()
        .find_map(|k| obj.get(*k))
        .and_then(Value::as_u64);

    let values = ["fields", "values"]
        .iter()
        .find_map(|k| obj.get(*k))
        .ok_or(ParseError::MissingField("fields"))?;
    let values = as_object(values)?;

    let mut fields = BTreeMap::new();
    for (name, value) in values {
        // Producers attach string metadata next to readings; only numbers are fields.
        if let Value::Number(n) = value {
            let v = n.as_f64().ok_or_else(|| ParseError::NonFiniteValue {
                field: name.clone(),
            })?;
            if !v.is_finite() {
                return Err(ParseError::NonFiniteValue {
                    field: name.clone(),
                });
            }
            fields.insert(name.clone(), v);
        }
    }
    if fields.is_empty() {
        return Err(ParseError::NoNumericFields);
    }

    Ok(Sample {
        device_id,
        sensor,
        timestamp,
        mono_ns,
        fields,
    })
}

/// Integers are nanoseconds since the epoch, floats are seconds, strings are RFC 3339.
fn parse_timestamp(value: &Value) -> Result<Timestamp, ParseError> {
    match value {
        Value::Number(n) => {
            if let Some(ns) = n.as_i64() {
                if ns < 0 {
                    return Err(ParseError::InvalidTimestamp(format!("negative: {ns}")));
                }
                return Ok(Timestamp::from_nanos(ns));
            }
            if n.is_u64() {
                return Err(ParseError::InvalidTimestamp(format!("out of range: {n}")));
            }
            let secs = n
                .as_f64()
                .ok_or_else(|| ParseError::InvalidTimestamp(n.to_string()))?;
            let nanos = (secs * 1e9).round();
            if !nanos.is_finite() || nanos < 0.0 || nanos >= i64::MAX as f64 {
                return Err(ParseError::InvalidTimestamp(format!("out of range: {secs}")));
            }
            Ok(Timestamp::from_nanos(nanos as i64))
        }
        Value::String(s) => {
            let dt = chrono::DateTime::parse_from_rfc3339(s)
                .map_err(|e| ParseError::InvalidTimestamp(format!("{s}: {e}")))?;
            let nanos = dt
                .timestamp_nanos_opt()
                .ok_or_else(|| ParseError::InvalidTimestamp(format!("out of range: {s}")))?;
            Ok(Timestamp::from_nanos(nanos))
        }
        other => Err(ParseError::InvalidTimestamp(format!(
            "expected number or string, found {}",
            json_type(other)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ts: i64) -> String {
        format!(
            r#"{{"device_id":"phone-1","sensor":"accelerometer","timestamp":{ts},"fields":{{"x":0.1,"y":-9.81,"z":0.25}}}}"#
        )
    }

    #[test]
    fn test_parse_single_record() {
        let sample = parse(record(1_700_000_000_000_000_001).as_bytes()).expect("should parse");
        assert_eq!(sample.device_id, "phone-1");
        assert_eq!(sample.sensor, SensorType::Accelerometer);
        assert_eq!(sample.timestamp.as_nanos(), 1_700_000_000_000_000_001);
        assert_eq!(sample.field("y"), Some(-9.81));
        assert_eq!(sample.fields.len(), 3);
        assert_eq!(sample.mono_ns, None);
    }

    #[test]
    fn test_parse_rejects_missing_required_fields() {
        let no_device = br#"{"sensor":"gps","timestamp":1,"fields":{"lat":1.0}}"#;
        assert_eq!(
            parse(no_device).unwrap_err(),
            ParseError::MissingField("device_id")
        );

        let no_sensor = br#"{"device_id":"d","timestamp":1,"fields":{"lat":1.0}}"#;
        assert_eq!(parse(no_sensor).unwrap_err(), ParseError::MissingField("sensor"));

        let no_ts = br#"{"device_id":"d","sensor":"gps","fields":{"lat":1.0}}"#;
        assert_eq!(parse(no_ts).unwrap_err(), ParseError::MissingField("timestamp"));

        let no_fields = br#"{"device_id":"d","sensor":"gps","timestamp":1,"fields":{"note":"x"}}"#;
        assert_eq!(parse(no_fields).unwrap_err(), ParseError::NoNumericFields);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let err = parse(b"{not json").unwrap_err();
        assert_eq!(err.kind(), "invalid_json");

        let err = parse(b"[1,2]").unwrap_err();
        assert!(err.to_string().contains("array"));
    }

    #[test]
    fn test_parse_timestamp_forms() {
        let secs = br#"{"device_id":"d","sensor":"gps","timestamp":1.5,"fields":{"lat":1.0}}"#;
        assert_eq!(parse(secs).expect("secs").timestamp.as_nanos(), 1_500_000_000);

        let rfc = br#"{"device_id":"d","sensor":"gps","timestamp":"1970-01-01T00:00:02.000000250Z","fields":{"lat":1.0}}"#;
        assert_eq!(parse(rfc).expect("rfc3339").timestamp.as_nanos(), 2_000_000_250);

        let negative = br#"{"device_id":"d","sensor":"gps","timestamp":-4,"fields":{"lat":1.0}}"#;
        assert_eq!(parse(negative).unwrap_err().kind(), "invalid_timestamp");

        let boolean = br#"{"device_id":"d","sensor":"gps","timestamp":true,"fields":{"lat":1.0}}"#;
        assert_eq!(parse(boolean).unwrap_err().kind(), "invalid_timestamp");
    }

    #[test]
    fn test_parse_frame_logger_batch() {
        let raw = br#"{
            "messageId": 7,
            "sessionId": "abc",
            "deviceId": "pixel-8",
            "payload": [
                {"name": "accelerometer", "time": 1000, "values": {"x": 1.0, "y": 2.0, "z": 3.0}},
                {"name": "location", "time": 2000, "values": {"latitude": 52.1, "longitude": 4.3, "bearingAccuracy": 0.5}},
                {"name": "gyroscope", "values": {"x": 1.0}},
                {"name": "barometer", "time": 3000, "values": {"pressure": 1013.25, "unit": "hPa"}}
            ]
        }"#;

        let frame = parse_frame(raw, &FrameContext::default()).expect("frame should parse");
        assert_eq!(frame.samples.len(), 3);
        assert_eq!(frame.rejected, vec![ParseError::MissingField("timestamp")]);
        assert!(frame.samples.iter().all(|s| s.device_id == "pixel-8"));
        assert_eq!(frame.samples[1].sensor, SensorType::Location);
        assert_eq!(frame.samples[2].fields.len(), 1);
    }

    #[test]
    fn test_parse_frame_uses_fallback_device() {
        let raw = br#"{"payload":[{"name":"gravity","time":5,"values":{"x":0.0}}]}"#;
        let ctx = FrameContext {
            fallback_device: Some("10.0.0.7".to_string()),
        };
        let frame = parse_frame(raw, &ctx).expect("frame should parse");
        assert_eq!(frame.samples[0].device_id, "10.0.0.7");

        let frame = parse_frame(raw, &FrameContext::default()).expect("frame should parse");
        assert!(frame.samples.is_empty());
        assert_eq!(frame.rejected, vec![ParseError::MissingField("device_id")]);
    }

    #[test]
    fn test_parse_frame_array_of_records() {
        let raw = format!("[{},{}, 3]", record(1), record(2));
        let frame = parse_frame(raw.as_bytes(), &FrameContext::default()).expect("frame");
        assert_eq!(frame.samples.len(), 2);
        assert_eq!(frame.rejected.len(), 1);
    }

    #[test]
    fn test_encode_decode_is_lossless() {
        let mut fields = BTreeMap::new();
        fields.insert("x".to_string(), 0.1 + 0.2);
        fields.insert("tiny".to_string(), f64::MIN_POSITIVE);
        fields.insert("big".to_string(), 1.797_693_134_862_315_7e308);
        fields.insert("third".to_string(), 1.0 / 3.0);
        let sample = Sample {
            device_id: "d".to_string(),
            sensor: SensorType::Magnetometer,
            timestamp: Timestamp::from_nanos(1_712_345_678_901_234_567),
            mono_ns: Some(42),
            fields,
        };

        let decoded = decode(&encode(&sample)).expect("decode");
        assert_eq!(decoded, sample);
        for (name, value) in &sample.fields {
            assert_eq!(decoded.fields[name].to_bits(), value.to_bits());
        }
    }
}
