use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use shared_logging::LogLevel;
use shared_message_bus::BusMessage;
use thiserror::Error;

use crate::{
    ingest::{coerce_f64, coerce_i64, lookup, HUMIDITY_KEYS, TEMPERATURE_KEYS},
    state::SourceMode,
    telemetry::EngineTelemetry,
    transport::BusHandler,
};

/// Measurement name every point is written under.
pub const MEASUREMENT: &str = "smartart";
/// Smallest `ts_ms` treated as a wall-clock epoch (September 2020).
/// Smaller values are milliseconds since the board booted.
pub const EPOCH_MS_FLOOR: i64 = 1_600_000_000_000;

/// Failures turning a payload into an archived point.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// A required telemetry field is absent.
    #[error("missing {0}")]
    MissingField(&'static str),
    /// Payload is not an object or a field has the wrong type.
    #[error("malformed measurement: {0}")]
    Malformed(String),
    /// Writing the archive failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Payload or record (de)serialization failed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// One time-series point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementPoint {
    /// Measurement name.
    pub measurement: String,
    /// Reporting board.
    pub device_id: String,
    /// Degrees Celsius.
    pub temperature: f64,
    /// Relative humidity.
    pub humidity: f64,
    /// Raw light level.
    pub light: i64,
    /// Motion as 0/1.
    pub motion: i64,
    /// Explicit timestamp; `None` lets the store use its own clock.
    pub timestamp_ns: Option<i64>,
}

impl MeasurementPoint {
    /// Builds a point; all four telemetry fields are required.
    pub fn from_payload(payload: &Value) -> Result<Self, ArchiveError> {
        let object = payload
            .as_object()
            .ok_or_else(|| ArchiveError::Malformed("payload must be a JSON object".into()))?;
        let temperature = required(object, "temperature", TEMPERATURE_KEYS, coerce_f64)?;
        let humidity = required(object, "humidity", HUMIDITY_KEYS, coerce_f64)?;
        let light = required(object, "light", &["light"], coerce_i64)?;
        let motion = required(object, "motion", &["motion"], |raw| match raw {
            Value::Bool(flag) => Some(i64::from(*flag)),
            other => coerce_i64(other),
        })?;
        let device_id = match object.get("device_id") {
            None | Some(Value::Null) => "unknown".to_string(),
            Some(Value::String(id)) => id.clone(),
            Some(other) => other.to_string(),
        };
        Ok(Self {
            measurement: MEASUREMENT.to_string(),
            device_id,
            temperature,
            humidity,
            light,
            motion,
            timestamp_ns: object.get("ts_ms").and_then(epoch_ns),
        })
    }
}

fn required<T>(
    object: &Map<String, Value>,
    name: &'static str,
    keys: &[&'static str],
    coerce: impl Fn(&Value) -> Option<T>,
) -> Result<T, ArchiveError> {
    let (key, raw) = lookup(object, keys).ok_or(ArchiveError::MissingField(name))?;
    coerce(raw)
        .ok_or_else(|| ArchiveError::Malformed(format!("field '{key}' is not numeric: {raw}")))
}

/// Nanoseconds for a real epoch in ms; board uptime counters yield `None`.
#[allow(clippy::cast_possible_truncation)]
fn epoch_ns(raw: &Value) -> Option<i64> {
    let ms = match raw {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|value| value.trunc() as i64))?,
        _ => return None,
    };
    if ms >= EPOCH_MS_FLOOR {
        ms.checked_mul(1_000_000)
    } else {
        None
    }
}

/// Append-only JSON-lines archive of measurement points.
#[derive(Debug)]
pub struct MeasurementArchive {
    path: PathBuf,
    writer: Mutex<File>,
}

impl MeasurementArchive {
    /// Opens (or creates) an archive at the given path.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating archive dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening measurement archive {}", path.display()))?;
        Ok(Self {
            path,
            writer: Mutex::new(file),
        })
    }

    /// Appends one point.
    pub fn append(&self, point: &MeasurementPoint) -> Result<(), ArchiveError> {
        let record = json!({
            "archived_at": Utc::now(),
            "point": point,
        });
        let mut guard = self.writer.lock();
        serde_json::to_writer(&mut *guard, &record)?;
        guard.write_all(b"\n")?;
        guard.flush()?;
        Ok(())
    }

    /// Archive file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Archives every telemetry payload seen on either transport, whichever
/// source is authoritative.
#[derive(Debug, Clone)]
pub struct ArchiveRecorder {
    archive: Arc<MeasurementArchive>,
    data_topic: String,
    telemetry: EngineTelemetry,
}

impl ArchiveRecorder {
    /// Creates a recorder for `data_topic`.
    #[must_use]
    pub fn new(
        archive: Arc<MeasurementArchive>,
        data_topic: impl Into<String>,
        telemetry: EngineTelemetry,
    ) -> Self {
        Self {
            archive,
            data_topic: data_topic.into(),
            telemetry,
        }
    }

    /// Decodes and appends one message payload.
    pub fn record(&self, payload: &[u8]) -> Result<MeasurementPoint, ArchiveError> {
        let text = std::str::from_utf8(payload)
            .map_err(|err| ArchiveError::Malformed(format!("payload is not UTF-8: {err}")))?;
        let value: Value = serde_json::from_str(text.trim())?;
        let point = MeasurementPoint::from_payload(&value)?;
        self.archive.append(&point)?;
        Ok(point)
    }

    /// Records a payload received over `origin`, logging the result.
    pub fn observe(&self, origin: SourceMode, payload: &[u8]) {
        match self.record(payload) {
            Ok(point) => {
                let _ = self.telemetry.log(
                    LogLevel::Debug,
                    "archive.written",
                    json!({
                        "origin": origin.as_str(),
                        "device_id": point.device_id,
                        "timestamp_ns": point.timestamp_ns,
                    }),
                );
            }
            Err(err) => {
                let _ = self.telemetry.log(
                    LogLevel::Warn,
                    "archive.rejected",
                    json!({ "origin": origin.as_str(), "error": err.to_string() }),
                );
            }
        }
    }
}

impl BusHandler for ArchiveRecorder {
    fn handle(&self, message: &BusMessage) {
        if message.topic == self.data_topic {
            self.observe(SourceMode::MessageBus, &message.payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_logging::MemoryLogSink;
    use tempfile::tempdir;

    #[test]
    fn point_requires_every_field() {
        let partial = json!({ "temperature": 21, "humidity": 40, "light": 5 });
        let err = MeasurementPoint::from_payload(&partial).unwrap_err();
        assert!(matches!(err, ArchiveError::MissingField("motion")));
        assert_eq!(err.to_string(), "missing motion");
        assert!(matches!(
            MeasurementPoint::from_payload(&json!("text")),
            Err(ArchiveError::Malformed(_))
        ));
    }

    #[test]
    fn epoch_and_uptime_timestamps() {
        let base = json!({ "temp": 21.5, "hum": 40, "light": 300, "motion": 1 });
        let point = MeasurementPoint::from_payload(&base).unwrap();
        assert_eq!(point.device_id, "unknown");
        assert_eq!(point.timestamp_ns, None);
        assert_eq!(point.motion, 1);

        let mut stamped = base.clone();
        stamped["ts_ms"] = json!(1_700_000_000_123_i64);
        stamped["device_id"] = json!("esp32-lobby");
        let point = MeasurementPoint::from_payload(&stamped).unwrap();
        assert_eq!(point.timestamp_ns, Some(1_700_000_000_123_000_000));
        assert_eq!(point.device_id, "esp32-lobby");

        let mut uptime = base;
        uptime["ts_ms"] = json!(86_400_000);
        assert_eq!(MeasurementPoint::from_payload(&uptime).unwrap().timestamp_ns, None);
    }

    #[test]
    fn recorder_appends_and_rejects() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("archive").join("points.jsonl");
        let archive = Arc::new(MeasurementArchive::open(&path).unwrap());
        let sink = Arc::new(MemoryLogSink::new(16));
        let telemetry = EngineTelemetry::builder("archive")
            .sink(sink.clone())
            .build()
            .unwrap();
        let recorder = ArchiveRecorder::new(archive.clone(), "smartart/sensordata", telemetry);

        recorder.handle(&BusMessage::new(
            "smartart/sensordata",
            r#"{"temperature": 22, "humidity": 45, "light": 900, "motion": false}"#,
        ));
        recorder.handle(&BusMessage::new("smartart/sensordata", r#"{"temperature": 22}"#));
        recorder.handle(&BusMessage::new("smartart/cmd/mode", "request"));

        assert_eq!(sink.count("archive.written"), 1);
        assert_eq!(sink.count("archive.rejected"), 1);
        let content = fs::read_to_string(archive.path()).unwrap();
        assert_eq!(content.lines().count(), 1);
        let record: Value = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(record["point"]["light"], json!(900));
        assert_eq!(record["point"]["motion"], json!(0));
    }
}
