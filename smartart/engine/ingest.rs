use std::time::Instant;

use serde_json::{json, Map, Value};
use shared_logging::LogLevel;
use thiserror::Error;

use crate::{
    state::{MergeResult, SharedEnvironment, SourceMode, TelemetryFields},
    telemetry::EngineTelemetry,
};

/// Errors surfaced at the ingest boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IngestError {
    /// Payload is not a JSON object or a field failed numeric coercion.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    /// Mode command named neither known source.
    #[error("invalid source mode '{0}' (expected 'message_bus' or 'request')")]
    InvalidMode(String),
}

/// What `submit` did with an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Fields merged into the snapshot.
    Applied {
        /// The motion flash was (re-)armed.
        motion_armed: bool,
    },
    /// Dropped: origin is not the authoritative source.
    Ignored {
        /// The source that was authoritative.
        active: SourceMode,
    },
    /// Authoritative origin, but the update carried no recognised field.
    Empty,
}

impl SubmitOutcome {
    /// Whether the snapshot was mutated.
    #[must_use]
    pub const fn applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

impl From<MergeResult> for SubmitOutcome {
    fn from(value: MergeResult) -> Self {
        match value {
            MergeResult::Applied { motion_armed } => Self::Applied { motion_armed },
            MergeResult::Ignored { active } => Self::Ignored { active },
            MergeResult::Empty => Self::Empty,
        }
    }
}

/// Decodes raw transport bytes into a partial telemetry record.
pub fn parse_payload(bytes: &[u8]) -> Result<TelemetryFields, IngestError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|err| IngestError::MalformedPayload(format!("payload is not UTF-8: {err}")))?;
    let value: Value = serde_json::from_str(text.trim())
        .map_err(|err| IngestError::MalformedPayload(format!("invalid JSON: {err}")))?;
    parse_fields(&value)
}

/// Extracts the recognised keys from a JSON object. Unknown keys are ignored.
/// The board firmware's short names (`temp`, `hum`) are accepted as aliases;
/// the long name wins when both are present.
///
/// A motion value that cannot be read as a number is dropped rather than
/// rejected; the other fields of the payload still apply.
pub fn parse_fields(value: &Value) -> Result<TelemetryFields, IngestError> {
    let object = value
        .as_object()
        .ok_or_else(|| IngestError::MalformedPayload("telemetry must be a JSON object".into()))?;
    let motion = object.get("motion").and_then(|raw| {
        let coerced = coerce_motion(raw);
        if coerced.is_none() {
            tracing::debug!(value = %raw, "ignoring non-numeric motion value");
        }
        coerced
    });
    Ok(TelemetryFields {
        temperature: optional(object, TEMPERATURE_KEYS, coerce_f64)?,
        humidity: optional(object, HUMIDITY_KEYS, coerce_f64)?,
        light: optional(object, &["light"], coerce_i64)?,
        motion,
    })
}

pub(crate) const TEMPERATURE_KEYS: &[&str] = &["temperature", "temp"];
pub(crate) const HUMIDITY_KEYS: &[&str] = &["humidity", "hum"];

/// First present key among `keys`, with its value.
pub(crate) fn lookup<'a>(
    object: &'a Map<String, Value>,
    keys: &[&'static str],
) -> Option<(&'static str, &'a Value)> {
    keys.iter()
        .find_map(|&key| object.get(key).map(|raw| (key, raw)))
}

fn optional<T>(
    object: &Map<String, Value>,
    keys: &[&'static str],
    coerce: fn(&Value) -> Option<T>,
) -> Result<Option<T>, IngestError> {
    lookup(object, keys)
        .map(|(key, raw)| {
            coerce(raw).ok_or_else(|| {
                IngestError::MalformedPayload(format!("field '{key}' is not numeric: {raw}"))
            })
        })
        .transpose()
}

/// Numbers and numeric strings; anything non-finite is rejected.
pub(crate) fn coerce_f64(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    number.is_finite().then_some(number)
}

/// Like [`coerce_f64`] but truncated toward zero.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn coerce_i64(value: &Value) -> Option<i64> {
    if let Some(integer) = value.as_i64() {
        return Some(integer);
    }
    let number = coerce_f64(value)?.trunc();
    // i64::MAX as f64 rounds up to 2^63, hence the strict upper bound.
    (number >= i64::MIN as f64 && number < i64::MAX as f64).then(|| number as i64)
}

fn coerce_motion(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(flag) => Some(*flag),
        other => coerce_i64(other).map(|level| level != 0),
    }
}

/// Accepts updates from both producers and applies only the authoritative one.
#[derive(Debug, Clone)]
pub struct IngestArbitrator {
    environment: SharedEnvironment,
    telemetry: EngineTelemetry,
    debug_log: bool,
}

impl IngestArbitrator {
    /// Creates an arbitrator writing into `environment`.
    #[must_use]
    pub fn new(environment: SharedEnvironment, telemetry: EngineTelemetry) -> Self {
        Self {
            environment,
            telemetry,
            debug_log: false,
        }
    }

    /// Enables per-payload debug records (`ingest.applied` / `ingest.ignored`).
    #[must_use]
    pub fn with_debug_log(mut self, enabled: bool) -> Self {
        self.debug_log = enabled;
        self
    }

    /// Shared state this arbitrator writes to.
    #[must_use]
    pub const fn environment(&self) -> &SharedEnvironment {
        &self.environment
    }

    /// Current authoritative source.
    #[must_use]
    pub fn source(&self) -> SourceMode {
        self.environment.source()
    }

    /// Applies `fields` when `origin` is authoritative.
    pub fn submit(&self, origin: SourceMode, fields: &TelemetryFields) -> SubmitOutcome {
        self.submit_at(origin, fields, Instant::now())
    }

    /// Same as [`Self::submit`] with an explicit monotonic timestamp for the flash.
    pub fn submit_at(
        &self,
        origin: SourceMode,
        fields: &TelemetryFields,
        now: Instant,
    ) -> SubmitOutcome {
        let outcome = SubmitOutcome::from(self.environment.merge_from(origin, fields, now));
        if self.debug_log {
            match outcome {
                SubmitOutcome::Applied { motion_armed } => {
                    let _ = self.telemetry.log(
                        LogLevel::Debug,
                        "ingest.applied",
                        json!({ "origin": origin.as_str(), "motion_armed": motion_armed }),
                    );
                }
                SubmitOutcome::Ignored { active } => {
                    let _ = self.telemetry.log(
                        LogLevel::Debug,
                        "ingest.ignored",
                        json!({ "origin": origin.as_str(), "active": active.as_str() }),
                    );
                }
                SubmitOutcome::Empty => {}
            }
        }
        outcome
    }

    /// Parses a JSON value and submits it.
    pub fn submit_json(
        &self,
        origin: SourceMode,
        payload: &Value,
    ) -> Result<SubmitOutcome, IngestError> {
        let fields = parse_fields(payload)?;
        Ok(self.submit(origin, &fields))
    }

    /// Switches the authoritative source. Unknown values leave the mode untouched.
    pub fn set_source(&self, value: &str) -> Result<SourceMode, IngestError> {
        match value.parse::<SourceMode>() {
            Ok(mode) => {
                let previous = self.environment.set_source(mode);
                if previous != mode {
                    let _ = self.telemetry.log(
                        LogLevel::Info,
                        "mode.changed",
                        json!({ "from": previous.as_str(), "to": mode.as_str() }),
                    );
                    let _ = self
                        .telemetry
                        .event("mode.changed", json!({ "mode": mode.as_str() }));
                }
                Ok(mode)
            }
            Err(err) => {
                let _ = self.telemetry.log(
                    LogLevel::Warn,
                    "mode.rejected",
                    json!({ "value": value, "kept": self.source().as_str() }),
                );
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, time::Duration};

    use shared_logging::MemoryLogSink;

    use crate::state::EnvironmentalSnapshot;

    fn arbitrator(source: SourceMode) -> (IngestArbitrator, Arc<MemoryLogSink>) {
        let sink = Arc::new(MemoryLogSink::new(32));
        let telemetry = EngineTelemetry::builder("ingest")
            .sink(sink.clone())
            .build()
            .unwrap();
        (
            IngestArbitrator::new(SharedEnvironment::new(source), telemetry),
            sink,
        )
    }

    #[test]
    fn authoritative_payload_sets_fields_and_arms_flash() {
        let (arb, _) = arbitrator(SourceMode::MessageBus);
        let now = Instant::now();
        let fields = parse_fields(&json!({ "temperature": 30, "motion": 1 })).unwrap();
        let outcome = arb.submit_at(SourceMode::MessageBus, &fields, now);
        assert_eq!(outcome, SubmitOutcome::Applied { motion_armed: true });
        let view = arb.environment().view();
        assert!((view.snapshot.temperature - 30.0).abs() < f64::EPSILON);
        assert!(view.flash_active(now, Duration::from_millis(350)));
    }

    #[test]
    fn same_payload_from_other_origin_changes_nothing() {
        let (arb, _) = arbitrator(SourceMode::MessageBus);
        let fields = parse_fields(&json!({ "temperature": 30, "motion": 1 })).unwrap();
        let outcome = arb.submit(SourceMode::Request, &fields);
        assert!(!outcome.applied());
        let view = arb.environment().view();
        assert_eq!(view.snapshot, EnvironmentalSnapshot::default());
        assert!(view.motion_armed_at.is_none());
    }

    #[test]
    fn coercion_rules() {
        let fields = parse_fields(&json!({
            "temperature": "21.5",
            "light": 1234.9,
            "motion": true,
            "device_id": "esp32-1"
        }))
        .unwrap();
        assert_eq!(fields.temperature, Some(21.5));
        assert_eq!(fields.light, Some(1234));
        assert_eq!(fields.motion, Some(true));
        assert_eq!(fields.humidity, None);
    }

    #[test]
    fn firmware_short_names_are_aliases() {
        let fields = parse_fields(&json!({ "temp": 19.0, "hum": "55" })).unwrap();
        assert_eq!(fields.temperature, Some(19.0));
        assert_eq!(fields.humidity, Some(55.0));
        let both = parse_fields(&json!({ "temperature": 20.0, "temp": 99.0 })).unwrap();
        assert_eq!(both.temperature, Some(20.0));
    }

    #[test]
    fn any_nonzero_motion_level_counts_as_motion() {
        for (raw, expected) in [
            (json!(2), true),
            (json!("1"), true),
            (json!(0.4), false),
            (json!(0), false),
            (json!(false), false),
        ] {
            let fields = parse_fields(&json!({ "motion": raw })).unwrap();
            assert_eq!(fields.motion, Some(expected), "motion {raw}");
        }
    }

    #[test]
    fn non_numeric_motion_is_dropped_silently() {
        let fields = parse_fields(&json!({ "humidity": 40, "motion": "maybe" })).unwrap();
        assert_eq!(fields.motion, None);
        assert_eq!(fields.humidity, Some(40.0));
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        assert!(matches!(
            parse_fields(&json!([1, 2])),
            Err(IngestError::MalformedPayload(_))
        ));
        assert!(matches!(
            parse_fields(&json!({ "temperature": "warm" })),
            Err(IngestError::MalformedPayload(msg)) if msg.contains("temperature")
        ));
        assert!(matches!(
            parse_fields(&json!({ "light": null })),
            Err(IngestError::MalformedPayload(_))
        ));
        assert!(parse_payload(b"{not json").is_err());
        assert!(parse_payload(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn malformed_payload_leaves_state_untouched() {
        let (arb, _) = arbitrator(SourceMode::Request);
        let result = arb.submit_json(SourceMode::Request, &json!({ "humidity": 70, "light": {} }));
        assert!(result.is_err());
        assert_eq!(arb.environment().snapshot(), EnvironmentalSnapshot::default());
    }

    #[test]
    fn unknown_keys_only_is_empty() {
        let (arb, _) = arbitrator(SourceMode::Request);
        let outcome = arb
            .submit_json(SourceMode::Request, &json!({ "battery": 3.7 }))
            .unwrap();
        assert_eq!(outcome, SubmitOutcome::Empty);
    }

    #[test]
    fn set_source_is_idempotent_and_fail_safe() {
        let (arb, sink) = arbitrator(SourceMode::MessageBus);
        assert_eq!(arb.set_source("request").unwrap(), SourceMode::Request);
        assert_eq!(arb.set_source("REQUEST").unwrap(), SourceMode::Request);
        assert_eq!(arb.source(), SourceMode::Request);
        assert_eq!(sink.count("mode.changed"), 1);

        assert!(arb.set_source("bluetooth").is_err());
        assert_eq!(arb.source(), SourceMode::Request);
        assert_eq!(sink.count("mode.rejected"), 1);
    }

    #[test]
    fn debug_log_records_decisions() {
        let (arb, sink) = arbitrator(SourceMode::MessageBus);
        let arb = arb.with_debug_log(true);
        let fields = TelemetryFields {
            light: Some(5),
            ..TelemetryFields::default()
        };
        arb.submit(SourceMode::MessageBus, &fields);
        arb.submit(SourceMode::Request, &fields);
        assert_eq!(sink.count("ingest.applied"), 1);
        assert_eq!(sink.count("ingest.ignored"), 1);
    }
}
