use std::{
    fmt,
    str::FromStr,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::ingest::IngestError;

/// Latest environmental reading shown by the display.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentalSnapshot {
    /// Degrees Celsius.
    pub temperature: f64,
    /// Relative humidity in percent.
    pub humidity: f64,
    /// Raw ambient light reading (0-4095 on the sensor board).
    pub light: i64,
    /// Whether the PIR sensor currently reports motion.
    pub motion: bool,
}

impl Default for EnvironmentalSnapshot {
    fn default() -> Self {
        Self {
            temperature: 25.0,
            humidity: 50.0,
            light: 2000,
            motion: false,
        }
    }
}

/// Producer currently allowed to mutate the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    /// Push transport (broker subscription).
    #[default]
    MessageBus,
    /// Request transport (inbound POST).
    Request,
}

impl SourceMode {
    /// Wire name of the mode.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MessageBus => "message_bus",
            Self::Request => "request",
        }
    }
}

impl fmt::Display for SourceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceMode {
    type Err = IngestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "message_bus" => Ok(Self::MessageBus),
            "request" => Ok(Self::Request),
            _ => Err(IngestError::InvalidMode(value.trim().to_string())),
        }
    }
}

/// Partial telemetry update; `None` means the key was absent from the payload.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TelemetryFields {
    /// Temperature, if supplied.
    pub temperature: Option<f64>,
    /// Humidity, if supplied.
    pub humidity: Option<f64>,
    /// Light level, if supplied.
    pub light: Option<i64>,
    /// Motion flag, if supplied and coercible.
    pub motion: Option<bool>,
}

impl TelemetryFields {
    /// True when no recognised field is present.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.temperature.is_none()
            && self.humidity.is_none()
            && self.light.is_none()
            && self.motion.is_none()
    }

    /// Overwrites only the supplied fields of `snapshot`.
    pub fn merge_into(&self, snapshot: &mut EnvironmentalSnapshot) {
        if let Some(value) = self.temperature {
            snapshot.temperature = value;
        }
        if let Some(value) = self.humidity {
            snapshot.humidity = value;
        }
        if let Some(value) = self.light {
            snapshot.light = value;
        }
        if let Some(value) = self.motion {
            snapshot.motion = value;
        }
    }
}

/// Result of a guarded merge attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeResult {
    /// Fields were merged; `motion_armed` reports whether the flash was re-armed.
    Applied {
        /// Flash timestamp was refreshed.
        motion_armed: bool,
    },
    /// The origin is not authoritative.
    Ignored {
        /// Mode that was authoritative at the time.
        active: SourceMode,
    },
    /// The origin is authoritative but nothing recognised was supplied.
    Empty,
}

/// Consistent copy of everything the render loop reads in one lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnvironmentView {
    /// Copied snapshot.
    pub snapshot: EnvironmentalSnapshot,
    /// Authoritative source at copy time.
    pub source: SourceMode,
    /// When motion last armed the flash.
    pub motion_armed_at: Option<Instant>,
}

impl EnvironmentView {
    /// Whether the motion overlay should be drawn at `now`.
    #[must_use]
    pub fn flash_active(&self, now: Instant, flash: Duration) -> bool {
        self.motion_armed_at
            .is_some_and(|armed| now.saturating_duration_since(armed) < flash)
    }
}

#[derive(Debug, Default)]
struct EnvironmentInner {
    snapshot: EnvironmentalSnapshot,
    source: SourceMode,
    motion_armed_at: Option<Instant>,
}

/// Snapshot and source mode behind one exclusive lock. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct SharedEnvironment {
    inner: Arc<Mutex<EnvironmentInner>>,
}

impl SharedEnvironment {
    /// Creates state with default readings and the given authoritative source.
    #[must_use]
    pub fn new(source: SourceMode) -> Self {
        Self {
            inner: Arc::new(Mutex::new(EnvironmentInner {
                source,
                ..EnvironmentInner::default()
            })),
        }
    }

    /// Copy of the current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> EnvironmentalSnapshot {
        self.inner.lock().snapshot
    }

    /// Current authoritative source.
    #[must_use]
    pub fn source(&self) -> SourceMode {
        self.inner.lock().source
    }

    /// Copies snapshot, source, and flash timestamp together.
    #[must_use]
    pub fn view(&self) -> EnvironmentView {
        let inner = self.inner.lock();
        EnvironmentView {
            snapshot: inner.snapshot,
            source: inner.source,
            motion_armed_at: inner.motion_armed_at,
        }
    }

    /// Replaces the authoritative source, returning the previous one.
    pub fn set_source(&self, mode: SourceMode) -> SourceMode {
        std::mem::replace(&mut self.inner.lock().source, mode)
    }

    /// Merges `fields` iff `origin` is authoritative. The source check and the
    /// merge happen under the same lock acquisition; `now` is captured by the caller.
    pub fn merge_from(
        &self,
        origin: SourceMode,
        fields: &TelemetryFields,
        now: Instant,
    ) -> MergeResult {
        let mut inner = self.inner.lock();
        if inner.source != origin {
            return MergeResult::Ignored {
                active: inner.source,
            };
        }
        if fields.is_empty() {
            return MergeResult::Empty;
        }
        fields.merge_into(&mut inner.snapshot);
        let motion_armed = inner.snapshot.motion;
        if motion_armed {
            inner.motion_armed_at = Some(now);
        }
        MergeResult::Applied { motion_armed }
    }
}
