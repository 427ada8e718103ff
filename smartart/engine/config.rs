use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::{
    display::DisplaySettings,
    policy::{EpsilonSchedule, PolicyEngine, PolicyRates, Theme, ThemeCatalog},
    state::SourceMode,
    transport::Backoff,
};

/// Whole-installation configuration. Every field has a default, so an empty
/// file is a valid configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InstallationConfig {
    /// Message bus topics and reconnect policy.
    pub bus: BusSection,
    /// Ingest arbitration.
    pub ingest: IngestSection,
    /// Feedback store access.
    pub feedback: FeedbackSection,
    /// Theme policy.
    pub policy: PolicySection,
    /// Render loop.
    pub display: DisplaySection,
    /// Measurement archive.
    pub archive: ArchiveSection,
    /// Structured log output.
    pub telemetry: TelemetrySection,
    /// Theme catalog, in order.
    pub themes: Vec<Theme>,
}

impl Default for InstallationConfig {
    fn default() -> Self {
        Self {
            bus: BusSection::default(),
            ingest: IngestSection::default(),
            feedback: FeedbackSection::default(),
            policy: PolicySection::default(),
            display: DisplaySection::default(),
            archive: ArchiveSection::default(),
            telemetry: TelemetrySection::default(),
            themes: ThemeCatalog::default().themes().to_vec(),
        }
    }
}

/// `[bus]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusSection {
    /// Sensor telemetry topic.
    pub data_topic: String,
    /// Source mode control topic.
    pub mode_topic: String,
    /// Board sampling rate command topic.
    pub sampling_rate_topic: String,
    /// Board motion alert command topic.
    pub motion_alert_topic: String,
    /// First reconnect delay.
    pub reconnect_min_ms: u64,
    /// Reconnect delay ceiling.
    pub reconnect_max_ms: u64,
    /// In-process bus capacity.
    pub capacity: usize,
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            data_topic: "smartart/sensordata".into(),
            mode_topic: "smartart/cmd/mode".into(),
            sampling_rate_topic: "smartart/cmd/sampling_rate".into(),
            motion_alert_topic: "smartart/cmd/motion_alert".into(),
            reconnect_min_ms: 1_000,
            reconnect_max_ms: 5_000,
            capacity: 256,
        }
    }
}

/// `[ingest]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestSection {
    /// Authoritative source at startup.
    pub initial_source: String,
    /// Per-payload debug records.
    pub debug_log: bool,
}

impl Default for IngestSection {
    fn default() -> Self {
        Self {
            initial_source: SourceMode::MessageBus.as_str().into(),
            debug_log: false,
        }
    }
}

/// `[feedback]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedbackSection {
    /// SQLite database written by the feedback bot.
    pub db_path: PathBuf,
    /// Rolling window size.
    pub window: usize,
    /// Feedback logging cadence; 0 logs every frame.
    pub log_every_secs: f64,
    /// Longest a read may wait on a locked database.
    pub read_budget_ms: u64,
}

impl Default for FeedbackSection {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("storage/feedback.db"),
            window: 20,
            log_every_secs: 2.0,
            read_budget_ms: 50,
        }
    }
}

/// `[policy]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicySection {
    /// Engagement threshold on the 0-5 scale.
    pub threshold: f64,
    /// Epsilon below threshold.
    pub explore_rate: f64,
    /// Epsilon at or above threshold.
    pub exploit_rate: f64,
    /// Epsilon without ratings.
    pub neutral_rate: f64,
    /// Policy cadence in seconds.
    pub check_every_secs: f64,
    /// Per-channel colour jitter.
    pub jitter: u8,
    /// Rate schedule.
    pub schedule: EpsilonSchedule,
}

impl Default for PolicySection {
    fn default() -> Self {
        let rates = PolicyRates::default();
        Self {
            threshold: 3.0,
            explore_rate: rates.explore,
            exploit_rate: rates.exploit,
            neutral_rate: rates.neutral,
            check_every_secs: 2.0,
            jitter: 12,
            schedule: EpsilonSchedule::Stepped,
        }
    }
}

/// `[display]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DisplaySection {
    /// Target frame rate.
    pub fps: u32,
    /// Motion overlay duration.
    pub flash_ms: u64,
    /// Canvas width.
    pub width: u32,
    /// Canvas height.
    pub height: u32,
    /// Headless frame log interval; 0 disables it.
    pub frame_log_every: u64,
}

impl Default for DisplaySection {
    fn default() -> Self {
        Self {
            fps: 60,
            flash_ms: 350,
            width: 1000,
            height: 700,
            frame_log_every: 0,
        }
    }
}

/// `[archive]`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ArchiveSection {
    /// JSON-lines archive; absent disables archiving.
    pub path: Option<PathBuf>,
}

/// `[telemetry]`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TelemetrySection {
    /// JSON-lines log file; absent logs through `tracing` only.
    pub log_path: Option<PathBuf>,
}

impl InstallationConfig {
    /// Loads configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading installation config {}", path.display()))?;
        let base = path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        Self::parse(&raw, &base).with_context(|| format!("parsing {}", path.display()))
    }

    /// Parses TOML, resolving relative paths against `base`.
    pub fn parse(raw: &str, base: &Path) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.resolve_paths(base);
        config.validate()?;
        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |candidate: &mut PathBuf| {
            if candidate.is_relative() {
                *candidate = base.join(&*candidate);
            }
        };
        resolve(&mut self.feedback.db_path);
        if let Some(path) = self.archive.path.as_mut() {
            resolve(path);
        }
        if let Some(path) = self.telemetry.log_path.as_mut() {
            resolve(path);
        }
    }

    /// Checks ranges and cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        let policy = &self.policy;
        for (name, rate) in [
            ("explore_rate", policy.explore_rate),
            ("exploit_rate", policy.exploit_rate),
            ("neutral_rate", policy.neutral_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                bail!("policy.{name} must lie in [0, 1], got {rate}");
            }
        }
        if !policy.threshold.is_finite() {
            bail!("policy.threshold must be finite");
        }
        for (name, secs) in [
            ("policy.check_every_secs", policy.check_every_secs),
            ("feedback.log_every_secs", self.feedback.log_every_secs),
        ] {
            if Duration::try_from_secs_f64(secs).is_err() {
                bail!("{name} must be a non-negative number of seconds, got {secs}");
            }
        }
        if self.feedback.window == 0 {
            bail!("feedback.window must be greater than zero");
        }
        if self.display.fps == 0 {
            bail!("display.fps must be greater than zero");
        }
        if self.bus.reconnect_min_ms > self.bus.reconnect_max_ms {
            bail!(
                "bus.reconnect_min_ms ({}) exceeds bus.reconnect_max_ms ({})",
                self.bus.reconnect_min_ms,
                self.bus.reconnect_max_ms
            );
        }
        if self.themes.is_empty() {
            bail!("at least one [[themes]] entry is required");
        }
        self.initial_source()?;
        Ok(())
    }

    /// Authoritative source at startup.
    pub fn initial_source(&self) -> Result<SourceMode> {
        self.ingest
            .initial_source
            .parse()
            .context("invalid ingest.initial_source")
    }

    /// Policy engine configured from `[policy]`.
    #[must_use]
    pub fn policy_engine(&self) -> PolicyEngine {
        PolicyEngine::new(
            PolicyRates {
                explore: self.policy.explore_rate,
                exploit: self.policy.exploit_rate,
                neutral: self.policy.neutral_rate,
            },
            self.policy.schedule,
            self.policy.jitter,
        )
    }

    /// Theme catalog from `[[themes]]`.
    pub fn catalog(&self) -> Result<ThemeCatalog> {
        ThemeCatalog::try_new(self.themes.clone())
    }

    /// Loop settings combining `[display]`, `[feedback]` and `[policy]`.
    #[must_use]
    pub fn display_settings(&self) -> DisplaySettings {
        DisplaySettings {
            fps: self.display.fps,
            flash: Duration::from_millis(self.display.flash_ms),
            feedback_every: Duration::from_secs_f64(self.feedback.log_every_secs),
            policy_every: Duration::from_secs_f64(self.policy.check_every_secs),
            window: self.feedback.window,
            threshold: self.policy.threshold,
        }
    }

    /// Reconnect backoff for bus supervisors.
    #[must_use]
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.bus.reconnect_min_ms),
            Duration::from_millis(self.bus.reconnect_max_ms),
        )
    }

    /// Read budget for the feedback store.
    #[must_use]
    pub const fn feedback_budget(&self) -> Duration {
        Duration::from_millis(self.feedback.read_budget_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn empty_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("installation.toml");
        fs::write(&path, "").unwrap();
        let config = InstallationConfig::load(&path).unwrap();
        assert_eq!(config.bus.data_topic, "smartart/sensordata");
        assert_eq!(config.initial_source().unwrap(), SourceMode::MessageBus);
        assert_eq!(config.catalog().unwrap().len(), 5);
        assert_eq!(config.feedback.db_path, dir.path().join("storage/feedback.db"));
        let settings = config.display_settings();
        assert_eq!(settings.fps, 60);
        assert_eq!(settings.flash, Duration::from_millis(350));
        assert_eq!(settings.policy_every, Duration::from_secs(2));
        assert_eq!(
            config.backoff(),
            Backoff::new(Duration::from_secs(1), Duration::from_secs(5))
        );
    }

    #[test]
    fn sections_override_defaults() {
        let raw = r#"
            [ingest]
            initial_source = "Request"

            [policy]
            threshold = 3.5
            schedule = "graded"
            jitter = 0

            [feedback]
            db_path = "/var/lib/smartart/feedback.db"
            log_every_secs = 0.0

            [archive]
            path = "archive/points.jsonl"

            [[themes]]
            background = [1, 2, 3]
            primary = [4, 5, 6]
            secondary = [7, 8, 9]
        "#;
        let base = Path::new("/etc/smartart");
        let config = InstallationConfig::parse(raw, base).unwrap();
        assert_eq!(config.initial_source().unwrap(), SourceMode::Request);
        assert_eq!(config.policy_engine().schedule(), EpsilonSchedule::Graded);
        assert_eq!(config.catalog().unwrap().first().background, [1, 2, 3]);
        assert_eq!(config.feedback.db_path, PathBuf::from("/var/lib/smartart/feedback.db"));
        assert_eq!(
            config.archive.path.as_deref(),
            Some(Path::new("/etc/smartart/archive/points.jsonl"))
        );
        assert_eq!(config.display_settings().feedback_every, Duration::ZERO);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let base = Path::new(".");
        for raw in [
            "[policy]\nexplore_rate = 1.5",
            "[feedback]\nwindow = 0",
            "[display]\nfps = 0",
            "[policy]\ncheck_every_secs = 1e20",
            "[feedback]\nlog_every_secs = -1.0",
            "[bus]\nreconnect_min_ms = 9000",
            "[ingest]\ninitial_source = \"mqtt\"",
            "themes = []",
        ] {
            assert!(InstallationConfig::parse(raw, base).is_err(), "accepted {raw}");
        }
    }
}
