#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rust_2018_idioms,
    missing_docs
)]

//! SmartArt engine: arbitrates sensor telemetry and drives the adaptive display.

/// Telemetry sinks for engine components.
#[path = "../telemetry.rs"]
pub mod telemetry;

/// Installation configuration loaded from TOML.
#[path = "../config.rs"]
pub mod config;

/// Shared environmental state guarded by a single lock.
#[path = "../state.rs"]
pub mod state;

/// Ingest arbitration between the two telemetry producers.
#[path = "../ingest.rs"]
pub mod ingest;

/// Engagement feedback window and rolling average.
#[path = "../feedback.rs"]
pub mod feedback;

/// Epsilon-greedy theme policy.
#[path = "../policy.rs"]
pub mod policy;

/// Render parameter derivation and renderer seam.
#[path = "../render.rs"]
pub mod render;

/// Cooperative render/decision loop.
#[path = "../display.rs"]
pub mod display;

/// Bus, request, and device-command adapters.
#[path = "../transport.rs"]
pub mod transport;

/// Measurement archive for the time-series store.
#[path = "../archive.rs"]
pub mod archive;

pub use archive::{ArchiveError, ArchiveRecorder, MeasurementArchive, MeasurementPoint};
pub use config::InstallationConfig;
pub use display::{
    ControlEvent, DisplayLoop, DisplayLoopBuilder, DisplaySettings, LoopState, TickReport,
};
pub use feedback::{
    EngagementRating, FeedbackAggregator, FeedbackError, FeedbackWindow, MemoryRatingStore,
    RatingStore, SqliteRatingStore,
};
pub use ingest::{IngestArbitrator, IngestError, SubmitOutcome};
pub use policy::{
    EpsilonSchedule, PolicyDecision, PolicyEngine, PolicyMode, PolicyRates, Theme, ThemeCatalog,
    ThemeSelection,
};
pub use render::{HeadlessRenderer, RenderParams, Renderer};
pub use state::{EnvironmentalSnapshot, SharedEnvironment, SourceMode, TelemetryFields};
pub use telemetry::{EngineTelemetry, EngineTelemetryBuilder};
pub use transport::{
    Backoff, BusHandler, BusRouter, BusSupervisor, DeviceCommander, Reply, RequestGateway,
    RouteOutcome, SupervisorStats,
};
