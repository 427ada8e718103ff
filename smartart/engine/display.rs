use std::time::{Duration, Instant};

use anyhow::Result;
use rand::{rngs::SmallRng, SeedableRng};
use serde_json::json;
use shared_logging::LogLevel;
use tokio::{
    sync::{mpsc, watch},
    time::MissedTickBehavior,
};

use crate::{
    feedback::{FeedbackAggregator, FeedbackWindow},
    policy::{PolicyDecision, PolicyEngine, Theme, ThemeCatalog, ThemeSelection},
    render::{derive_params, Renderer},
    state::SharedEnvironment,
    telemetry::EngineTelemetry,
};

/// External control event consumed by the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    /// Stop the loop and tear down producers.
    Quit,
}

/// Loop lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Rendering frames.
    Running,
    /// Terminal.
    Stopped,
}

/// Loop timing and policy inputs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisplaySettings {
    /// Target frame rate.
    pub fps: u32,
    /// How long a motion event keeps the overlay visible.
    pub flash: Duration,
    /// Feedback logging cadence; zero means every frame.
    pub feedback_every: Duration,
    /// Policy evaluation cadence; zero means every frame.
    pub policy_every: Duration,
    /// Rolling window size.
    pub window: usize,
    /// Engagement threshold.
    pub threshold: f64,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            fps: 60,
            flash: Duration::from_millis(350),
            feedback_every: Duration::from_secs(2),
            policy_every: Duration::from_secs(2),
            window: 20,
            threshold: 3.0,
        }
    }
}

impl DisplaySettings {
    /// Frame period derived from `fps`.
    #[must_use]
    pub fn frame_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.fps.max(1)))
    }
}

#[derive(Debug, Clone, Copy)]
struct Cadence {
    every: Duration,
    last: Option<Instant>,
}

impl Cadence {
    const fn new(every: Duration) -> Self {
        Self { every, last: None }
    }

    fn due(&self, now: Instant) -> bool {
        match self.last {
            Some(last) => now.saturating_duration_since(last) >= self.every,
            None => true,
        }
    }

    fn mark(&mut self, now: Instant) {
        self.last = Some(now);
    }
}

/// What happened during one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    /// Frame number.
    pub frame: u64,
    /// Feedback read this tick, if any.
    pub feedback: Option<FeedbackWindow>,
    /// Policy outcome this tick, if the cadence fired.
    pub policy: Option<(PolicyDecision, ThemeSelection)>,
    /// Motion overlay requested.
    pub overlay: bool,
}

/// Builder for [`DisplayLoop`].
pub struct DisplayLoopBuilder {
    environment: SharedEnvironment,
    feedback: FeedbackAggregator,
    renderer: Box<dyn Renderer>,
    telemetry: EngineTelemetry,
    catalog: ThemeCatalog,
    policy: PolicyEngine,
    settings: DisplaySettings,
    seed: Option<u64>,
}

impl DisplayLoopBuilder {
    /// Starts a builder with default policy, catalog and settings.
    #[must_use]
    pub fn new(
        environment: SharedEnvironment,
        feedback: FeedbackAggregator,
        renderer: Box<dyn Renderer>,
    ) -> Self {
        Self {
            environment,
            feedback,
            renderer,
            telemetry: EngineTelemetry::disabled("display"),
            catalog: ThemeCatalog::default(),
            policy: PolicyEngine::default(),
            settings: DisplaySettings::default(),
            seed: None,
        }
    }

    /// Sets telemetry.
    #[must_use]
    pub fn telemetry(mut self, telemetry: EngineTelemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Sets the theme catalog.
    #[must_use]
    pub fn catalog(mut self, catalog: ThemeCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Sets the policy engine.
    #[must_use]
    pub fn policy(mut self, policy: PolicyEngine) -> Self {
        self.policy = policy;
        self
    }

    /// Sets timing.
    #[must_use]
    pub fn settings(mut self, settings: DisplaySettings) -> Self {
        self.settings = settings;
        self
    }

    /// Seeds the policy RNG for reproducible runs.
    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Builds the loop.
    #[must_use]
    pub fn build(self) -> DisplayLoop {
        let rng = self
            .seed
            .map_or_else(SmallRng::from_entropy, SmallRng::seed_from_u64);
        let (controls_tx, controls_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        DisplayLoop {
            feedback_cadence: Cadence::new(self.settings.feedback_every),
            policy_cadence: Cadence::new(self.settings.policy_every),
            environment: self.environment,
            feedback: self.feedback,
            renderer: self.renderer,
            telemetry: self.telemetry,
            catalog: self.catalog,
            policy: self.policy,
            settings: self.settings,
            rng,
            state: LoopState::Running,
            frame: 0,
            base: None,
            rendered: None,
            controls_tx,
            controls_rx,
            shutdown,
        }
    }
}

/// Single-threaded cooperative render/decision loop.
pub struct DisplayLoop {
    environment: SharedEnvironment,
    feedback: FeedbackAggregator,
    renderer: Box<dyn Renderer>,
    telemetry: EngineTelemetry,
    catalog: ThemeCatalog,
    policy: PolicyEngine,
    settings: DisplaySettings,
    rng: SmallRng,
    state: LoopState,
    frame: u64,
    base: Option<Theme>,
    rendered: Option<Theme>,
    feedback_cadence: Cadence,
    policy_cadence: Cadence,
    controls_tx: mpsc::UnboundedSender<ControlEvent>,
    controls_rx: mpsc::UnboundedReceiver<ControlEvent>,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for DisplayLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisplayLoop")
            .field("state", &self.state)
            .field("frame", &self.frame)
            .field("base", &self.base)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl DisplayLoop {
    /// Returns a builder.
    #[must_use]
    pub fn builder(
        environment: SharedEnvironment,
        feedback: FeedbackAggregator,
        renderer: Box<dyn Renderer>,
    ) -> DisplayLoopBuilder {
        DisplayLoopBuilder::new(environment, feedback, renderer)
    }

    /// Sender for control events; usable from any task.
    #[must_use]
    pub fn controls(&self) -> mpsc::UnboundedSender<ControlEvent> {
        self.controls_tx.clone()
    }

    /// Flips to `true` once the loop stops.
    #[must_use]
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> LoopState {
        self.state
    }

    /// Frames rendered.
    #[must_use]
    pub const fn frame(&self) -> u64 {
        self.frame
    }

    /// Current base theme, before jitter.
    #[must_use]
    pub const fn current_base(&self) -> Option<Theme> {
        self.base
    }

    /// Theme used for the last rendered frame.
    #[must_use]
    pub const fn current_theme(&self) -> Option<Theme> {
        self.rendered
    }

    /// Runs one frame at `now`; `None` once the loop has stopped.
    pub fn tick(&mut self, now: Instant) -> Result<Option<TickReport>> {
        if self.state == LoopState::Stopped {
            return Ok(None);
        }
        while let Ok(event) = self.controls_rx.try_recv() {
            match event {
                ControlEvent::Quit => {
                    self.stop("quit");
                    return Ok(None);
                }
            }
        }

        let mut feedback = None;
        if self.feedback_cadence.due(now) {
            self.feedback_cadence.mark(now);
            let window = self.feedback.recent_ratings(self.settings.window);
            self.log_feedback(&window);
            feedback = Some(window);
        }

        let mut policy = None;
        if self.policy_cadence.due(now) || self.base.is_none() {
            self.policy_cadence.mark(now);
            let window = match feedback.as_ref() {
                Some(window) => window.clone(),
                None => self.feedback.recent_ratings(self.settings.window),
            };
            policy = Some(self.run_policy(&window));
            if feedback.is_none() {
                feedback = Some(window);
            }
        }

        let view = self.environment.view();
        let overlay = view.flash_active(now, self.settings.flash);
        let theme = self.rendered.unwrap_or_else(|| self.catalog.first());
        let params = derive_params(
            self.frame,
            &view.snapshot,
            view.source,
            &theme,
            self.settings.threshold,
            overlay,
        );
        self.renderer.render(&params)?;
        let report = TickReport {
            frame: self.frame,
            feedback,
            policy,
            overlay,
        };
        self.frame += 1;
        Ok(Some(report))
    }

    /// Ticks at the configured frame rate until a quit event arrives.
    pub async fn run(&mut self) -> Result<u64> {
        let mut interval = tokio::time::interval(self.settings.frame_period());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        while self.state == LoopState::Running {
            interval.tick().await;
            if let Err(err) = self.tick(Instant::now()) {
                self.stop("render_error");
                return Err(err);
            }
        }
        Ok(self.frame)
    }

    fn run_policy(&mut self, window: &FeedbackWindow) -> (PolicyDecision, ThemeSelection) {
        let decision = self.policy.evaluate(window.average, self.settings.threshold);
        let selection = self.policy.select_theme(
            self.base.as_ref(),
            decision.epsilon,
            &self.catalog,
            &mut self.rng,
        );
        self.base = Some(selection.base);
        self.rendered = Some(selection.rendered);
        let metadata = json!({
            "average": window.average,
            "samples": window.ratings.len(),
            "epsilon": decision.epsilon,
            "mode": decision.mode,
            "changed": selection.changed,
            "redraws": selection.redraws,
            "theme": selection.rendered,
        });
        let _ = self.telemetry.log(LogLevel::Info, "policy.cycle", metadata.clone());
        let _ = self.telemetry.event("policy.cycle", metadata);
        (decision, selection)
    }

    fn log_feedback(&self, window: &FeedbackWindow) {
        match &window.error {
            Some(error) => {
                let _ = self.telemetry.log(
                    LogLevel::Warn,
                    "feedback.unavailable",
                    json!({ "error": error }),
                );
            }
            None => {
                let _ = self.telemetry.log(
                    LogLevel::Info,
                    "feedback.window",
                    json!({
                        "samples": window.ratings.len(),
                        "average": window.average,
                        "ratings": window.ratings,
                    }),
                );
            }
        }
    }

    fn stop(&mut self, reason: &str) {
        if self.state == LoopState::Stopped {
            return;
        }
        self.state = LoopState::Stopped;
        self.shutdown.send_replace(true);
        let _ = self.telemetry.log(
            LogLevel::Info,
            "display.stopped",
            json!({ "reason": reason, "frames": self.frame }),
        );
    }
}
