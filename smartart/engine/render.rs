use anyhow::Result;
use serde::Serialize;
use serde_json::json;
use shared_logging::LogLevel;

use crate::{
    policy::{Rgb, Theme},
    state::{EnvironmentalSnapshot, SourceMode},
    telemetry::EngineTelemetry,
};

/// Upper bound of the light sensor's ADC range.
pub const LIGHT_MAX: f64 = 4095.0;
/// Translucent white drawn while the motion flash is active.
pub const FLASH_OVERLAY: [u8; 4] = [255, 255, 255, 120];

const THEME_WEIGHT: f64 = 0.65;
const AMBIENT_WEIGHT: f64 = 0.35;

/// One concentric ring.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Ring {
    /// Radius in pixels.
    pub radius: f64,
    /// Stroke colour.
    pub color: Rgb,
}

/// Everything the rendering collaborator needs for one frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderParams {
    /// Frame counter driving the animation phase.
    pub frame: u64,
    /// Background after blending theme and ambient light.
    pub background: Rgb,
    /// Concentric rings, driven by temperature.
    pub rings: Vec<Ring>,
    /// Wave amplitude in pixels, driven by humidity.
    pub wave_amplitude: i64,
    /// Wave stroke colour.
    pub wave_color: Rgb,
    /// RGBA overlay while the motion flash is active.
    pub overlay: Option<[u8; 4]>,
    /// Status line.
    pub hud: String,
}

fn clamp(value: f64, lo: f64, hi: f64) -> f64 {
    value.max(lo).min(hi)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn clamp8(value: f64) -> u8 {
    clamp(value, 0.0, 255.0) as u8
}

#[allow(clippy::cast_precision_loss)]
fn light_norm(light: i64) -> f64 {
    clamp(light as f64 / LIGHT_MAX, 0.0, 1.0)
}

/// Status line shown in the corner of the display.
#[must_use]
pub fn hud_line(snapshot: &EnvironmentalSnapshot, source: SourceMode, threshold: f64) -> String {
    format!(
        "T={:.1}C H={:.1}% L={} M={} | Source:{} | TH={threshold:.1}",
        snapshot.temperature,
        snapshot.humidity,
        snapshot.light,
        if snapshot.motion { "YES" } else { "NO" },
        source.as_str().to_ascii_uppercase(),
    )
}

/// Derives frame parameters; pure in its inputs.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]
pub fn derive_params(
    frame: u64,
    snapshot: &EnvironmentalSnapshot,
    source: SourceMode,
    theme: &Theme,
    threshold: f64,
    flash: bool,
) -> RenderParams {
    let level = light_norm(snapshot.light);
    let ambient = [level * 85.0, level * 128.0, level * 255.0];
    let mut background = [0u8; 3];
    for (channel, out) in background.iter_mut().enumerate() {
        *out = clamp8(
            f64::from(theme.background[channel]) * THEME_WEIGHT + ambient[channel] * AMBIENT_WEIGHT,
        );
    }

    let count = clamp(3.0 + (snapshot.temperature - 15.0) / 5.0, 1.0, 10.0) as usize;
    let phase = frame as f64 / 30.0;
    let rings = (0..count)
        .map(|i| {
            let step = i as f64;
            let [r, g, b] = theme.secondary;
            Ring {
                radius: 40.0 + step * 26.0 + 12.0 * (phase + step * 0.6).sin(),
                color: [
                    clamp8(f64::from(r) + step * 8.0),
                    clamp8(f64::from(g) + step * 6.0),
                    clamp8(f64::from(b) - step * 6.0),
                ],
            }
        })
        .collect();

    RenderParams {
        frame,
        background,
        rings,
        wave_amplitude: (8.0 + snapshot.humidity / 3.0) as i64,
        wave_color: theme.primary,
        overlay: flash.then_some(FLASH_OVERLAY),
        hud: hud_line(snapshot, source, threshold),
    }
}

/// Rendering collaborator. Must not block beyond drawing one frame.
pub trait Renderer: Send {
    /// Draws one frame.
    fn render(&mut self, params: &RenderParams) -> Result<()>;
}

/// Renderer for unattended runs without a display.
#[derive(Debug)]
pub struct HeadlessRenderer {
    frames: u64,
    log_every: u64,
    last: Option<RenderParams>,
    telemetry: EngineTelemetry,
}

impl HeadlessRenderer {
    /// Logs `display.frame` every `log_every` frames; 0 disables it.
    #[must_use]
    pub fn new(log_every: u64, telemetry: EngineTelemetry) -> Self {
        Self {
            frames: 0,
            log_every,
            last: None,
            telemetry,
        }
    }

    /// Frames rendered so far.
    #[must_use]
    pub const fn frames(&self) -> u64 {
        self.frames
    }

    /// Most recent frame.
    #[must_use]
    pub const fn last(&self) -> Option<&RenderParams> {
        self.last.as_ref()
    }
}

impl Renderer for HeadlessRenderer {
    fn render(&mut self, params: &RenderParams) -> Result<()> {
        self.frames += 1;
        if self.log_every > 0 && self.frames % self.log_every == 0 {
            let _ = self.telemetry.log(
                LogLevel::Info,
                "display.frame",
                json!({
                    "frame": params.frame,
                    "rings": params.rings.len(),
                    "background": params.background,
                    "overlay": params.overlay.is_some(),
                    "hud": params.hud,
                }),
            );
        }
        self.last = Some(params.clone());
        Ok(())
    }
}
