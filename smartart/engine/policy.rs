use std::fmt;

use anyhow::{bail, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Redraw attempts before a repeated base theme is accepted.
pub const MAX_REDRAWS: u32 = 5;

/// RGB triple.
pub type Rgb = [u8; 3];

/// Display theme: background plus the wave and ring accents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Theme {
    /// Background colour.
    pub background: Rgb,
    /// Wave colour.
    pub primary: Rgb,
    /// Ring colour.
    pub secondary: Rgb,
}

impl Theme {
    /// Builds a theme from three triples.
    #[must_use]
    pub const fn new(background: Rgb, primary: Rgb, secondary: Rgb) -> Self {
        Self {
            background,
            primary,
            secondary,
        }
    }

    /// Perturbs every channel by at most `amount`, clamped to 0..=255.
    #[must_use]
    pub fn jittered<R: Rng + ?Sized>(&self, amount: u8, rng: &mut R) -> Self {
        if amount == 0 {
            return *self;
        }
        let mut shift = |rgb: Rgb| -> Rgb {
            rgb.map(|channel| {
                let delta = rng.gen_range(-i16::from(amount)..=i16::from(amount));
                clamp_channel(i16::from(channel) + delta)
            })
        };
        Self {
            background: shift(self.background),
            primary: shift(self.primary),
            secondary: shift(self.secondary),
        }
    }
}

#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
fn clamp_channel(value: i16) -> u8 {
    value.clamp(0, 255) as u8
}

const DEFAULT_THEMES: [Theme; 5] = [
    Theme::new([18, 18, 40], [30, 200, 150], [140, 90, 255]),
    Theme::new([10, 28, 25], [220, 120, 60], [30, 200, 240]),
    Theme::new([24, 10, 18], [255, 80, 140], [255, 210, 90]),
    Theme::new([8, 16, 32], [120, 220, 180], [90, 150, 255]),
    Theme::new([28, 12, 40], [90, 220, 255], [255, 120, 100]),
];

/// Ordered, non-empty list of themes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThemeCatalog {
    themes: Vec<Theme>,
}

impl Default for ThemeCatalog {
    fn default() -> Self {
        Self {
            themes: DEFAULT_THEMES.to_vec(),
        }
    }
}

impl ThemeCatalog {
    /// Validates and wraps a catalog.
    pub fn try_new(themes: Vec<Theme>) -> Result<Self> {
        if themes.is_empty() {
            bail!("theme catalog must contain at least one theme");
        }
        Ok(Self { themes })
    }

    /// Number of themes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.themes.len()
    }

    /// True only for an unvalidated catalog.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.themes.is_empty()
    }

    /// All themes in catalog order.
    #[must_use]
    pub fn themes(&self) -> &[Theme] {
        &self.themes
    }

    /// First theme; used before any policy cycle has run.
    #[must_use]
    pub fn first(&self) -> Theme {
        self.themes[0]
    }

    /// Uniform draw.
    pub fn pick<R: Rng + ?Sized>(&self, rng: &mut R) -> Theme {
        self.themes[rng.gen_range(0..self.themes.len())]
    }
}

/// Policy stance derived each cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PolicyMode {
    /// Engagement below threshold: vary more.
    Explore,
    /// Engagement at or above threshold: keep the favourite.
    Exploit,
    /// No ratings available.
    Neutral,
}

impl fmt::Display for PolicyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Explore => "EXPLORE",
            Self::Exploit => "EXPLOIT",
            Self::Neutral => "NEUTRAL",
        })
    }
}

/// How the average maps onto epsilon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpsilonSchedule {
    /// Two rates split at the threshold.
    #[default]
    Stepped,
    /// Four tiers around the threshold.
    Graded,
}

/// Configured exploration rates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolicyRates {
    /// Epsilon below threshold.
    pub explore: f64,
    /// Epsilon at or above threshold.
    pub exploit: f64,
    /// Epsilon without ratings.
    pub neutral: f64,
}

impl Default for PolicyRates {
    fn default() -> Self {
        Self {
            explore: 0.5,
            exploit: 0.1,
            neutral: 0.2,
        }
    }
}

/// Output of [`PolicyEngine::evaluate`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolicyDecision {
    /// Probability of a random redraw this cycle.
    pub epsilon: f64,
    /// Derived stance.
    pub mode: PolicyMode,
}

/// Output of [`PolicyEngine::select_theme`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThemeSelection {
    /// Un-jittered catalog entry; becomes `current` next cycle.
    pub base: Theme,
    /// Jittered theme handed to the renderer.
    pub rendered: Theme,
    /// Base differs from the previous base.
    pub changed: bool,
    /// Redraws spent avoiding a repeat.
    pub redraws: u32,
}

/// Epsilon-greedy theme policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolicyEngine {
    rates: PolicyRates,
    schedule: EpsilonSchedule,
    jitter: u8,
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new(PolicyRates::default(), EpsilonSchedule::Stepped, 12)
    }
}

impl PolicyEngine {
    /// Creates an engine.
    #[must_use]
    pub const fn new(rates: PolicyRates, schedule: EpsilonSchedule, jitter: u8) -> Self {
        Self {
            rates,
            schedule,
            jitter,
        }
    }

    /// Configured schedule.
    #[must_use]
    pub const fn schedule(&self) -> EpsilonSchedule {
        self.schedule
    }

    /// Maps the rolling average onto epsilon and a mode.
    #[must_use]
    pub fn evaluate(&self, average: Option<f64>, threshold: f64) -> PolicyDecision {
        let Some(avg) = average else {
            return PolicyDecision {
                epsilon: self.rates.neutral,
                mode: PolicyMode::Neutral,
            };
        };
        let mode = if avg < threshold {
            PolicyMode::Explore
        } else {
            PolicyMode::Exploit
        };
        let epsilon = match (self.schedule, mode) {
            (EpsilonSchedule::Stepped, PolicyMode::Explore) => self.rates.explore,
            (EpsilonSchedule::Stepped, _) => self.rates.exploit,
            (EpsilonSchedule::Graded, _) => {
                if avg >= threshold + 0.5 {
                    0.1
                } else if avg >= threshold {
                    0.2
                } else if avg >= threshold - 0.5 {
                    0.3
                } else {
                    0.5
                }
            }
        };
        PolicyDecision { epsilon, mode }
    }

    /// Epsilon-greedy pick with bounded repeat avoidance, then jitter.
    pub fn select_theme<R: Rng + ?Sized>(
        &self,
        current: Option<&Theme>,
        epsilon: f64,
        catalog: &ThemeCatalog,
        rng: &mut R,
    ) -> ThemeSelection {
        let explore = current.is_none() || rng.gen::<f64>() < epsilon;
        let mut redraws = 0;
        let base = match current {
            Some(&previous) if !explore => previous,
            _ => {
                let mut pick = catalog.pick(rng);
                while current == Some(&pick) && redraws < MAX_REDRAWS {
                    pick = catalog.pick(rng);
                    redraws += 1;
                }
                pick
            }
        };
        ThemeSelection {
            base,
            rendered: base.jittered(self.jitter, rng),
            changed: current != Some(&base),
            redraws,
        }
    }
}
