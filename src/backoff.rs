//! Randomized exponential backoff for failed radio sessions.
//!
//! ```text
//!   fail ──▶ delay = uniform(min, ceiling) ──▶ ceiling = min(2·ceiling, max)
//!   success ──▶ ceiling = initial
//! ```
//!
//! The ceiling is the only state. The controller owns a [`Backoff`]
//! and arms its retry timer with the returned delay.

use std::time::Duration;

use log::info;

use crate::config::AuthTimeoutConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    ceiling_secs: u32,
}

impl Backoff {
    pub fn new(initial_secs: u32) -> Self {
        Self {
            ceiling_secs: initial_secs,
        }
    }

    pub fn ceiling_secs(&self) -> u32 {
        self.ceiling_secs
    }

    /// Called on every successful `Connected` transition.
    pub fn reset(&mut self, initial_secs: u32) {
        self.ceiling_secs = initial_secs;
    }

    /// Draw the next retry delay from `sample`, then double the ceiling
    /// (capped at `max_secs`).
    pub fn next_delay(
        &mut self,
        cfg: &AuthTimeoutConfig,
        sample: impl FnMut() -> u32,
    ) -> Duration {
        let hi = self.ceiling_secs.min(cfg.max_secs).max(cfg.min_secs);
        let delay = draw_uniform(cfg.min_secs, hi, sample);
        self.ceiling_secs = self.ceiling_secs.saturating_mul(2).min(cfg.max_secs);
        info!(
            "backoff: retry in {}s (drawn from [{}, {}]), next ceiling {}s",
            delay, cfg.min_secs, hi, self.ceiling_secs
        );
        Duration::from_secs(u64::from(delay))
    }
}

/// Draws taken before settling for a slightly biased reduction.
const MAX_DRAWS: usize = 4;

/// Uniform value in the inclusive range `[lo, hi]`. Draws that fall in the
/// short tail above the largest multiple of the span are rejected.
pub fn draw_uniform(lo: u32, hi: u32, mut sample: impl FnMut() -> u32) -> u32 {
    if hi <= lo {
        return lo;
    }
    let span = u64::from(hi - lo) + 1;
    let zone = (1u64 << 32) / span * span;
    let mut draw = u64::from(sample());
    for _ in 1..MAX_DRAWS {
        if draw < zone {
            break;
        }
        draw = u64::from(sample());
    }
    lo + (draw % span) as u32
}
