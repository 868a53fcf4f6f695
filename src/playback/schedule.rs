//! Rotation timing. Pure functions of a handle's lifetime and the attempt
//! count; nothing here touches a clock or a media element.

use std::time::Duration;
use thiserror::Error;

/// Never schedule a rotation sooner than this.
const MIN_DELAY: Duration = Duration::from_millis(1);

#[derive(Debug, Error, PartialEq)]
pub enum PolicyError {
    #[error("rotation_fraction must be in (0, 1), got {0}")]
    Fraction(f64),

    #[error("initial_backoff must not exceed max_backoff")]
    Backoff,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RotationPolicy {
    rotation_fraction: f64,
    max_retries: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    min_interval: Duration,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            rotation_fraction: 0.8,
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(5),
            min_interval: Duration::from_secs(1),
        }
    }
}

impl RotationPolicy {
    pub fn new(
        rotation_fraction: f64,
        max_retries: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
        min_interval: Duration,
    ) -> Result<Self, PolicyError> {
        if !(rotation_fraction > 0.0 && rotation_fraction < 1.0) {
            return Err(PolicyError::Fraction(rotation_fraction));
        }
        if initial_backoff > max_backoff {
            return Err(PolicyError::Backoff);
        }

        Ok(Self {
            rotation_fraction,
            max_retries,
            initial_backoff,
            max_backoff,
            min_interval,
        })
    }

    pub fn rotation_fraction(&self) -> f64 {
        self.rotation_fraction
    }

    /// Retries allowed after the first failed rotation attempt.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Time from adopting a handle with `lifetime` until its rotation.
    ///
    /// Normally `lifetime * rotation_fraction`, but never below
    /// `min_interval` and never past the handle's own expiry, so a handle
    /// capped by a nearly lapsed entitlement is rotated when it expires
    /// rather than in ever shorter steps.
    pub fn rotation_delay(&self, lifetime: Duration) -> Duration {
        lifetime
            .mul_f64(self.rotation_fraction)
            .max(self.min_interval)
            .min(lifetime)
            .max(MIN_DELAY)
    }

    /// Wait before retry number `attempt` (1-based): exponential from
    /// `initial_backoff`, capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}
