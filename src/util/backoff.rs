use std::time::Duration;

use rand::Rng;

pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(1_000);
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.5;
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(60_000);
/// Jitter applied to each delay, as a fraction of the current base delay.
pub const RANDOM_FACTOR: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffSettings {
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

/// Exponential backoff with jitter.
///
/// The first attempt after a reset runs immediately. Every subsequent call to
/// [`next_delay`](Self::next_delay) grows the base delay by the configured
/// factor, clamped to `[initial_delay, max_delay]`, and returns the base plus up
/// to ±50% jitter.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    settings: BackoffSettings,
    current_base_millis: f64,
}

impl ExponentialBackoff {
    pub fn new(settings: BackoffSettings) -> Self {
        Self {
            settings,
            current_base_millis: 0.0,
        }
    }

    pub fn settings(&self) -> BackoffSettings {
        self.settings
    }

    /// Resets so the next attempt runs without delay.
    pub fn reset(&mut self) {
        self.current_base_millis = 0.0;
    }

    /// Forces the next delay to use the maximum base delay.
    pub fn reset_to_max(&mut self) {
        self.current_base_millis = self.settings.max_delay.as_millis() as f64;
    }

    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with_rng(&mut rand::thread_rng())
    }

    pub fn next_delay_with_rng<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let jitter = (rng.gen::<f64>() - 0.5) * 2.0 * RANDOM_FACTOR * self.current_base_millis;
        let delay = (self.current_base_millis + jitter).floor().max(0.0);

        let initial = self.settings.initial_delay.as_millis() as f64;
        let max = self.settings.max_delay.as_millis() as f64;
        self.current_base_millis = (self.current_base_millis * self.settings.backoff_factor)
            .clamp(initial, max.max(initial));

        if delay > 0.0 {
            log::debug!(
                "backing off for {delay} ms (base delay {} ms)",
                self.current_base_millis
            );
        }
        Duration::from_millis(delay as u64)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(BackoffSettings::default())
    }
}
