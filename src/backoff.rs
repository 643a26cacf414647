//! Exponential backoff with jitter and an elapsed-time ceiling.
//!
//! Used both for operation retry and for automatic reconnection. Each call to
//! [`Backoff::next_sleep`] returns the delay before the next attempt:
//!
//! ```text
//! base[n]  = min(initial * multiplier^(n-1), max_delay)
//! delay[n] = base[n] * (1 - jitter * r),  r uniform in [0, 1)
//! ```
//!
//! The schedule gives up when either an explicit attempt limit is reached or
//! the time since the first attempt plus the next delay would pass
//! `max_elapsed`.
//!
//! # Examples
//!
//! ```ignore
//! let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60), 2.0)
//!     .with_jitter(0.2)
//!     .with_max_elapsed(Duration::from_secs(300));
//!
//! while let Ok(delay) = backoff.next_sleep() {
//!     tokio::time::sleep(delay).await;
//!     if try_again().await.is_ok() {
//!         backoff.reset();
//!         break;
//!     }
//! }
//! ```

use std::time::{Duration, Instant};

use rand::Rng;
use thiserror::Error;

use crate::config::RetryConfig;

/// Backoff exhaustion.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BackoffError {
    /// Maximum retry attempts exceeded with the given limit.
    #[error("Maximum number of attempts exceeded: {0}")]
    MaxAttemptLimitError(u32),

    /// The next delay would pass the elapsed-time ceiling.
    #[error("Maximum elapsed time exceeded: {0:?}")]
    MaxElapsedError(Duration),
}

/// Exponential backoff controller.
///
/// Not shared: each retrying operation or reconnect loop owns one.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial_delay: Duration,

    /// The un-jittered delay for the next attempt.
    current_delay: Duration,

    max_delay: Duration,

    multiplier: f64,

    /// Fraction of each delay that may be randomized away.
    jitter: f64,

    attempt: u32,

    max_attempts: Option<u32>,

    max_elapsed: Option<Duration>,

    /// Set on the first `next_sleep` after construction or reset.
    started: Option<Instant>,
}

impl Backoff {
    /// Creates a backoff with no jitter and no limits.
    ///
    /// A multiplier below 1.0 is treated as 1.0, giving a constant delay.
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial_delay: initial,
            current_delay: initial,
            max_delay: max.max(initial),
            multiplier: multiplier.max(1.0),
            jitter: 0.0,
            attempt: 0,
            max_attempts: None,
            max_elapsed: None,
            started: None,
        }
    }

    /// Builds the operation retry schedule from configuration.
    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            Duration::from_millis(config.initial_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.multiplier,
        )
        .with_jitter(config.jitter)
        .with_max_elapsed(Duration::from_secs(config.max_elapsed_secs))
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed = Some(max_elapsed);
        self
    }

    pub fn set_max_attempts(&mut self, max: u32) {
        self.max_attempts = Some(max);
    }

    /// Starts over from the initial delay and restarts the elapsed clock.
    pub fn reset(&mut self) {
        self.current_delay = self.initial_delay;
        self.attempt = 0;
        self.started = None;
    }

    /// Returns the next sleep duration and advances the schedule.
    ///
    /// # Errors
    ///
    /// - `MaxAttemptLimitError` when an explicit attempt limit is exceeded
    /// - `MaxElapsedError` when the delay would end past the elapsed ceiling
    pub fn next_sleep(&mut self) -> Result<Duration, BackoffError> {
        let started = *self.started.get_or_insert_with(Instant::now);
        self.attempt += 1;

        if let Some(max) = self.max_attempts {
            if self.attempt > max {
                return Err(BackoffError::MaxAttemptLimitError(max));
            }
        }

        let sleep = self.jittered(self.current_delay);

        if let Some(max_elapsed) = self.max_elapsed {
            if started.elapsed() + sleep > max_elapsed {
                return Err(BackoffError::MaxElapsedError(max_elapsed));
            }
        }

        let next_delay_secs = self.current_delay.as_secs_f64() * self.multiplier;
        self.current_delay = Duration::from_secs_f64(next_delay_secs).min(self.max_delay);

        Ok(sleep)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let r: f64 = rand::thread_rng().gen_range(0.0..1.0);
        delay.mul_f64(1.0 - self.jitter * r)
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    pub fn max_elapsed(&self) -> Option<Duration> {
        self.max_elapsed
    }

    /// Number of `next_sleep` calls since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }
}

impl Default for Backoff {
    /// 1 second initial, 60 second cap, 10% growth, no jitter.
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), 1.1)
    }
}
