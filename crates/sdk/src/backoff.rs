//! Jittered exponential backoff.
//!
//! Paces both the gossip resolver's retry loop and the connection provider's
//! factory retries. Each call to [`Backoff::next_backoff`] grows the delay by
//! the configured multiplier (1.6 by default), caps it at the configured
//! maximum, and applies ±`jitter` randomness so that many clients losing the
//! same node do not reconnect in lockstep.

use std::time::Duration;

use rand::Rng;
use snafu::ensure;
use tokio_util::sync::CancellationToken;

use crate::error::{CancelledSnafu, ConfigSnafu, Result};

/// Default delay the sequence starts from.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Default upper bound for a single delay.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Default growth factor between consecutive delays.
pub const DEFAULT_MULTIPLIER: f64 = 1.6;

/// Default jitter factor (±20%).
pub const DEFAULT_JITTER: f64 = 0.2;

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, bon::Builder)]
#[builder(derive(Debug))]
pub struct BackoffConfig {
    /// Delay the sequence starts from.
    #[builder(default = DEFAULT_INITIAL_BACKOFF)]
    pub initial: Duration,

    /// Upper bound for a single (un-jittered) delay.
    #[builder(default = DEFAULT_MAX_BACKOFF)]
    pub max: Duration,

    /// Growth factor applied on every step.
    #[builder(default = DEFAULT_MULTIPLIER)]
    pub multiplier: f64,

    /// Jitter factor in `[0.0, 1.0]`.
    #[builder(default = DEFAULT_JITTER)]
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: DEFAULT_INITIAL_BACKOFF,
            max: DEFAULT_MAX_BACKOFF,
            multiplier: DEFAULT_MULTIPLIER,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl BackoffConfig {
    /// Creates a config with the given bounds and the default multiplier and jitter.
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max, ..Self::default() }
    }

    /// Checks that the parameters describe a usable sequence.
    ///
    /// # Errors
    ///
    /// Returns `SdkError::Config` if the initial delay is zero, the maximum is
    /// below the initial delay, the multiplier is below 1.0 or not finite, or
    /// the jitter falls outside `[0.0, 1.0]`.
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.initial.is_zero(), ConfigSnafu { message: "initial backoff cannot be zero" });
        ensure!(
            self.max >= self.initial,
            ConfigSnafu { message: "max backoff must be at least the initial backoff" }
        );
        ensure!(
            self.multiplier.is_finite() && self.multiplier >= 1.0,
            ConfigSnafu { message: "backoff multiplier must be a finite value >= 1.0" }
        );
        ensure!(
            (0.0..=1.0).contains(&self.jitter),
            ConfigSnafu { message: "backoff jitter must be within [0.0, 1.0]" }
        );
        Ok(())
    }
}

/// Stateful backoff sequence.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
}

impl Backoff {
    /// Starts a new sequence at `config.initial`.
    #[must_use]
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, current: config.initial }
    }

    /// Advances the sequence and returns the jittered delay to wait.
    ///
    /// The un-jittered value is `min(previous * multiplier, max)`; jitter is
    /// applied to the returned delay only, so the sequence itself stays
    /// monotone.
    pub fn next_backoff(&mut self) -> Duration {
        let grown = Duration::try_from_secs_f64(self.current.as_secs_f64() * self.config.multiplier)
            .unwrap_or(self.config.max);
        self.current = grown.min(self.config.max);
        apply_jitter(self.current, self.config.jitter)
    }

    /// Restores the sequence to `config.initial`.
    pub fn reset(&mut self) {
        self.current = self.config.initial;
    }

    /// Returns the un-jittered delay most recently produced (or the initial delay).
    #[must_use]
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Returns the configuration this sequence was built from.
    #[must_use]
    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }
}

/// Apply jitter to a duration.
///
/// Jitter adds randomness in the range `[dur * (1 - factor), dur * (1 + factor)]`
/// to prevent thundering herd when multiple clients retry simultaneously.
pub fn apply_jitter(dur: Duration, factor: f64) -> Duration {
    if factor <= 0.0 || dur.is_zero() {
        return dur;
    }

    let factor = factor.clamp(0.0, 1.0);
    let mut rng = rand::rng();

    let base_secs = dur.as_secs_f64();
    let min_secs = base_secs * (1.0 - factor);
    let max_secs = base_secs * (1.0 + factor);

    let jittered_secs = rng.random_range(min_secs..=max_secs);
    Duration::try_from_secs_f64(jittered_secs).unwrap_or(dur)
}

/// Sleeps for `dur` unless `token` fires first.
///
/// # Errors
///
/// Returns `SdkError::Cancelled` if the token is cancelled before the delay elapses.
pub(crate) async fn sleep_cancellable(dur: Duration, token: &CancellationToken) -> Result<()> {
    tokio::select! {
        biased;
        () = token.cancelled() => CancelledSnafu.fail(),
        () = tokio::time::sleep(dur) => Ok(()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::error::SdkError;

    fn no_jitter(initial_ms: u64, max_ms: u64) -> BackoffConfig {
        BackoffConfig::builder()
            .initial(Duration::from_millis(initial_ms))
            .max(Duration::from_millis(max_ms))
            .jitter(0.0)
            .build()
    }

    fn assert_close(actual: Duration, expected: Duration) {
        let diff = actual.abs_diff(expected);
        assert!(diff < Duration::from_micros(1), "{actual:?} != {expected:?}");
    }

    #[test]
    fn test_defaults() {
        let config = BackoffConfig::default();
        assert_eq!(config.multiplier, 1.6);
        assert_eq!(config.jitter, 0.2);
        assert_eq!(config, BackoffConfig::builder().build());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sequence_grows_by_multiplier_until_cap() {
        let mut backoff = Backoff::new(no_jitter(100, 1000));

        assert_close(backoff.next_backoff(), Duration::from_millis(160));
        assert_close(backoff.next_backoff(), Duration::from_millis(256));
        assert_close(backoff.next_backoff(), Duration::from_micros(409_600));
        assert_close(backoff.next_backoff(), Duration::from_micros(655_360));
        assert_eq!(backoff.next_backoff(), Duration::from_millis(1000));
        assert_eq!(backoff.next_backoff(), Duration::from_millis(1000));
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut backoff = Backoff::new(no_jitter(100, 1000));
        backoff.next_backoff();
        backoff.next_backoff();
        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_millis(100));
        assert_close(backoff.next_backoff(), Duration::from_millis(160));
    }

    #[test]
    fn test_huge_max_does_not_overflow() {
        let config = BackoffConfig::builder()
            .initial(Duration::from_secs(u64::MAX / 2))
            .max(Duration::MAX)
            .jitter(0.0)
            .build();
        let mut backoff = Backoff::new(config);
        let grown = backoff.next_backoff();
        assert!(grown > config.initial);
        assert!(grown <= config.max);

        // Growth past the representable range saturates at `max`.
        let config = BackoffConfig::builder().initial(Duration::MAX).max(Duration::MAX).jitter(0.0).build();
        let mut backoff = Backoff::new(config);
        assert_eq!(backoff.next_backoff(), Duration::MAX);
        assert_eq!(backoff.next_backoff(), Duration::MAX);
    }

    #[test]
    fn test_jitter_keeps_huge_delays_in_range() {
        let base = Duration::from_secs(u64::MAX / 4);
        let jittered = apply_jitter(base, 0.2);
        assert!(jittered.as_secs_f64() >= base.as_secs_f64() * 0.79);
        assert!(jittered.as_secs_f64() <= base.as_secs_f64() * 1.21);
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        assert!(no_jitter(0, 100).validate().is_err());
        assert!(no_jitter(200, 100).validate().is_err());

        let config = BackoffConfig { multiplier: 0.5, ..BackoffConfig::default() };
        assert!(matches!(config.validate(), Err(SdkError::Config { .. })));

        let config = BackoffConfig { jitter: 1.5, ..BackoffConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_jitter_is_identity() {
        let dur = Duration::from_millis(250);
        assert_eq!(apply_jitter(dur, 0.0), dur);
    }

    #[tokio::test]
    async fn test_sleep_cancellable_returns_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        let result = sleep_cancellable(Duration::from_secs(60), &token).await;
        assert!(matches!(result, Err(SdkError::Cancelled)));
    }

    #[tokio::test]
    async fn test_sleep_cancellable_completes() {
        let token = CancellationToken::new();
        let result = sleep_cancellable(Duration::from_millis(1), &token).await;
        assert!(result.is_ok());
    }
}
