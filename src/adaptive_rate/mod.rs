//! Throttle outbound calls with an adaptive token bucket and back off on 429s.

mod token_bucket;

pub mod dispatch;
pub mod http;
pub mod internal_event;
pub mod limiter;
pub mod logging;
pub mod reqwest_integration;

use bon::Builder;
use serde::Deserialize;

pub use dispatch::{
    DispatchAttempt, DispatchError, DispatchEvent, DispatchLayer, DispatchState, Dispatcher,
    TransportResponse,
};
pub use limiter::{AdaptiveRateLimiter, LimiterError};
pub use logging::{ExchangeOutcome, ExchangeRecord, RequestLogger, TracingLogger};

/// Rate reported by [`AdaptiveRateLimiter::limit`] when no bucket is configured.
pub const MAX_ALLOWED_CALLS_PER_SECOND: f64 = i32::MAX as f64;

/// Bucket capacity used when none is configured.
pub const DEFAULT_BURST: usize = 1;

/// Fractional step applied by `slow_down`/`speed_up`.
pub const DEFAULT_CHANGE_PERCENT: f64 = 0.1;

/// Additional attempts made after a 429 response.
pub const DEFAULT_RETRIES_ON_429: usize = 2;

/// Lowest refill rate the bucket accepts. Repeated `slow_down` calls converge
/// towards this value instead of reaching zero.
pub const MIN_REFILL_RATE: f64 = 1e-9;

fn instant_now() -> std::time::Instant {
    tokio::time::Instant::now().into()
}

/// Configuration of the adaptive rate limiter.
///
/// `initial_rate` is required; everything else has a default.
///
/// | Parameter | Default | Description |
/// |-----------|---------|-------------|
/// | `initial_rate` | required | Tokens granted per second |
/// | `change_percent` | 0.1 | Step used by `slow_down`/`speed_up`, in (0, 1) |
/// | `burst` | 1 | Tokens that may accumulate, at least 1 |
///
/// With a burst of 1 the rate is an absolute limit: `initial_rate(10.0)` admits one
/// call every 100ms, not ten calls at once followed by ten more a second later.
///
/// # Example
///
/// ```rust
/// use adaptive_rate_client::adaptive_rate::RateLimiterSettings;
///
/// let settings = RateLimiterSettings::builder()
///     .initial_rate(5.0)
///     .change_percent(0.2)
///     .build();
/// assert_eq!(settings.burst(), 1);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Builder, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimiterSettings {
    /// Refill rate in tokens per second.
    pub(super) initial_rate: f64,

    /// Multiplicative step for adaptive adjustment.
    ///
    /// `slow_down` multiplies the rate by `1 - change_percent`; `speed_up` divides by it,
    /// so one of each restores the original rate.
    #[builder(default = default_change_percent())]
    #[serde(default = "default_change_percent")]
    pub(super) change_percent: f64,

    /// Bucket capacity.
    #[builder(default = default_burst())]
    #[serde(default = "default_burst")]
    pub(super) burst: usize,
}

const fn default_change_percent() -> f64 {
    DEFAULT_CHANGE_PERCENT
}

const fn default_burst() -> usize {
    DEFAULT_BURST
}

const fn default_retries_on_429() -> usize {
    DEFAULT_RETRIES_ON_429
}

/// `change_percent` if it lies in (0, 1), otherwise the default.
fn valid_change_percent(change_percent: f64) -> f64 {
    if change_percent > 0.0 && change_percent < 1.0 {
        return change_percent;
    }
    warn!(
        message = "Rate limiter change_percent must be in (0, 1); using default.",
        change_percent,
        default = DEFAULT_CHANGE_PERCENT,
    );
    DEFAULT_CHANGE_PERCENT
}

impl RateLimiterSettings {
    pub fn initial_rate(&self) -> f64 {
        self.initial_rate
    }

    pub fn change_percent(&self) -> f64 {
        self.change_percent
    }

    pub fn burst(&self) -> usize {
        self.burst
    }

    /// Replaces out-of-range values with their defaults.
    pub fn normalized(self) -> Self {
        let change_percent = valid_change_percent(self.change_percent);

        let burst = if self.burst == 0 {
            warn!(message = "Rate limiter burst must be at least 1; using 1.");
            DEFAULT_BURST
        } else {
            self.burst
        };

        let initial_rate = if self.initial_rate.is_nan() || self.initial_rate < MIN_REFILL_RATE {
            warn!(
                message = "Rate limiter initial_rate must be positive; clamping.",
                initial_rate = self.initial_rate,
                floor = MIN_REFILL_RATE,
            );
            MIN_REFILL_RATE
        } else {
            self.initial_rate
        };

        Self {
            initial_rate,
            change_percent,
            burst,
        }
    }
}

/// Configuration of the dispatcher retry loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Builder, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DispatcherSettings {
    /// Attempts made after the first one when the server answers 429.
    /// Other statuses and transport errors are never retried.
    #[builder(default = default_retries_on_429())]
    #[serde(default = "default_retries_on_429")]
    pub(super) retries_on_429: usize,
}

impl DispatcherSettings {
    pub fn retries_on_429(&self) -> usize {
        self.retries_on_429
    }
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            retries_on_429: default_retries_on_429(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_builder_defaults() {
        let settings = RateLimiterSettings::builder().initial_rate(3.0).build();
        assert_eq!(settings.initial_rate(), 3.0);
        assert_eq!(settings.change_percent(), DEFAULT_CHANGE_PERCENT);
        assert_eq!(settings.burst(), DEFAULT_BURST);
    }

    #[test]
    fn settings_deserialize_with_defaults() {
        let settings: RateLimiterSettings =
            serde_json::from_str(r#"{ "initial_rate": 20.0, "burst": 4 }"#).unwrap();
        assert_eq!(settings.initial_rate(), 20.0);
        assert_eq!(settings.change_percent(), DEFAULT_CHANGE_PERCENT);
        assert_eq!(settings.burst(), 4);

        let dispatcher: DispatcherSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(dispatcher.retries_on_429(), DEFAULT_RETRIES_ON_429);
    }

    #[test]
    fn settings_reject_unknown_fields() {
        let result =
            serde_json::from_str::<RateLimiterSettings>(r#"{ "initial_rate": 1.0, "burts": 2 }"#);
        assert!(result.is_err());
    }

    #[test]
    fn normalized_replaces_out_of_range_values() {
        let settings = RateLimiterSettings::builder()
            .initial_rate(-4.0)
            .change_percent(1.5)
            .burst(0)
            .build()
            .normalized();
        assert_eq!(settings.initial_rate(), MIN_REFILL_RATE);
        assert_eq!(settings.change_percent(), DEFAULT_CHANGE_PERCENT);
        assert_eq!(settings.burst(), DEFAULT_BURST);

        let untouched = RateLimiterSettings::builder()
            .initial_rate(7.5)
            .change_percent(0.25)
            .burst(3)
            .build();
        assert_eq!(untouched.normalized(), untouched);
    }
}
