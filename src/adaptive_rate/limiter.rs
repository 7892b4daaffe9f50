use std::{
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use snafu::Snafu;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

use super::{
    DEFAULT_BURST, MAX_ALLOWED_CALLS_PER_SECOND, RateLimiterSettings, instant_now,
    valid_change_percent,
    internal_event::{
        BurstChanged, InternalEvent, RefillRateChanged, TokenWaitCancelled, TokenWaitCompleted,
    },
    token_bucket::TokenBucket,
};

#[derive(Debug, Snafu, Clone, Copy, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum LimiterError {
    /// The caller's cancellation token fired before a token became available.
    #[snafu(display("Cancelled while waiting for rate limit capacity"))]
    Cancelled,
}

/// Token-bucket rate limiter whose refill rate can be tuned while in use.
///
/// The handle is cheap to clone and every clone shares the same bucket, so one
/// limiter can throttle many concurrent tasks. A limiter is in one of three states:
///
/// - **disabled** ([`AdaptiveRateLimiter::disabled`], also the `Default`): there is no
///   limiter at all. Every operation is a no-op and `wait` never blocks.
/// - **unset** ([`AdaptiveRateLimiter::unset`]): the limiter exists but has no bucket
///   yet. It behaves like a disabled limiter until [`set_limit`](Self::set_limit)
///   creates the bucket.
/// - **limited**: a bucket with a refill rate and a burst.
///
/// Callers can therefore hold an `AdaptiveRateLimiter` unconditionally instead of
/// an `Option` checked at every call site.
#[derive(Clone, Debug, Default)]
pub struct AdaptiveRateLimiter {
    shared: Option<Arc<Shared>>,
}

#[derive(Debug)]
struct Shared {
    change_percent: f64,
    bucket: Mutex<Option<TokenBucket>>,
}

impl Shared {
    fn bucket(&self) -> MutexGuard<'_, Option<TokenBucket>> {
        // The bucket is plain numbers; a panic elsewhere cannot leave it inconsistent.
        self.bucket.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies `f` to the current rate if a bucket exists.
    fn adjust_rate(&self, f: impl FnOnce(f64) -> f64) {
        let mut guard = self.bucket();
        if let Some(bucket) = guard.as_mut() {
            let previous = bucket.rate();
            bucket.set_rate(instant_now(), f(previous));
            let current = bucket.rate();
            drop(guard);
            RefillRateChanged { previous, current }.emit();
        }
    }
}

impl AdaptiveRateLimiter {
    pub fn new(settings: RateLimiterSettings) -> Self {
        let settings = settings.normalized();
        let bucket = TokenBucket::new(settings.initial_rate, settings.burst, instant_now());
        debug!(
            message = "Rate limiter created.",
            rate = settings.initial_rate,
            burst = settings.burst,
            change_percent = settings.change_percent,
        );
        Self {
            shared: Some(Arc::new(Shared {
                change_percent: settings.change_percent,
                bucket: Mutex::new(Some(bucket)),
            })),
        }
    }

    /// A limiter admitting `rate` calls per second with the default burst and step.
    ///
    /// `with_rate(10.0)` admits one call every 100ms rather than ten at once.
    pub fn with_rate(rate: f64) -> Self {
        Self::new(RateLimiterSettings::builder().initial_rate(rate).build())
    }

    /// No limiter at all.
    pub const fn disabled() -> Self {
        Self { shared: None }
    }

    /// A limiter without a bucket; [`set_limit`](Self::set_limit) creates one.
    pub fn unset(change_percent: f64) -> Self {
        let change_percent = valid_change_percent(change_percent);
        Self {
            shared: Some(Arc::new(Shared {
                change_percent,
                bucket: Mutex::new(None),
            })),
        }
    }

    /// Whether calls are currently being throttled.
    pub fn is_limited(&self) -> bool {
        self.shared
            .as_ref()
            .is_some_and(|shared| shared.bucket().is_some())
    }

    /// The step used by [`slow_down`](Self::slow_down) and [`speed_up`](Self::speed_up),
    /// `None` for a disabled limiter.
    pub fn change_percent(&self) -> Option<f64> {
        self.shared.as_ref().map(|shared| shared.change_percent)
    }

    /// Suspends until a token is available and consumes it.
    ///
    /// Returns immediately when the limiter is disabled or unset. If `cancel` fires
    /// first, returns [`LimiterError::Cancelled`] without consuming a token. The
    /// returned future is also safe to drop at any point: tokens are only taken at
    /// the instant the call is admitted.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), LimiterError> {
        let Some(shared) = &self.shared else {
            return Ok(());
        };
        if cancel.is_cancelled() {
            return CancelledSnafu.fail();
        }

        let started = Instant::now();
        let mut suspended = false;
        loop {
            let delay = {
                let mut guard = shared.bucket();
                match guard.as_mut() {
                    None => return Ok(()),
                    Some(bucket) => bucket.try_acquire(instant_now()),
                }
            };

            match delay {
                Ok(()) => {
                    if suspended {
                        TokenWaitCompleted {
                            waited: started.elapsed(),
                        }
                        .emit();
                    }
                    return Ok(());
                }
                Err(delay) => {
                    suspended = true;
                    trace!(
                        message = "Waiting for rate limit token.",
                        delay_ms = delay.as_secs_f64() * 1_000.0,
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            TokenWaitCancelled { waited: started.elapsed() }.emit();
                            return CancelledSnafu.fail();
                        }
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Waits for a token, then runs `operation`.
    ///
    /// A cancelled wait is converted into the operation's error type, so whichever
    /// error happens first is returned.
    pub async fn run<F, Fut, T, E>(&self, cancel: &CancellationToken, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LimiterError>,
    {
        self.wait(cancel).await?;
        operation().await
    }

    /// Replaces the refill rate.
    ///
    /// An unset limiter gets a bucket with the default burst. A disabled limiter
    /// ignores the call. With a burst above 1 the rate is no longer an absolute
    /// limit; see [`set_burst`](Self::set_burst).
    pub fn set_limit(&self, rate: f64) {
        let Some(shared) = &self.shared else {
            return;
        };
        let mut guard = shared.bucket();
        let now = instant_now();
        let (previous, current) = match guard.as_mut() {
            Some(bucket) => {
                let previous = bucket.rate();
                bucket.set_rate(now, rate);
                (previous, bucket.rate())
            }
            None => {
                let bucket = TokenBucket::new(rate, DEFAULT_BURST, now);
                let current = bucket.rate();
                *guard = Some(bucket);
                (MAX_ALLOWED_CALLS_PER_SECOND, current)
            }
        };
        drop(guard);
        RefillRateChanged { previous, current }.emit();
    }

    /// Current refill rate, or [`MAX_ALLOWED_CALLS_PER_SECOND`] when nothing is throttled.
    pub fn limit(&self) -> f64 {
        self.shared
            .as_ref()
            .and_then(|shared| shared.bucket().as_ref().map(TokenBucket::rate))
            .unwrap_or(MAX_ALLOWED_CALLS_PER_SECOND)
    }

    /// Sets the bucket capacity.
    ///
    /// Burst is the bucket size and every admitted call drains one token; the limit
    /// is the refill rate. With `rate = 10` and `burst = 10`, fully concurrent callers
    /// get 20 calls through in the first second and 10 per second afterwards.
    /// No-op unless the limiter has a bucket.
    pub fn set_burst(&self, burst: usize) {
        let Some(shared) = &self.shared else {
            return;
        };
        let mut guard = shared.bucket();
        if let Some(bucket) = guard.as_mut() {
            let previous = bucket.burst();
            bucket.set_burst(instant_now(), burst);
            let current = bucket.burst();
            drop(guard);
            BurstChanged { previous, current }.emit();
        }
    }

    /// Current bucket capacity, or [`DEFAULT_BURST`] when nothing is throttled.
    pub fn burst(&self) -> usize {
        self.shared
            .as_ref()
            .and_then(|shared| shared.bucket().as_ref().map(TokenBucket::burst))
            .unwrap_or(DEFAULT_BURST)
    }

    /// Reduces the refill rate by `change_percent`. Used to adapt to 429 responses.
    pub fn slow_down(&self) {
        if let Some(shared) = &self.shared {
            let factor = 1.0 - shared.change_percent;
            shared.adjust_rate(|rate| rate * factor);
        }
    }

    /// Undoes one [`slow_down`](Self::slow_down).
    ///
    /// Divides by `1 - change_percent` rather than multiplying by `1 + change_percent`,
    /// so a slow down followed by a speed up lands on the original rate.
    pub fn speed_up(&self) {
        if let Some(shared) = &self.shared {
            let factor = 1.0 - shared.change_percent;
            shared.adjust_rate(|rate| rate / factor);
        }
    }
}
