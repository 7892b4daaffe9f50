use std::time::Duration;

use metrics::{counter, gauge, histogram};

use super::InternalEvent;

#[derive(Clone, Copy, Debug)]
pub struct RefillRateChanged {
    pub previous: f64,
    pub current: f64,
}

impl InternalEvent for RefillRateChanged {
    fn emit(self) {
        gauge!("adaptive_rate_limit_refill_rate").set(self.current);
        debug!(
            target: "adaptive_rate::stats",
            previous_rate = self.previous,
            current_rate = self.current,
            "Refill rate changed."
        );
    }
}

#[derive(Clone, Copy, Debug)]
pub struct BurstChanged {
    pub previous: usize,
    pub current: usize,
}

impl InternalEvent for BurstChanged {
    fn emit(self) {
        gauge!("adaptive_rate_limit_burst").set(self.current as f64);
        debug!(
            target: "adaptive_rate::stats",
            previous_burst = self.previous,
            current_burst = self.current,
            "Burst changed."
        );
    }
}

/// The remote answered 429 on the given attempt.
#[derive(Clone, Copy, Debug)]
pub struct OverloadReceived {
    pub attempt: usize,
    pub max_retries: usize,
}

impl InternalEvent for OverloadReceived {
    fn emit(self) {
        counter!("adaptive_rate_limit_overloads_total").increment(1);
        info!(
            target: "adaptive_rate::stats",
            attempt = self.attempt,
            max_retries = self.max_retries,
            retrying = self.attempt <= self.max_retries,
            "Remote signaled overload; slowing down."
        );
    }
}

/// A waiter was admitted after being suspended.
#[derive(Clone, Copy, Debug)]
pub struct TokenWaitCompleted {
    pub waited: Duration,
}

impl InternalEvent for TokenWaitCompleted {
    fn emit(self) {
        histogram!("adaptive_rate_limit_wait_seconds").record(self.waited);
        trace!(
            target: "adaptive_rate::stats",
            waited_ms = self.waited.as_millis(),
            "Token acquired after waiting."
        );
    }
}

#[derive(Clone, Copy, Debug)]
pub struct TokenWaitCancelled {
    pub waited: Duration,
}

impl InternalEvent for TokenWaitCancelled {
    fn emit(self) {
        counter!("adaptive_rate_limit_cancelled_total").increment(1);
        debug!(
            target: "adaptive_rate::stats",
            waited_ms = self.waited.as_millis(),
            "Wait for token cancelled."
        );
    }
}
