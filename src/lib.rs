//! Adaptive client-side rate limiting for HTTP APIs.
//!
//! [`AdaptiveRateLimiter`] is a token bucket whose refill rate can be tuned while in
//! use. [`Dispatcher`] sends requests through it and answers 429 responses by slowing
//! the limiter down and retrying. [`Client`] wraps both in a JSON API client.

pub mod adaptive_rate;
pub mod client;
pub mod path;

#[macro_use]
extern crate tracing;

pub use adaptive_rate::{
    AdaptiveRateLimiter, DispatchError, Dispatcher, DispatcherSettings, LimiterError,
    RateLimiterSettings,
};
pub use client::{ApiRequest, Client, ClientError, Decoded};
pub use path::Path;

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;
