mod rate_limit;

pub use rate_limit::*;

/// An event that is both logged and recorded as a metric.
pub trait InternalEvent: Sized {
    fn emit(self);
}
