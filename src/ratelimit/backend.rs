//! Limiter trait for abstracting over concrete limiter implementations.

use super::policy::Decision;

/// Trait for rate limiter implementations.
///
/// Callers that only need a decision per key should depend on this rather
/// than on [`RateLimiter`](super::RateLimiter), so tests and wrappers can
/// stand in for it.
pub trait Limiter: Send + Sync {
    /// Decide whether one request identified by `key` may proceed.
    fn allow(&self, key: &str) -> Decision;
}

impl<L: Limiter + ?Sized> Limiter for std::sync::Arc<L> {
    fn allow(&self, key: &str) -> Decision {
        (**self).allow(key)
    }
}
