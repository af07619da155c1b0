//! Rate limiting algorithms and the decision interface built on them.

mod algorithm;
mod backend;
mod bucket;
mod extract;
mod fixed_window;
mod key;
mod leaky_bucket;
mod limiter;
mod policy;
mod registry;
mod sliding_window;
mod token_bucket;

pub use algorithm::Algorithm;
pub use backend::Limiter;
pub use bucket::BucketState;
pub use extract::{CustomKeyFn, KeyExtractor, RequestInfo, ANONYMOUS_KEY, DEFAULT_API_KEY_HEADER};
pub use fixed_window::FixedWindow;
pub use key::StorageKey;
pub use leaky_bucket::LeakyBucket;
pub use limiter::{LimiterBuilder, RateLimiter};
pub use policy::{Decision, FailPolicy};
pub use registry::{AlgorithmFactory, Registry};
pub use sliding_window::{SlidingWindow, WeightedSlidingWindow, WeightedState};
pub use token_bucket::TokenBucket;
