//! Core rate limiter implementation.

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

use super::algorithm::Algorithm;
use super::backend::Limiter;
use super::extract::{CustomKeyFn, KeyExtractor, RequestInfo};
use super::key::StorageKey;
use super::policy::{Decision, FailPolicy};
use super::registry::Registry;
use crate::clock::{Clock, SystemClock};
use crate::config::{LimiterConfig, Strategy};
use crate::error::Result;
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::storage::{MemoryStorage, RedisStorage, Storage};

/// A configured limiter: one algorithm over one storage backend.
///
/// This struct is thread-safe and can be shared across threads behind an
/// `Arc`. Per-key serialization is the backend's job, so calls on different
/// keys never contend here.
pub struct RateLimiter {
    algorithm: Box<dyn Algorithm>,
    storage: Arc<dyn Storage>,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
    policy: FailPolicy,
    extractor: KeyExtractor,
    namespace: Option<String>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("algorithm", &self.algorithm)
            .field("storage", &self.storage.name())
            .field("policy", &self.policy)
            .field("extractor", &self.extractor)
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl RateLimiter {
    /// Start building a limiter from `config`.
    pub fn builder(config: LimiterConfig) -> LimiterBuilder {
        LimiterBuilder::new(config)
    }

    /// Build a limiter with the default registry, clock and no metrics.
    pub fn from_config(config: LimiterConfig) -> Result<Self> {
        LimiterBuilder::new(config).build()
    }

    pub fn strategy(&self) -> Strategy {
        self.algorithm.strategy()
    }

    pub fn policy(&self) -> FailPolicy {
        self.policy
    }

    /// The backend state is kept in.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// The storage key `key` maps to.
    pub fn storage_key(&self, key: &str) -> StorageKey {
        StorageKey::new(self.namespace.as_deref(), self.algorithm.prefix(), key)
    }

    /// Derive the key from `request` per the configured `key_by`, then decide.
    pub fn allow_request(&self, request: &RequestInfo) -> Decision {
        let key = self.extractor.extract(request);
        self.allow(&key)
    }

    fn record(&self, key: &StorageKey, decision: &Decision) {
        if decision.is_allowed() {
            self.metrics.inc_allow();
        } else {
            self.metrics.inc_deny();
            if !decision.is_degraded() {
                debug!(key = %key, strategy = %self.strategy(), "Rate limit exceeded");
            }
        }
    }
}

impl Limiter for RateLimiter {
    fn allow(&self, key: &str) -> Decision {
        let started = Instant::now();
        let storage_key = self.storage_key(key);
        let now = self.clock.now_micros();

        trace!(
            key = %storage_key,
            strategy = %self.strategy(),
            "Checking rate limit"
        );

        let outcome = self
            .algorithm
            .check(self.storage.as_ref(), storage_key.as_str(), now);
        if let Err(err) = &outcome {
            warn!(
                key = %storage_key,
                backend = self.storage.name(),
                policy = ?self.policy,
                error = %err,
                "Rate limit backend failure"
            );
        }

        let decision = self.policy.resolve(outcome);
        self.metrics.observe_latency(started.elapsed());
        self.record(&storage_key, &decision);
        decision
    }
}

/// Assembles a [`RateLimiter`] from a configuration plus optional collaborators.
pub struct LimiterBuilder {
    config: LimiterConfig,
    metrics: Option<Arc<dyn MetricsSink>>,
    clock: Option<Arc<dyn Clock>>,
    storage: Option<Arc<dyn Storage>>,
    custom_key: Option<CustomKeyFn>,
    registry: Option<Registry>,
}

impl LimiterBuilder {
    pub fn new(config: LimiterConfig) -> Self {
        Self {
            config,
            metrics: None,
            clock: None,
            storage: None,
            custom_key: None,
            registry: None,
        }
    }

    /// Report decisions to `metrics` instead of dropping them.
    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Use `clock` for timestamps and for the in-process backend's expiry.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use an existing backend, ignoring `backend_url`.
    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Key derivation for [`KeyBy::Custom`](crate::config::KeyBy::Custom).
    pub fn custom_key<F>(mut self, extract: F) -> Self
    where
        F: Fn(&RequestInfo) -> Option<String> + Send + Sync + 'static,
    {
        self.custom_key = Some(Arc::new(extract));
        self
    }

    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Validate the configuration and wire everything together.
    ///
    /// An unreachable Redis server is not detected here: it surfaces per call
    /// as a backend failure.
    pub fn build(self) -> Result<RateLimiter> {
        let config = self.config;
        config.validate()?;

        let algorithm = self.registry.unwrap_or_default().create(&config)?;
        let extractor =
            KeyExtractor::new(config.key_by, config.header_key.as_deref(), self.custom_key)?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let storage: Arc<dyn Storage> = match (self.storage, config.remote_url()) {
            (Some(storage), _) => storage,
            (None, Some(url)) => Arc::new(RedisStorage::open(url, &config.redis)?),
            (None, None) => Arc::new(MemoryStorage::with_clock(clock.clone())),
        };
        let metrics = self.metrics.unwrap_or_else(|| Arc::new(NoopMetrics));

        info!(
            strategy = %config.strategy,
            limit = config.limit,
            window_ms = config.window_ms,
            backend = storage.name(),
            fail_open = config.fail_open,
            "Rate limiter initialized"
        );

        Ok(RateLimiter {
            algorithm,
            storage,
            metrics,
            clock,
            policy: FailPolicy::from_fail_open(config.fail_open),
            extractor,
            namespace: config.namespace.filter(|ns| !ns.is_empty()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{KeyBy, SlidingWindowMode};
    use crate::error::{BackendUnavailable, TurnstileError};
    use crate::storage::{Script, StorageResult};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    const START: i64 = 1_700_000_000_000_000;

    fn limiter(strategy: Strategy, limit: u64, window: Duration) -> (Arc<ManualClock>, RateLimiter) {
        let clock = Arc::new(ManualClock::new(START));
        let limiter = RateLimiter::builder(LimiterConfig::new(strategy, limit, window))
            .clock(clock.clone())
            .build()
            .unwrap();
        (clock, limiter)
    }

    #[derive(Default)]
    struct CountingMetrics {
        allowed: AtomicU64,
        denied: AtomicU64,
        observed: AtomicU64,
    }

    impl MetricsSink for CountingMetrics {
        fn inc_allow(&self) {
            self.allowed.fetch_add(1, Ordering::SeqCst);
        }

        fn inc_deny(&self) {
            self.denied.fetch_add(1, Ordering::SeqCst);
        }

        fn observe_latency(&self, _elapsed: Duration) {
            self.observed.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Backend whose every call fails.
    struct DownStorage;

    impl DownStorage {
        fn fail<T>() -> StorageResult<T> {
            Err(BackendUnavailable::new("connection refused"))
        }
    }

    impl Storage for DownStorage {
        fn name(&self) -> &'static str {
            "down"
        }
        fn incr(&self, _: &str, _: Duration) -> StorageResult<i64> {
            Self::fail()
        }
        fn get(&self, _: &str) -> StorageResult<f64> {
            Self::fail()
        }
        fn set(&self, _: &str, _: f64, _: Duration) -> StorageResult<()> {
            Self::fail()
        }
        fn append_list(&self, _: &str, _: i64, _: Duration) -> StorageResult<()> {
            Self::fail()
        }
        fn get_list(&self, _: &str) -> StorageResult<Vec<i64>> {
            Self::fail()
        }
        fn trim_list(&self, _: &str, _: usize) -> StorageResult<()> {
            Self::fail()
        }
        fn zadd(&self, _: &str, _: f64, _: &str, _: Duration) -> StorageResult<()> {
            Self::fail()
        }
        fn zrem_range_by_score(&self, _: &str, _: f64, _: f64) -> StorageResult<usize> {
            Self::fail()
        }
        fn zcard(&self, _: &str) -> StorageResult<usize> {
            Self::fail()
        }
        fn zrange_by_score(&self, _: &str, _: f64, _: f64) -> StorageResult<Vec<String>> {
            Self::fail()
        }
        fn hmset(&self, _: &str, _: &[(&str, f64)], _: Duration) -> StorageResult<()> {
            Self::fail()
        }
        fn hmget(&self, _: &str, _: &[&str]) -> StorageResult<Vec<Option<f64>>> {
            Self::fail()
        }
        fn eval(&self, _: &str, _: &dyn Script) -> StorageResult<i64> {
            Self::fail()
        }
    }

    #[test]
    fn test_fixed_window_scenario() {
        let (clock, limiter) = limiter(Strategy::FixedWindow, 3, Duration::from_secs(2));

        for i in 1..=3 {
            assert!(limiter.allow("user").is_allowed(), "call {}", i);
        }
        assert_eq!(limiter.allow("user"), Decision::deny());

        clock.advance(Duration::from_millis(2100));
        assert_eq!(limiter.allow("user"), Decision::allow());
    }

    #[test]
    fn test_token_bucket_scenario() {
        let (clock, limiter) = limiter(Strategy::TokenBucket, 3, Duration::from_secs(1));

        for i in 1..=3 {
            assert!(limiter.allow("user").is_allowed(), "call {}", i);
        }
        assert!(!limiter.allow("user").is_allowed());

        clock.advance(Duration::from_millis(334));
        assert!(limiter.allow("user").is_allowed());
    }

    #[test]
    fn test_leaky_bucket_scenario() {
        let (clock, limiter) = limiter(Strategy::LeakyBucket, 2, Duration::from_millis(200));

        assert!(limiter.allow("user").is_allowed());
        assert!(limiter.allow("user").is_allowed());
        assert!(!limiter.allow("user").is_allowed());

        clock.advance(Duration::from_millis(210));
        assert!(limiter.allow("user").is_allowed());
    }

    #[test]
    fn test_sliding_window_scenario() {
        for mode in [SlidingWindowMode::Precise, SlidingWindowMode::Weighted] {
            let clock = Arc::new(ManualClock::new(START));
            let mut config =
                LimiterConfig::new(Strategy::SlidingWindow, 2, Duration::from_millis(120));
            config.sliding_window = mode;
            let limiter = RateLimiter::builder(config)
                .clock(clock.clone())
                .build()
                .unwrap();

            assert!(limiter.allow("user").is_allowed(), "{:?}", mode);
            assert!(limiter.allow("user").is_allowed(), "{:?}", mode);
            assert!(!limiter.allow("user").is_allowed(), "{:?}", mode);

            clock.advance(Duration::from_millis(130));
            assert!(limiter.allow("user").is_allowed(), "{:?}", mode);
        }
    }

    #[test]
    fn test_keys_are_limited_independently() {
        let (_clock, limiter) = limiter(Strategy::FixedWindow, 1, Duration::from_secs(1));

        assert!(limiter.allow("alice").is_allowed());
        assert!(!limiter.allow("alice").is_allowed());
        assert!(limiter.allow("bob").is_allowed());
    }

    #[test]
    fn test_concurrent_callers_admit_exactly_limit() {
        for strategy in Strategy::ALL {
            let (_clock, limiter) = limiter(strategy, 10, Duration::from_secs(60));
            let admitted = AtomicU64::new(0);

            std::thread::scope(|s| {
                for _ in 0..100 {
                    s.spawn(|| {
                        if limiter.allow("hot").is_allowed() {
                            admitted.fetch_add(1, Ordering::SeqCst);
                        }
                    });
                }
            });

            assert_eq!(admitted.load(Ordering::SeqCst), 10, "{}", strategy);
        }
    }

    #[test]
    fn test_fail_open_and_closed() {
        for (fail_open, expected) in [(true, true), (false, false)] {
            let mut config = LimiterConfig::new(Strategy::TokenBucket, 5, Duration::from_secs(1));
            config.fail_open = fail_open;
            let limiter = RateLimiter::builder(config)
                .storage(Arc::new(DownStorage))
                .build()
                .unwrap();

            let decision = limiter.allow("user");
            assert_eq!(decision.is_allowed(), expected);
            assert_eq!(
                decision.error(),
                Some(&BackendUnavailable::new("connection refused"))
            );
        }
    }

    #[test]
    fn test_unreachable_redis_is_a_per_call_failure() {
        let mut config = LimiterConfig::new(Strategy::FixedWindow, 5, Duration::from_secs(1));
        config.backend_url = Some("redis://127.0.0.1:1/".to_string());
        config.fail_open = true;
        let limiter = RateLimiter::from_config(config).unwrap();

        let decision = limiter.allow("user");
        assert!(decision.is_allowed());
        assert!(decision.is_degraded());
    }

    #[test]
    fn test_metrics_record_every_decision() {
        let metrics = Arc::new(CountingMetrics::default());
        let limiter = RateLimiter::builder(LimiterConfig::new(
            Strategy::FixedWindow,
            2,
            Duration::from_secs(1),
        ))
        .metrics(metrics.clone())
        .build()
        .unwrap();

        for _ in 0..5 {
            limiter.allow("user");
        }
        assert_eq!(metrics.allowed.load(Ordering::SeqCst), 2);
        assert_eq!(metrics.denied.load(Ordering::SeqCst), 3);
        assert_eq!(metrics.observed.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_metrics_record_policy_decisions() {
        for fail_open in [true, false] {
            let metrics = Arc::new(CountingMetrics::default());
            let mut config = LimiterConfig::new(Strategy::LeakyBucket, 2, Duration::from_secs(1));
            config.fail_open = fail_open;
            let limiter = RateLimiter::builder(config)
                .storage(Arc::new(DownStorage))
                .metrics(metrics.clone())
                .build()
                .unwrap();

            limiter.allow("user");
            assert_eq!(metrics.allowed.load(Ordering::SeqCst), fail_open as u64);
            assert_eq!(metrics.denied.load(Ordering::SeqCst), !fail_open as u64);
            assert_eq!(metrics.observed.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_invalid_configuration() {
        let zero_limit = LimiterConfig::new(Strategy::FixedWindow, 0, Duration::from_secs(1));
        assert!(matches!(
            RateLimiter::from_config(zero_limit),
            Err(TurnstileError::ConfigInvalid(_))
        ));

        let zero_window = LimiterConfig::new(Strategy::FixedWindow, 1, Duration::ZERO);
        assert!(matches!(
            RateLimiter::from_config(zero_window),
            Err(TurnstileError::ConfigInvalid(_))
        ));

        let mut bad_url = LimiterConfig::new(Strategy::FixedWindow, 1, Duration::from_secs(1));
        bad_url.backend_url = Some("not a url".to_string());
        assert!(matches!(
            RateLimiter::from_config(bad_url),
            Err(TurnstileError::ConfigInvalid(_))
        ));

        let mut colon_namespace =
            LimiterConfig::new(Strategy::FixedWindow, 1, Duration::from_secs(1));
        colon_namespace.namespace = Some("tenant:fw".to_string());
        assert!(matches!(
            RateLimiter::from_config(colon_namespace),
            Err(TurnstileError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_unknown_strategy() {
        let config = LimiterConfig::new(Strategy::TokenBucket, 1, Duration::from_secs(1));
        let result = RateLimiter::builder(config).registry(Registry::empty()).build();
        assert!(matches!(result, Err(TurnstileError::UnknownStrategy(_))));
    }

    #[test]
    fn test_namespaced_keys_share_one_backend() {
        let storage = Arc::new(MemoryStorage::new());
        let build = |strategy: Strategy, namespace: &str| {
            let mut config = LimiterConfig::new(strategy, 1, Duration::from_secs(1));
            config.namespace = Some(namespace.to_string());
            RateLimiter::builder(config)
                .storage(storage.clone())
                .build()
                .unwrap()
        };

        let fixed = build(Strategy::FixedWindow, "api");
        let bucket = build(Strategy::TokenBucket, "api");
        assert_eq!(fixed.storage_key("user").as_str(), "api:fw:user");

        assert!(fixed.allow("user").is_allowed());
        assert!(bucket.allow("user").is_allowed());
        assert!(!fixed.allow("user").is_allowed());
        assert_eq!(storage.len(), 2);
    }

    #[test]
    fn test_idle_keys_do_not_accumulate() {
        let clock = Arc::new(ManualClock::new(START));
        let storage = Arc::new(MemoryStorage::with_clock(clock.clone()));
        let limiter = RateLimiter::builder(LimiterConfig::new(
            Strategy::FixedWindow,
            5,
            Duration::from_millis(100),
        ))
        .clock(clock.clone())
        .storage(storage.clone())
        .build()
        .unwrap();

        for i in 0..10_000 {
            assert!(limiter.allow(&format!("10.0.{}.{}", i / 256, i % 256)).is_allowed());
        }
        assert_eq!(storage.len(), 10_000);

        clock.advance(Duration::from_secs(3600));
        for _ in 0..3 {
            assert!(limiter.allow("10.1.0.1").is_allowed());
        }
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn test_allow_request_uses_key_by() {
        let mut config = LimiterConfig::new(Strategy::FixedWindow, 1, Duration::from_secs(1));
        config.key_by = KeyBy::Custom;
        let limiter = RateLimiter::builder(config)
            .custom_key(|req| req.header("x-tenant").map(str::to_string))
            .build()
            .unwrap();

        let acme = RequestInfo::new().with_header("X-Tenant", "acme");
        assert!(limiter.allow_request(&acme).is_allowed());
        assert!(!limiter.allow_request(&acme).is_allowed());

        let globex = RequestInfo::new().with_header("X-Tenant", "globex");
        assert!(limiter.allow_request(&globex).is_allowed());
    }

    #[test]
    fn test_custom_key_by_requires_extractor() {
        let mut config = LimiterConfig::new(Strategy::FixedWindow, 1, Duration::from_secs(1));
        config.key_by = KeyBy::Custom;
        assert!(matches!(
            RateLimiter::from_config(config),
            Err(TurnstileError::ConfigInvalid(_))
        ));
    }
}
