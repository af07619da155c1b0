//! Redis backend tests.
//!
//! Tests marked `#[ignore]` need a live server:
//! `TURNSTILE_REDIS_URL=redis://127.0.0.1:6379/ cargo test -- --ignored`

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use turnstile::config::{LimiterConfig, RedisConfig, SlidingWindowMode, Strategy};
use turnstile::ratelimit::{Limiter, RateLimiter};
use turnstile::storage::{RedisStorage, Storage};

fn redis_url() -> String {
    std::env::var("TURNSTILE_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/".to_string())
}

/// Namespace per test run so parallel or repeated runs start from fresh keys.
fn namespace(test: &str) -> String {
    format!("turnstile-test-{}-{:08x}", test, rand::random::<u32>())
}

fn limiter(strategy: Strategy, limit: u64, window: Duration, test: &str) -> RateLimiter {
    let mut config = LimiterConfig::new(strategy, limit, window);
    config.backend_url = Some(redis_url());
    config.namespace = Some(namespace(test));
    RateLimiter::from_config(config).unwrap()
}

#[test]
fn test_unreachable_server_follows_fail_policy() {
    for fail_open in [true, false] {
        let mut config = LimiterConfig::new(Strategy::TokenBucket, 5, Duration::from_secs(1));
        config.backend_url = Some("redis://127.0.0.1:1/".to_string());
        config.fail_open = fail_open;
        let limiter = RateLimiter::from_config(config).unwrap();

        let decision = limiter.allow("user");
        assert_eq!(decision.is_allowed(), fail_open);
        assert!(decision.error().is_some());
    }
}

#[test]
fn test_malformed_url_is_rejected_at_construction() {
    assert!(RedisStorage::open("definitely not a url", &RedisConfig::default()).is_err());
}

#[test]
#[ignore]
fn test_fixed_window_scenario() {
    let limiter = limiter(Strategy::FixedWindow, 3, Duration::from_secs(2), "fw");

    for i in 1..=3 {
        assert!(limiter.allow("user").is_allowed(), "call {}", i);
    }
    assert!(!limiter.allow("user").is_allowed());

    std::thread::sleep(Duration::from_millis(2100));
    assert!(limiter.allow("user").is_allowed());
}

#[test]
#[ignore]
fn test_token_bucket_scenario() {
    let limiter = limiter(Strategy::TokenBucket, 3, Duration::from_secs(1), "tb");

    for i in 1..=3 {
        assert!(limiter.allow("user").is_allowed(), "call {}", i);
    }
    assert!(!limiter.allow("user").is_allowed());

    std::thread::sleep(Duration::from_millis(340));
    assert!(limiter.allow("user").is_allowed());
}

#[test]
#[ignore]
fn test_leaky_bucket_scenario() {
    let limiter = limiter(Strategy::LeakyBucket, 2, Duration::from_millis(200), "lb");

    assert!(limiter.allow("user").is_allowed());
    assert!(limiter.allow("user").is_allowed());
    assert!(!limiter.allow("user").is_allowed());

    std::thread::sleep(Duration::from_millis(210));
    assert!(limiter.allow("user").is_allowed());
}

#[test]
#[ignore]
fn test_sliding_window_scenario() {
    for mode in [SlidingWindowMode::Precise, SlidingWindowMode::Weighted] {
        let mut config = LimiterConfig::new(Strategy::SlidingWindow, 2, Duration::from_millis(120));
        config.backend_url = Some(redis_url());
        config.namespace = Some(namespace("sw"));
        config.sliding_window = mode;
        let limiter = RateLimiter::from_config(config).unwrap();

        assert!(limiter.allow("user").is_allowed(), "{:?}", mode);
        assert!(limiter.allow("user").is_allowed(), "{:?}", mode);
        assert!(!limiter.allow("user").is_allowed(), "{:?}", mode);

        std::thread::sleep(Duration::from_millis(130));
        assert!(limiter.allow("user").is_allowed(), "{:?}", mode);
    }
}

#[test]
#[ignore]
fn test_concurrent_callers_admit_exactly_limit() {
    for strategy in [
        Strategy::FixedWindow,
        Strategy::SlidingWindow,
        Strategy::TokenBucket,
        Strategy::LeakyBucket,
    ] {
        // A long window keeps refill and drain negligible during the burst.
        let limiter = Arc::new(limiter(strategy, 10, Duration::from_secs(3600), "burst"));
        let admitted = AtomicU64::new(0);

        std::thread::scope(|s| {
            for _ in 0..50 {
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
#[ignore]
fn test_state_reads_back_unchanged() {
    let storage = RedisStorage::open(&redis_url(), &RedisConfig::default()).unwrap();
    let key = namespace("readback");
    let ttl = Duration::from_secs(5);

    let level = 2.0 / 3.0;
    let last_update = 1_700_000_000_123_456.0;
    storage
        .hmset(&key, &[("level", level), ("last_update", last_update)], ttl)
        .unwrap();
    assert_eq!(
        storage.hmget(&key, &["level", "last_update"]).unwrap(),
        vec![Some(level), Some(last_update)]
    );

    let scalar = format!("{}:scalar", key);
    storage.set(&scalar, 0.1 + 0.2, ttl).unwrap();
    assert_eq!(storage.get(&scalar).unwrap(), 0.1 + 0.2);
}

#[test]
#[ignore]
fn test_incr_keeps_first_expiry() {
    let storage = RedisStorage::open(&redis_url(), &RedisConfig::default()).unwrap();
    let key = namespace("incr");

    assert_eq!(storage.incr(&key, Duration::from_millis(300)).unwrap(), 1);
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(storage.incr(&key, Duration::from_millis(300)).unwrap(), 2);
    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(storage.incr(&key, Duration::from_millis(300)).unwrap(), 1);
}

#[test]
#[ignore]
fn test_list_and_sorted_set_ops() {
    let storage = RedisStorage::open(&redis_url(), &RedisConfig::default()).unwrap();
    let ttl = Duration::from_secs(5);

    let list = namespace("list");
    for value in [10, 20, 30] {
        storage.append_list(&list, value, ttl).unwrap();
    }
    storage.trim_list(&list, 2).unwrap();
    assert_eq!(storage.get_list(&list).unwrap(), vec![20, 30]);

    let zset = namespace("zset");
    storage.zadd(&zset, 1.0, "a", ttl).unwrap();
    storage.zadd(&zset, 2.0, "b", ttl).unwrap();
    storage.zadd(&zset, 3.0, "c", ttl).unwrap();
    assert_eq!(storage.zrem_range_by_score(&zset, f64::NEG_INFINITY, 1.0).unwrap(), 1);
    assert_eq!(storage.zcard(&zset).unwrap(), 2);
    assert_eq!(
        storage.zrange_by_score(&zset, 2.0, f64::INFINITY).unwrap(),
        vec!["b".to_string(), "c".to_string()]
    );
}

#[test]
#[ignore]
fn test_wrong_shape_read_is_backend_error() {
    let storage = RedisStorage::open(&redis_url(), &RedisConfig::default()).unwrap();
    let key = namespace("shape");
    storage.zadd(&key, 1.0, "m", Duration::from_secs(5)).unwrap();
    assert!(storage.get(&key).is_err());
}
