//! Unit tests for per-user rate limiting

use gen_broker::config::SchedulerConfig;
use gen_broker::error::AppError;
use gen_broker::queue::{Tier, UserRateLimiter};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

fn config(limit: u32) -> SchedulerConfig {
    SchedulerConfig {
        user_rate_limit: limit,
        user_rate_window_ms: 60_000,
        ..Default::default()
    }
}

#[test]
fn test_default_tier_limits() {
    let limiter = UserRateLimiter::new(&config(10));

    assert_eq!(limiter.effective_limit(Tier::Free), 10);
    assert_eq!(limiter.effective_limit(Tier::Supporter), 20);
    assert_eq!(limiter.effective_limit(Tier::Premium), 30);
}

#[test]
fn test_users_are_limited_independently() {
    let limiter = UserRateLimiter::new(&config(1));

    assert!(limiter.try_acquire("alice", Tier::Free).is_ok());
    assert!(limiter.try_acquire("bob", Tier::Free).is_ok());
    assert!(limiter.try_acquire("alice", Tier::Free).is_err());
    assert_eq!(limiter.tracked_users(), 2);
}

#[test]
fn test_rejection_reports_limit_and_window() {
    let limiter = UserRateLimiter::new(&config(1));
    limiter.try_acquire("alice", Tier::Free).unwrap();

    match limiter.try_acquire("alice", Tier::Free) {
        Err(AppError::RateLimited { limit, window_secs }) => {
            assert_eq!(limit, 1);
            assert_eq!(window_secs, 60);
        }
        other => panic!("expected rate limit, got {other:?}"),
    }
}

#[test]
fn test_tier_is_remembered() {
    let limiter = UserRateLimiter::new(&config(5));
    limiter.try_acquire("alice", Tier::Supporter).unwrap();
    assert_eq!(limiter.tier_of("alice"), Some(Tier::Supporter));
    assert_eq!(limiter.tier_of("nobody"), None);
}

#[test]
fn test_concurrent_acquire_admits_exactly_limit() {
    let mut cfg = config(5);
    cfg.tier_multipliers.insert(Tier::Supporter, 1.5);
    let limiter = Arc::new(UserRateLimiter::new(&cfg));

    // floor(5 * 1.5)
    assert_eq!(limiter.effective_limit(Tier::Supporter), 7);

    let threads = 32;
    let barrier = Arc::new(Barrier::new(threads));
    let accepted = Arc::new(AtomicU32::new(0));

    let workers: Vec<_> = (0..threads)
        .map(|_| {
            let limiter = limiter.clone();
            let barrier = barrier.clone();
            let accepted = accepted.clone();
            thread::spawn(move || {
                barrier.wait();
                if limiter.try_acquire("racer", Tier::Supporter).is_ok() {
                    accepted.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(accepted.load(Ordering::SeqCst), 7);
    assert_eq!(limiter.remaining("racer", Tier::Supporter), 0);
}

#[test]
fn test_zero_multiplier_blocks_everything() {
    let mut cfg = config(10);
    cfg.tier_multipliers.insert(Tier::Free, 0.0);
    let limiter = UserRateLimiter::new(&cfg);

    assert_eq!(limiter.effective_limit(Tier::Free), 0);
    assert!(limiter.try_acquire("alice", Tier::Free).is_err());
}
