//! Unit tests for the request scheduler

use gen_broker::config::SchedulerConfig;
use gen_broker::error::AppError;
use gen_broker::queue::scheduler::work;
use gen_broker::queue::{EnqueueOptions, QueueStatus, RequestScheduler, Tier, Work};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

fn config() -> SchedulerConfig {
    SchedulerConfig {
        max_concurrent: 1,
        max_queue_size: 10,
        request_timeout_ms: 60_000,
        queue_timeout_ms: 30_000,
        retry_attempts: 3,
        retry_delay_ms: 100,
        user_rate_limit: 100,
        user_rate_window_ms: 60_000,
        ..Default::default()
    }
}

fn opts(owner: &str) -> EnqueueOptions {
    EnqueueOptions::new(owner, Tier::Free)
}

/// Work that runs until `gate` is notified
fn gated(gate: Arc<Notify>) -> Work<&'static str> {
    work(move || {
        let gate = gate.clone();
        async move {
            gate.notified().await;
            Ok("blocker")
        }
    })
}

/// Work that appends its label to `log` when it runs
fn logged(label: &'static str, log: Arc<Mutex<Vec<&'static str>>>) -> Work<&'static str> {
    work(move || {
        let log = log.clone();
        async move {
            log.lock().push(label);
            Ok(label)
        }
    })
}

#[tokio::test(start_paused = true)]
async fn test_active_never_exceeds_max_concurrent() {
    let scheduler = RequestScheduler::<usize>::new(SchedulerConfig {
        max_concurrent: 2,
        ..config()
    });
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for i in 0..6 {
        let running = running.clone();
        let peak = peak.clone();
        let task = work(move || {
            let running = running.clone();
            let peak = peak.clone();
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(i)
            }
        });
        handles.push(scheduler.enqueue(format!("task-{i}"), task, opts("alice")).unwrap());
    }

    assert_eq!(scheduler.stats().active, 2);
    assert_eq!(scheduler.stats().queued, 4);

    let results = futures::future::join_all(handles).await;
    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(peak.load(Ordering::SeqCst), 2);

    let stats = scheduler.stats();
    assert_eq!(stats.peak_active, 2);
    assert_eq!(stats.completed, 6);
    assert_eq!(stats.active, 0);
}

#[tokio::test(start_paused = true)]
async fn test_priority_then_arrival_order() {
    let scheduler = RequestScheduler::new(config());
    let gate = Arc::new(Notify::new());
    let log = Arc::new(Mutex::new(Vec::new()));

    let blocker = scheduler.enqueue("blocker", gated(gate.clone()), opts("alice")).unwrap();
    let first = scheduler
        .enqueue("first", logged("first-1", log.clone()), opts("alice").with_priority(1))
        .unwrap();
    let low = scheduler
        .enqueue("low", logged("0", log.clone()), opts("alice").with_priority(0))
        .unwrap();
    let second = scheduler
        .enqueue("second", logged("second-1", log.clone()), opts("alice").with_priority(1))
        .unwrap();

    gate.notify_one();
    assert_eq!(blocker.await.unwrap(), "blocker");
    first.await.unwrap();
    second.await.unwrap();
    low.await.unwrap();

    assert_eq!(*log.lock(), vec!["first-1", "second-1", "0"]);
}

#[tokio::test(start_paused = true)]
async fn test_high_priority_arrival_runs_next() {
    let scheduler = RequestScheduler::new(config());
    let gate = Arc::new(Notify::new());
    let log = Arc::new(Mutex::new(Vec::new()));

    // A (priority 0) is running; B (priority 1) arrives, then C (priority 0)
    let a = scheduler.enqueue("a", gated(gate.clone()), opts("alice")).unwrap();
    let b = scheduler
        .enqueue("b", logged("b", log.clone()), opts("bob").with_priority(1))
        .unwrap();
    let c = scheduler
        .enqueue("c", logged("c", log.clone()), opts("carol").with_priority(0))
        .unwrap();

    match scheduler.status("b") {
        Some(QueueStatus::Queued { position, .. }) => assert_eq!(position, 1),
        other => panic!("unexpected status: {other:?}"),
    }

    gate.notify_one();
    a.await.unwrap();
    b.await.unwrap();
    c.await.unwrap();
    assert_eq!(*log.lock(), vec!["b", "c"]);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_queued_task_never_runs() {
    let scheduler = RequestScheduler::new(config());
    let gate = Arc::new(Notify::new());
    let ran = Arc::new(AtomicBool::new(false));

    let blocker = scheduler.enqueue("blocker", gated(gate.clone()), opts("alice")).unwrap();
    let ran_flag = ran.clone();
    let queued = scheduler
        .enqueue(
            "queued",
            work(move || {
                let ran = ran_flag.clone();
                async move {
                    ran.store(true, Ordering::SeqCst);
                    Ok("queued")
                }
            }),
            opts("alice"),
        )
        .unwrap();

    assert!(matches!(scheduler.cancel("queued", "mallory"), Err(AppError::Forbidden(_))));
    assert!(matches!(scheduler.cancel("missing", "alice"), Err(AppError::TaskNotFound(_))));
    assert!(matches!(scheduler.cancel("blocker", "alice"), Err(AppError::NotCancellable(_))));

    scheduler.cancel("queued", "alice").unwrap();
    assert!(matches!(queued.await, Err(AppError::Cancelled)));
    assert!(scheduler.status("queued").is_none());

    gate.notify_one();
    blocker.await.unwrap();
    tokio::task::yield_now().await;
    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(scheduler.stats().queued, 0);
}

fn flaky(calls: Arc<AtomicU32>, failures: u32) -> Work<u32> {
    work(move || {
        let calls = calls.clone();
        async move {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= failures {
                Err(AppError::Transport("connection reset by peer".to_string()))
            } else {
                Ok(call)
            }
        }
    })
}

#[tokio::test(start_paused = true)]
async fn test_retry_succeeds_within_attempts() {
    let scheduler = RequestScheduler::new(config());
    let calls = Arc::new(AtomicU32::new(0));

    let result = scheduler
        .schedule("flaky", flaky(calls.clone(), 2), opts("alice"))
        .await
        .unwrap();

    assert_eq!(result, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_retry_exhaustion_fails() {
    let scheduler = RequestScheduler::new(config());
    let calls = Arc::new(AtomicU32::new(0));

    let err = scheduler
        .schedule("broken", flaky(calls.clone(), 3), opts("alice"))
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Transport(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(scheduler.stats().failed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_grows_with_attempt_number() {
    let scheduler = RequestScheduler::new(SchedulerConfig {
        retry_delay_ms: 1_000,
        ..config()
    });
    let calls = Arc::new(AtomicU32::new(0));
    let started = tokio::time::Instant::now();

    scheduler
        .schedule("flaky", flaky(calls, 2), opts("alice"))
        .await
        .unwrap();

    // 1s after the first failure, 2s after the second
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(3_000), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(3_100), "elapsed {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn test_non_retryable_failure_is_not_retried() {
    let scheduler = RequestScheduler::<()>::new(config());
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let err = scheduler
        .schedule(
            "misconfigured",
            work(move || {
                let calls = counter.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(AppError::ProviderMisconfigured("no model".to_string()))
                }
            }),
            opts("alice"),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::ProviderMisconfigured(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_backoff_wins_over_retry() {
    let scheduler = RequestScheduler::new(SchedulerConfig {
        retry_delay_ms: 10_000,
        ..config()
    });
    let calls = Arc::new(AtomicU32::new(0));

    let handle = scheduler
        .enqueue("flaky", flaky(calls.clone(), 3), opts("alice"))
        .unwrap();

    // Let the first attempt fail and enter backoff
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(scheduler.stats().backing_off, 1);

    scheduler.cancel("flaky", "alice").unwrap();
    assert!(matches!(handle.await, Err(AppError::Cancelled)));

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_queue_timeout_settles_once() {
    let scheduler = RequestScheduler::new(SchedulerConfig {
        queue_timeout_ms: 1_000,
        ..config()
    });
    let gate = Arc::new(Notify::new());
    let log = Arc::new(Mutex::new(Vec::new()));

    let _blocker = scheduler.enqueue("blocker", gated(gate.clone()), opts("alice")).unwrap();
    let waiting = scheduler
        .enqueue("waiting", logged("waiting", log.clone()), opts("alice"))
        .unwrap();

    let err = waiting.await.unwrap_err();
    assert!(matches!(err, AppError::QueueTimeout(1_000)));
    assert_eq!(scheduler.stats().queued, 0);
    assert!(scheduler.status("waiting").is_none());

    // Freeing the slot must not run the expired task
    gate.notify_one();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(log.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_request_timeout_aborts_running_task() {
    let scheduler = RequestScheduler::new(SchedulerConfig {
        request_timeout_ms: 1_000,
        ..config()
    });
    let log = Arc::new(Mutex::new(Vec::new()));

    let slow = scheduler
        .enqueue(
            "slow",
            work(|| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok("slow")
            }),
            opts("alice"),
        )
        .unwrap();

    // Enqueued later so its own deadline falls after the slow task's
    tokio::time::sleep(Duration::from_millis(500)).await;
    let next = scheduler
        .enqueue("next", logged("next", log.clone()), opts("alice"))
        .unwrap();

    assert!(matches!(slow.await, Err(AppError::RequestTimeout(1_000))));
    // The freed slot goes to the next task
    assert_eq!(next.await.unwrap(), "next");
    assert_eq!(scheduler.stats().active, 0);
}

#[tokio::test(start_paused = true)]
async fn test_status_channel_reports_position_then_processing() {
    let scheduler = RequestScheduler::new(config());
    let gate = Arc::new(Notify::new());
    let (status_tx, mut status_rx) = mpsc::channel(8);

    let blocker = scheduler.enqueue("blocker", gated(gate.clone()), opts("alice")).unwrap();
    let watched = scheduler
        .enqueue(
            "watched",
            work(|| async { Ok("watched") }),
            opts("bob").with_status(status_tx),
        )
        .unwrap();

    match status_rx.recv().await {
        Some(QueueStatus::Queued {
            position,
            total_in_system,
            ..
        }) => {
            assert_eq!(position, 1);
            assert_eq!(total_in_system, 2);
        }
        other => panic!("unexpected status: {other:?}"),
    }

    gate.notify_one();
    blocker.await.unwrap();
    assert_eq!(status_rx.recv().await, Some(QueueStatus::Processing));
    assert_eq!(watched.await.unwrap(), "watched");
}

#[tokio::test(start_paused = true)]
async fn test_queue_full_refunds_rate_slot() {
    let scheduler = RequestScheduler::new(SchedulerConfig {
        max_queue_size: 1,
        user_rate_limit: 5,
        ..config()
    });
    let gate = Arc::new(Notify::new());

    let _running = scheduler.enqueue("running", gated(gate.clone()), opts("alice")).unwrap();
    let _queued = scheduler.enqueue("queued", gated(gate.clone()), opts("alice")).unwrap();
    let rejected = scheduler.enqueue("rejected", gated(gate.clone()), opts("alice"));

    assert!(matches!(rejected, Err(AppError::QueueFull(1))));
    assert_eq!(scheduler.rate_limiter().remaining("alice", Tier::Free), 3);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_id_is_rejected() {
    let scheduler = RequestScheduler::new(config());
    let gate = Arc::new(Notify::new());

    let _first = scheduler.enqueue("same", gated(gate.clone()), opts("alice")).unwrap();
    let second = scheduler.enqueue("same", gated(gate.clone()), opts("alice"));
    assert!(matches!(second, Err(AppError::InvalidRequest(_))));
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_scales_with_tier() {
    let scheduler = RequestScheduler::new(SchedulerConfig {
        user_rate_limit: 2,
        max_queue_size: 100,
        ..config()
    });
    let gate = Arc::new(Notify::new());

    let mut accepted = 0;
    for i in 0..10 {
        if scheduler
            .enqueue(format!("free-{i}"), gated(gate.clone()), opts("free-user"))
            .is_ok()
        {
            accepted += 1;
        }
    }
    assert_eq!(accepted, 2);

    let mut premium = 0;
    for i in 0..10 {
        let options = EnqueueOptions::new("premium-user", Tier::Premium);
        match scheduler.enqueue(format!("premium-{i}"), gated(gate.clone()), options) {
            Ok(_) => premium += 1,
            Err(e) => assert!(matches!(e, AppError::RateLimited { limit: 6, .. })),
        }
    }
    assert_eq!(premium, 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_admission_respects_limit() {
    let scheduler = RequestScheduler::new(SchedulerConfig {
        user_rate_limit: 7,
        max_queue_size: 1_000,
        ..config()
    });
    let gate = Arc::new(Notify::new());

    let mut joins = Vec::new();
    for i in 0..64 {
        let scheduler = scheduler.clone();
        let gate = gate.clone();
        joins.push(tokio::spawn(async move {
            scheduler
                .enqueue(format!("burst-{i}"), gated(gate), opts("racer"))
                .is_ok()
        }));
    }

    let mut accepted = 0;
    for join in joins {
        if join.await.unwrap() {
            accepted += 1;
        }
    }
    assert_eq!(accepted, 7);
}

#[tokio::test(start_paused = true)]
async fn test_panicking_work_frees_its_slot() {
    let scheduler = RequestScheduler::new(config());
    let log = Arc::new(Mutex::new(Vec::new()));
    let explode = Arc::new(AtomicBool::new(true));

    let boom = scheduler
        .enqueue(
            "boom",
            work(move || {
                let explode = explode.clone();
                async move {
                    if explode.load(Ordering::SeqCst) {
                        panic!("worker blew up");
                    }
                    Ok("boom")
                }
            }),
            opts("alice"),
        )
        .unwrap();
    let next = scheduler.enqueue("next", logged("next", log.clone()), opts("alice")).unwrap();

    let started = tokio::time::Instant::now();
    match boom.await {
        Err(AppError::Internal(message)) => assert!(message.contains("worker blew up"), "{message}"),
        other => panic!("expected internal error, got {other:?}"),
    }
    assert_eq!(next.await.unwrap(), "next");
    assert!(started.elapsed() < Duration::from_secs(1));

    let stats = scheduler.stats();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(*log.lock(), vec!["next"]);
}

#[tokio::test]
async fn test_work_may_inspect_scheduler_when_started() {
    let scheduler = RequestScheduler::new(config());
    let observer = scheduler.clone();

    let task = work(move || {
        let active = observer.stats().active;
        async move { Ok(active) }
    });
    let handle = scheduler.enqueue("introspect", task, opts("alice")).unwrap();

    assert_eq!(handle.await.unwrap(), 1);
    assert_eq!(scheduler.stats().completed, 1);
}
