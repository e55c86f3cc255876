//! End-to-end scheduling scenarios against the public `Manager` API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use throttle_core::ThrottleConfig;
use throttle_scheduler::fallback;
use throttle_scheduler::{
    FallbackReason, Manager, Outcome, PriorityTier, Response, Submission, ThrottleError,
};
use tokio::sync::oneshot;
use tokio::time::Instant;

fn start(tune: impl FnOnce(&mut ThrottleConfig)) -> Arc<Manager> {
    let mut config = ThrottleConfig::default();
    tune(&mut config);
    let manager = Manager::new(config);
    manager.start().unwrap();
    manager
}

fn spawn_submit(manager: &Arc<Manager>, submission: Submission) -> tokio::task::JoinHandle<Response> {
    let manager = Arc::clone(manager);
    tokio::spawn(async move { manager.submit(submission).await })
}

/// Tracks how many work items run at once.
#[derive(Default)]
struct Concurrency {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Concurrency {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

#[tokio::test(start_paused = true)]
async fn protected_request_overtakes_hundred_background_jobs() {
    for permits in [1, 5] {
        let m = start(|c| {
            c.max_concurrent = 5;
            c.background_permits = permits;
        });
        let conc = Arc::new(Concurrency::default());
        let finished = Arc::new(Mutex::new(Vec::new()));

        let mut background = Vec::new();
        for i in 0..100 {
            let conc = conc.clone();
            let finished = finished.clone();
            let tier = [
                PriorityTier::SystemMaintenance,
                PriorityTier::BackgroundProcessing,
                PriorityTier::ConsciousnessCycle,
            ][i % 3];
            background.push(spawn_submit(
                &m,
                Submission::new(tier, move || async move {
                    conc.enter();
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    conc.exit();
                    finished.lock().unwrap().push(format!("bg-{i}"));
                    Ok(json!(i))
                }),
            ));
        }

        let user_finished = finished.clone();
        let user = spawn_submit(
            &m,
            Submission::new(PriorityTier::UserConversation, move || async move {
                user_finished.lock().unwrap().push("user".to_string());
                Ok(json!("reply"))
            }),
        );

        let user = user.await.unwrap();
        assert!(user.is_completed());
        for handle in background {
            assert!(handle.await.unwrap().is_completed());
        }

        assert_eq!(finished.lock().unwrap().first().map(String::as_str), Some("user"));
        let peak = conc.peak.load(Ordering::SeqCst);
        assert!(peak <= permits, "peak concurrency {peak} exceeded {permits}");

        let stats = m.stats();
        let user_counters = &stats.tiers[&PriorityTier::UserConversation];
        assert_eq!(user_counters.bypassed, 1);
        assert_eq!(user_counters.admitted, 0, "protected work never enters the queue");
        m.stop().await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn background_inside_pause_window_gets_deferred_marker() {
    let m = start(|_| {});
    let user = m
        .submit(
            Submission::new(PriorityTier::UserInteraction, || async { Ok(json!("hi")) })
                .submitter("U"),
        )
        .await;
    assert!(user.is_completed());

    let ran = Arc::new(AtomicUsize::new(0));
    let counter = ran.clone();
    let resp = m
        .submit(Submission::new(PriorityTier::BackgroundProcessing, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!("ran"))
        }))
        .await;

    assert!(fallback::is_deferred(resp.value()));
    assert_eq!(resp.value()["reason"], "denied");
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(resp.clone().into_result(), Err(ThrottleError::FallbackServed));

    // once the window passes, background work runs again
    tokio::time::sleep(Duration::from_secs(31)).await;
    let later = m
        .submit(Submission::new(PriorityTier::BackgroundProcessing, || async {
            Ok(json!("ran"))
        }))
        .await;
    assert_eq!(later.value(), &json!("ran"));
    m.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn slow_work_times_out_and_late_result_is_discarded() {
    let m = start(|_| {});
    let started = Instant::now();

    let resp = m
        .submit(
            Submission::new(PriorityTier::SystemMaintenance, || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(json!("late"))
            })
            .cache_key("slow")
            .timeout(Duration::from_secs(1)),
        )
        .await;

    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(1) && waited < Duration::from_millis(1100));
    assert_eq!(resp.fallback_reason(), Some(FallbackReason::Timeout));
    assert!(fallback::is_deferred(resp.value()));

    // let the work item finish in the background
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(m.stats().cache_size, 0);
    assert_eq!(m.stats().active_requests, 0);
    m.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn protected_timeout_gets_neutral_stand_in() {
    let m = start(|_| {});
    let resp = m
        .submit(
            Submission::new(PriorityTier::UserConversation, || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(json!("late"))
            })
            .submitter("U")
            .timeout(Duration::from_secs(1)),
        )
        .await;

    assert_eq!(resp.fallback_reason(), Some(FallbackReason::Timeout));
    assert!(!fallback::is_deferred(resp.value()));
    assert_eq!(resp.value()["status"], "ok");
    let text = resp.value().to_string().to_lowercase();
    for word in ["defer", "throttl", "paused", "queue", "background"] {
        assert!(!text.contains(word), "stand-in leaks {word:?}: {text}");
    }
    m.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn cache_hit_within_ttl_and_miss_after() {
    let m = start(|_| {});
    let calls = Arc::new(AtomicUsize::new(0));
    let job = || {
        let calls = calls.clone();
        Submission::new(PriorityTier::BackgroundProcessing, move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(json!({ "run": n }))
        })
        .cache_key("summary")
    };

    let first = m.submit(job()).await;
    assert_eq!(first.value()["run"], 1);

    tokio::time::sleep(Duration::from_secs(60)).await;
    let second = m.submit(job()).await;
    assert!(second.is_cached());
    assert_eq!(second.value()["run"], 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_secs(300)).await;
    let third = m.submit(job()).await;
    assert!(!third.is_cached());
    assert_eq!(third.value()["run"], 2);
    m.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn same_tier_runs_in_submission_order() {
    let m = start(|_| {});
    let order = Arc::new(Mutex::new(Vec::new()));
    let job = |name: &'static str| {
        let order = order.clone();
        Submission::new(PriorityTier::BackgroundProcessing, move || async move {
            order.lock().unwrap().push(name);
            Ok(json!(name))
        })
    };

    let (a, b) = tokio::join!(m.submit(job("A")), m.submit(job("B")));
    assert!(a.is_completed() && b.is_completed());
    assert_eq!(*order.lock().unwrap(), vec!["A", "B"]);
    m.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn higher_tier_jumps_the_queue() {
    let m = start(|c| c.max_concurrent = 1);

    // a live user request occupies the only slot
    let (release, hold) = oneshot::channel::<()>();
    let user = spawn_submit(
        &m,
        Submission::new(PriorityTier::UserConversation, move || async move {
            let _ = hold.await;
            Ok(json!("user"))
        }),
    );
    tokio::time::sleep(Duration::from_millis(1)).await;

    let order = Arc::new(Mutex::new(Vec::new()));
    let job = |tier: PriorityTier| {
        let order = order.clone();
        Submission::new(tier, move || async move {
            order.lock().unwrap().push(tier);
            Ok(json!(tier.as_str()))
        })
        .timeout(Duration::from_secs(60))
    };
    let low = spawn_submit(&m, job(PriorityTier::ConsciousnessCycle));
    let high = spawn_submit(&m, job(PriorityTier::SystemMaintenance));
    tokio::time::sleep(Duration::from_millis(500)).await;

    release.send(()).unwrap();
    user.await.unwrap();
    low.await.unwrap();
    high.await.unwrap();
    assert_eq!(
        *order.lock().unwrap(),
        vec![PriorityTier::SystemMaintenance, PriorityTier::ConsciousnessCycle]
    );
    m.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn repeated_timeouts_never_cache_a_fallback() {
    let m = start(|_| {});
    for _ in 0..3 {
        let resp = m
            .submit(
                Submission::new(PriorityTier::ConsciousnessCycle, || async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(json!("slow"))
                })
                .cache_key("reflection")
                .timeout(Duration::from_secs(1)),
            )
            .await;
        assert_eq!(resp.fallback_reason(), Some(FallbackReason::Timeout));
    }
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(m.stats().cache_size, 0);

    let fresh = m
        .submit(
            Submission::new(PriorityTier::ConsciousnessCycle, || async { Ok(json!("fast")) })
                .cache_key("reflection"),
        )
        .await;
    assert!(!fresh.is_cached());
    assert_eq!(fresh.value(), &json!("fast"));
    m.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn protected_execution_error_is_surfaced() {
    let m = start(|_| {});
    let resp = m
        .submit(Submission::new(PriorityTier::UserConversation, || async {
            Err(anyhow::anyhow!("model unavailable"))
        }))
        .await;

    match &resp.outcome {
        Outcome::Failed { error, value } => {
            assert!(error.contains("model unavailable"));
            assert!(!fallback::is_deferred(value));
        }
        other => panic!("expected surfaced failure, got {other:?}"),
    }
    assert!(matches!(resp.into_result(), Err(ThrottleError::Execution(_))));
    m.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn background_panic_becomes_fallback() {
    let m = start(|_| {});
    fn explode() -> anyhow::Result<serde_json::Value> {
        panic!("worker bug")
    }
    let resp = m
        .submit(Submission::new(PriorityTier::BackgroundProcessing, || async { explode() }))
        .await;
    assert_eq!(resp.fallback_reason(), Some(FallbackReason::ExecutionError));

    let next = m
        .submit(Submission::new(PriorityTier::BackgroundProcessing, || async { Ok(json!(1)) }))
        .await;
    assert!(next.is_completed());
    m.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn stats_serialize_for_monitoring() {
    let m = start(|_| {});
    m.submit(Submission::new(PriorityTier::UserInteraction, || async { Ok(json!(1)) }))
        .await;

    let stats = serde_json::to_value(m.stats()).unwrap();
    assert_eq!(stats["queue_depth"], 0);
    assert_eq!(stats["tiers"]["user_interaction"]["completed"], 1);
    assert_eq!(stats["pause_active"], false);
    m.stop().await.unwrap();
}
