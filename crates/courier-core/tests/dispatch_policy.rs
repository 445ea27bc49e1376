//! Share of dispatched work per queue under each dispatch policy.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use courier_core::app::{AppBuilder, EnqueueOptions, ShutdownCoordinator};
use courier_core::typed::handler_fn;
use courier_core::{CourierConfig, DispatchPolicy};

use common::{build, config};

const PER_QUEUE: usize = 1000;
const SAMPLES: usize = 1000;

/// Runs `SAMPLES` tasks on a single slot with every queue backlogged, then
/// reports the fraction dispatched from each queue.
async fn dispatch_shares(policy: DispatchPolicy) -> (f64, f64, f64) {
    let coordinator: Arc<OnceLock<Arc<ShutdownCoordinator>>> = Arc::default();
    let executed = Arc::new(AtomicUsize::new(0));

    let stop = Arc::clone(&coordinator);
    let count = Arc::clone(&executed);
    let (app, _broker) = build(
        AppBuilder::new(CourierConfig {
            concurrency: 1,
            dispatch_policy: policy,
            ..config()
        })
        .register_dyn(
            "count",
            Arc::new(handler_fn(move |_ctx, _p| {
                let n = count.fetch_add(1, Ordering::SeqCst) + 1;
                if n == SAMPLES {
                    if let Some(coordinator) = stop.get() {
                        coordinator.request_shutdown("enough samples");
                    }
                }
                async { Ok(()) }
            })),
        )
        .unwrap(),
    );
    assert!(coordinator.set(Arc::clone(app.coordinator())).is_ok());

    for queue in ["critical", "default", "low"] {
        for _ in 0..PER_QUEUE {
            app.client()
                .enqueue("count", vec![], EnqueueOptions::new().queue(queue), None)
                .await
                .unwrap();
        }
    }

    let stats = app.spawn_dispatcher().await.unwrap();
    assert!(app.coordinator().drain(std::time::Duration::from_secs(5)).await.is_graceful());
    assert_eq!(stats.total(), SAMPLES as u64);

    let total = stats.total() as f64;
    let share = |q: &str| stats.per_queue.get(q).copied().unwrap_or(0) as f64 / total;
    (share("critical"), share("default"), share("low"))
}

#[tokio::test(start_paused = true)]
async fn weighted_fair_converges_to_weight_shares() {
    let (critical, default, low) = dispatch_shares(DispatchPolicy::WeightedFair).await;

    assert!((critical - 0.6).abs() <= 0.05, "critical share {critical}");
    assert!((default - 0.3).abs() <= 0.05, "default share {default}");
    assert!((low - 0.1).abs() <= 0.05, "low share {low}");
}

#[tokio::test(start_paused = true)]
async fn strict_serves_highest_weight_first() {
    let (critical, default, low) = dispatch_shares(DispatchPolicy::Strict).await;

    // critical に 1000 件あるうちは下位の queue に回らない
    assert_eq!(critical, 1.0);
    assert_eq!(default, 0.0);
    assert_eq!(low, 0.0);
}
