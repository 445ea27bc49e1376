//! WorkerPool - 固定数の slot で handler を実行する
//!
//! # 1 件の流れ
//! 1. decode（失敗 → dead-letter、リトライしない）
//! 2. in-flight set に admit（Draining 以降なら lease を返却して終わり）
//! 3. handler を lookup（未登録 → dead-letter）
//! 4. 別 task で handler を実行し、`timeout` で打ち切る
//! 5. RetryPolicy で判断 → ack / retry / dead-letter
//!
//! timeout した handler は cancel token で知らせるだけで、止めはしない。
//! slot（permit）と in-flight の席はその時点で回収される。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::shutdown::ShutdownCoordinator;
use crate::domain::{Decision, Disposition, HandlerError, TaskEnvelope};
use crate::ports::{BrokerError, TaskLease};
use crate::retry::RetryPolicy;
use crate::typed::{DynHandler, EnvelopeCodec, HandlerRegistry, TaskContext};

pub struct WorkerPool {
    registry: Arc<HandlerRegistry>,
    retry: RetryPolicy,
    coordinator: Arc<ShutdownCoordinator>,
    slots: Arc<Semaphore>,
    concurrency: usize,
    tracker: TaskTracker,
}

impl WorkerPool {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        retry: RetryPolicy,
        coordinator: Arc<ShutdownCoordinator>,
        concurrency: usize,
    ) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            registry,
            retry,
            coordinator,
            slots: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            tracker: TaskTracker::new(),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Wait for a free slot. `None` only if the pool's semaphore was closed.
    pub async fn acquire_slot(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.slots).acquire_owned().await.ok()
    }

    /// Run one leased message on its own task. The slot is held until the
    /// outcome has been reported to the broker (or the attempt timed out).
    pub fn execute(
        &self,
        lease: Box<dyn TaskLease>,
        permit: OwnedSemaphorePermit,
    ) -> JoinHandle<Disposition> {
        let slot = Slot {
            registry: Arc::clone(&self.registry),
            retry: self.retry.clone(),
            coordinator: Arc::clone(&self.coordinator),
        };
        self.tracker.spawn(async move {
            let _permit = permit;
            slot.process(lease).await
        })
    }

    /// Wait, up to `timeout`, for every slot task to finish settling with the
    /// broker. Call once the dispatcher has stopped. Slots that released or
    /// dead-lettered a lease were never in the in-flight set, so draining alone
    /// does not cover them. Returns `false` on timeout.
    pub async fn join_slots(&self, timeout: Duration) -> bool {
        self.tracker.close();
        tokio::time::timeout(timeout, self.tracker.wait()).await.is_ok()
    }
}

struct Slot {
    registry: Arc<HandlerRegistry>,
    retry: RetryPolicy,
    coordinator: Arc<ShutdownCoordinator>,
}

impl Slot {
    async fn process(self, lease: Box<dyn TaskLease>) -> Disposition {
        let envelope = match EnvelopeCodec::decode(lease.bytes()) {
            Ok(envelope) => envelope,
            Err(err) => {
                error!(queue = lease.queue(), error = %err, "dropping malformed envelope");
                report(lease.dead_letter(err.to_string()).await, "dead-letter");
                return Disposition::Dropped;
            }
        };

        let Some(_in_flight) = self.coordinator.admit(&envelope) else {
            debug!(task_id = %envelope.id(), "shutdown in progress, releasing lease");
            report(lease.release().await, "release");
            return Disposition::Released;
        };

        let handler = match self.registry.lookup(envelope.task_type()) {
            Ok(handler) => handler,
            Err(err) => {
                error!(
                    task_id = %envelope.id(),
                    task_type = %envelope.task_type(),
                    correlation_id = %envelope.correlation_id(),
                    error = %err,
                    "dropping task without handler"
                );
                report(lease.dead_letter(err.to_string()).await, "dead-letter");
                return Disposition::Dropped;
            }
        };

        let result = self.run_handler(handler, &envelope).await;
        self.settle(lease, &envelope, result).await
    }

    async fn run_handler(
        &self,
        handler: Arc<dyn DynHandler>,
        envelope: &TaskEnvelope,
    ) -> Result<(), HandlerError> {
        let cancel = self.coordinator.force_stop_token().child_token();
        let ctx = TaskContext::for_envelope(envelope, cancel.clone());
        let payload = envelope.payload().to_vec();
        let timeout = envelope.timeout();

        let mut run = tokio::spawn(async move { handler.handle_dyn(&ctx, &payload).await });

        match tokio::time::timeout(timeout, &mut run).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(HandlerError::transient(format!(
                "handler task failed: {join_err}"
            ))),
            Err(_) => {
                // handler の task は detach されたまま走り続ける可能性がある
                cancel.cancel();
                warn!(
                    task_id = %envelope.id(),
                    task_type = %envelope.task_type(),
                    timeout_ms = timeout.as_millis() as u64,
                    "task timed out"
                );
                Err(HandlerError::transient(format!(
                    "timed out after {}ms",
                    timeout.as_millis()
                )))
            }
        }
    }

    async fn settle(
        &self,
        lease: Box<dyn TaskLease>,
        envelope: &TaskEnvelope,
        result: Result<(), HandlerError>,
    ) -> Disposition {
        let err = match result {
            Ok(()) => {
                report(lease.ack().await, "ack");
                return Disposition::Succeeded;
            }
            Err(err) => err,
        };

        match self.retry.decide(envelope, &err) {
            Decision::Retry { next, delay } => match EnvelopeCodec::encode(&next) {
                Ok(bytes) => {
                    info!(
                        task_id = %envelope.id(),
                        task_type = %envelope.task_type(),
                        queue = envelope.queue(),
                        next_attempt = next.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        "retry scheduled"
                    );
                    report(lease.retry(bytes, delay).await, "retry");
                    Disposition::RetryScheduled
                }
                Err(encode_err) => {
                    error!(task_id = %envelope.id(), error = %encode_err, "cannot re-encode envelope for retry");
                    report(lease.dead_letter(encode_err.to_string()).await, "dead-letter");
                    Disposition::Dropped
                }
            },
            Decision::Drop { kind, reason } => {
                error!(
                    task_id = %envelope.id(),
                    task_type = %envelope.task_type(),
                    queue = envelope.queue(),
                    attempt = envelope.attempt(),
                    max_retries = envelope.max_retries(),
                    correlation_id = %envelope.correlation_id(),
                    kind = ?kind,
                    reason = %reason,
                    "task dropped"
                );
                report(lease.dead_letter(reason).await, "dead-letter");
                Disposition::Dropped
            }
        }
    }
}

/// Outcome reporting failures are logged; the broker redelivers after the
/// visibility timeout.
fn report(result: Result<(), BrokerError>, action: &str) {
    if let Err(err) = result {
        warn!(action, error = %err, "failed to report task outcome to broker");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NewEnvelope;
    use crate::domain::envelope::tests::{parts, sample};
    use crate::impls::InMemoryBroker;
    use crate::ports::{Broker, QueueCounts};
    use crate::typed::handler_fn;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Fixture {
        broker: Arc<InMemoryBroker>,
        coordinator: Arc<ShutdownCoordinator>,
        pool: WorkerPool,
    }

    fn fixture(registry: HandlerRegistry) -> Fixture {
        let broker = Arc::new(InMemoryBroker::new());
        let coordinator = ShutdownCoordinator::new();
        let pool = WorkerPool::new(
            Arc::new(registry),
            RetryPolicy::new(Duration::from_millis(10)),
            Arc::clone(&coordinator),
            2,
        );
        Fixture {
            broker,
            coordinator,
            pool,
        }
    }

    async fn run_one(f: &Fixture, envelope: &TaskEnvelope) -> Disposition {
        f.broker
            .enqueue(envelope.queue(), EnvelopeCodec::encode(envelope).unwrap(), Duration::ZERO)
            .await
            .unwrap();
        let lease = f.broker.lease(envelope.queue()).await.unwrap().unwrap();
        let permit = f.pool.acquire_slot().await.unwrap();
        f.pool.execute(lease, permit).await.unwrap()
    }

    async fn counts(f: &Fixture) -> QueueCounts {
        f.broker.counts().await.unwrap()["default"]
    }

    #[tokio::test]
    async fn success_is_acked() {
        let mut registry = HandlerRegistry::new();
        registry
            .register("worker:ping", Arc::new(handler_fn(|_ctx, _p| async { Ok(()) })))
            .unwrap();
        let f = fixture(registry);

        assert_eq!(run_one(&f, &sample(3)).await, Disposition::Succeeded);
        assert_eq!(counts(&f).await.succeeded, 1);
        assert_eq!(f.pool.available_slots(), 2);
        assert_eq!(f.coordinator.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn transient_failure_is_rescheduled_with_next_attempt() {
        let mut registry = HandlerRegistry::new();
        registry
            .register(
                "worker:ping",
                Arc::new(handler_fn(|_ctx, _p| async { Err(HandlerError::transient("later")) })),
            )
            .unwrap();
        let f = fixture(registry);

        assert_eq!(run_one(&f, &sample(3)).await, Disposition::RetryScheduled);
        assert_eq!(counts(&f).await.scheduled, 1);
    }

    #[tokio::test]
    async fn transient_failure_at_a_late_attempt_is_still_rescheduled() {
        let mut registry = HandlerRegistry::new();
        registry
            .register(
                "worker:ping",
                Arc::new(handler_fn(|_ctx, _p| async { Err(HandlerError::transient("later")) })),
            )
            .unwrap();
        let f = fixture(registry);

        let mut envelope = sample(40);
        for _ in 0..32 {
            envelope = envelope.next_attempt().unwrap();
        }

        assert_eq!(run_one(&f, &envelope).await, Disposition::RetryScheduled);
        let counts = counts(&f).await;
        assert_eq!(counts.scheduled, 1);
        assert_eq!(counts.leased, 0);
        assert_eq!(f.pool.available_slots(), 2);
    }

    #[tokio::test]
    async fn join_slots_waits_for_slots_outside_the_in_flight_set() {
        let f = fixture(HandlerRegistry::new());
        f.broker
            .enqueue("default", b"not json".to_vec(), Duration::ZERO)
            .await
            .unwrap();
        let lease = f.broker.lease("default").await.unwrap().unwrap();
        let permit = f.pool.acquire_slot().await.unwrap();

        // handle は await しない
        let _handle = f.pool.execute(lease, permit);
        assert_eq!(f.coordinator.in_flight_count(), 0);

        assert!(f.pool.join_slots(Duration::from_secs(1)).await);
        assert_eq!(counts(&f).await.dead, 1);
    }

    #[tokio::test]
    async fn unknown_type_is_dead_lettered_without_retry() {
        let f = fixture(HandlerRegistry::new());

        assert_eq!(run_one(&f, &sample(3)).await, Disposition::Dropped);
        let dead = f.broker.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert!(dead[0].reason.contains("worker:ping"));
    }

    #[tokio::test]
    async fn malformed_bytes_are_dead_lettered() {
        let f = fixture(HandlerRegistry::new());
        f.broker
            .enqueue("default", b"not json".to_vec(), Duration::ZERO)
            .await
            .unwrap();
        let lease = f.broker.lease("default").await.unwrap().unwrap();
        let permit = f.pool.acquire_slot().await.unwrap();

        assert_eq!(f.pool.execute(lease, permit).await.unwrap(), Disposition::Dropped);
        assert_eq!(counts(&f).await.dead, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_transient_and_cancels_the_handler() {
        let cancelled = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&cancelled);
        let mut registry = HandlerRegistry::new();
        registry
            .register(
                "worker:ping",
                Arc::new(handler_fn(move |ctx: TaskContext, _p| {
                    let seen = Arc::clone(&seen);
                    async move {
                        ctx.cancelled().await;
                        seen.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                })),
            )
            .unwrap();
        let f = fixture(registry);

        let envelope = TaskEnvelope::new(NewEnvelope {
            timeout: Duration::from_millis(50),
            ..parts(3)
        })
        .unwrap();

        assert_eq!(run_one(&f, &envelope).await, Disposition::RetryScheduled);
        tokio::time::timeout(Duration::from_secs(1), async {
            while cancelled.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn lease_is_released_once_draining() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&calls);
        let mut registry = HandlerRegistry::new();
        registry
            .register(
                "worker:ping",
                Arc::new(handler_fn(move |_ctx, _p| {
                    seen.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                })),
            )
            .unwrap();
        let f = fixture(registry);
        f.coordinator.request_shutdown("test");

        assert_eq!(run_one(&f, &sample(3)).await, Disposition::Released);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(counts(&f).await.ready, 1);
    }
}
