//! Dispatcher - 重み付きキューから lease を取り、worker slot に渡す
//!
//! # ループ
//! 1. 空き slot を待つ（backpressure、pool を超えて取らない）
//! 2. `QueueSelector` が決めた順に queue を poll する
//! 3. 取れたら permit ごと pool に渡す。全部空なら broker の wake-up を待つ
//!
//! shutdown state が Running でなくなったら新しい lease は取らない。
//! 実行中の slot には触らない。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::shutdown::{ShutdownCoordinator, ShutdownState};
use super::worker_pool::WorkerPool;
use crate::config::DispatchPolicy;
use crate::domain::QueueSpec;
use crate::domain::queue::names_by_priority;
use crate::ports::{Broker, BrokerError, TaskLease};

/// Decides the order in which queues are polled for the next lease.
///
/// - `Strict`: always highest weight first.
/// - `WeightedFair`: smooth weighted round-robin. Over every window of
///   `sum(weights)` picks each queue is chosen exactly `weight` times; if the
///   chosen queue turns out empty the rest are tried highest weight first.
#[derive(Debug, Clone)]
pub struct QueueSelector {
    policy: DispatchPolicy,
    queues: Vec<QueueSpec>,
    credits: Vec<i64>,
    total_weight: i64,
}

impl QueueSelector {
    pub fn new(policy: DispatchPolicy, queues: &[QueueSpec]) -> Self {
        let by_priority = names_by_priority(queues);
        let queues: Vec<QueueSpec> = by_priority
            .iter()
            .filter_map(|name| queues.iter().find(|q| &q.name == name).cloned())
            .collect();
        let total_weight = queues.iter().map(|q| i64::from(q.weight)).sum();
        Self {
            policy,
            credits: vec![0; queues.len()],
            queues,
            total_weight,
        }
    }

    pub fn policy(&self) -> DispatchPolicy {
        self.policy
    }

    /// Queue names to poll this round, first choice first.
    pub fn next_order(&mut self) -> Vec<&str> {
        let first = match self.policy {
            DispatchPolicy::Strict => 0,
            DispatchPolicy::WeightedFair => self.pick_weighted(),
        };
        let mut order = Vec::with_capacity(self.queues.len());
        if let Some(q) = self.queues.get(first) {
            order.push(q.name.as_str());
        }
        order.extend(
            self.queues
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != first)
                .map(|(_, q)| q.name.as_str()),
        );
        order
    }

    fn pick_weighted(&mut self) -> usize {
        let mut best = 0;
        for (i, queue) in self.queues.iter().enumerate() {
            self.credits[i] += i64::from(queue.weight);
            if self.credits[i] > self.credits[best] {
                best = i;
            }
        }
        if let Some(credit) = self.credits.get_mut(best) {
            *credit -= self.total_weight;
        }
        best
    }
}

/// Leases dispatched per queue during one [`Dispatcher::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub per_queue: BTreeMap<String, u64>,
}

impl DispatchStats {
    pub fn total(&self) -> u64 {
        self.per_queue.values().sum()
    }
}

pub struct Dispatcher {
    broker: Arc<dyn Broker>,
    pool: Arc<WorkerPool>,
    coordinator: Arc<ShutdownCoordinator>,
    selector: QueueSelector,
    poll_interval: Duration,
}

impl Dispatcher {
    pub fn new(
        broker: Arc<dyn Broker>,
        pool: Arc<WorkerPool>,
        coordinator: Arc<ShutdownCoordinator>,
        selector: QueueSelector,
        poll_interval: Duration,
    ) -> Self {
        Self {
            broker,
            pool,
            coordinator,
            selector,
            poll_interval,
        }
    }

    /// Run until the shutdown state leaves `Running`.
    pub async fn run(mut self) -> DispatchStats {
        let mut stats = DispatchStats::default();
        let mut state_rx = self.coordinator.subscribe();
        info!(policy = %self.selector.policy(), slots = self.pool.concurrency(), "dispatcher started");

        loop {
            if self.coordinator.state() != ShutdownState::Running {
                break;
            }

            let permit = tokio::select! {
                biased;
                _ = left_running(&mut state_rx) => break,
                permit = self.pool.acquire_slot() => match permit {
                    Some(permit) => permit,
                    None => break,
                },
            };

            match self.poll_once().await {
                Ok(Some((queue, lease))) => {
                    *stats.per_queue.entry(queue).or_default() += 1;
                    self.pool.execute(lease, permit);
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        biased;
                        _ = left_running(&mut state_rx) => break,
                        _ = self.broker.wait_for_work(self.poll_interval) => {}
                    }
                }
                Err(err) => {
                    drop(permit);
                    warn!(error = %err, retry_in_ms = self.poll_interval.as_millis() as u64, "lease request failed");
                    tokio::select! {
                        biased;
                        _ = left_running(&mut state_rx) => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }
        }

        info!(dispatched = stats.total(), "dispatcher stopped");
        stats
    }

    async fn poll_once(&mut self) -> Result<Option<(String, Box<dyn TaskLease>)>, BrokerError> {
        for queue in self.selector.next_order() {
            if let Some(lease) = self.broker.lease(queue).await? {
                debug!(queue, "leased");
                return Ok(Some((queue.to_string(), lease)));
            }
        }
        Ok(None)
    }
}

async fn left_running(rx: &mut watch::Receiver<ShutdownState>) {
    let _ = rx.wait_for(|s| *s != ShutdownState::Running).await;
}
