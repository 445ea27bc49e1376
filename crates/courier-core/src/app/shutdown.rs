//! ShutdownCoordinator - Running → Draining → Stopped の状態機械
//!
//! # 同期の規律
//! - `ShutdownState` と in-flight set は同じ mutex で守る
//!   - slot の追加（admit）と状態遷移が競合しない
//!   - Draining 以降に admit されることはない
//! - 状態の変化は watch channel で dispatcher / HTTP listener に伝える
//! - in-flight set が空になったら Notify で drain 待ちを起こす
//!
//! # 遷移
//! - Running → Draining: `request_shutdown`（シグナル、兄弟コンポーネントの起動失敗）
//! - Draining → Stopped: in-flight set が空になる（graceful）か、drain の期限切れ（forced）
//! - リソースは Stopped の後にだけ、取得と逆順で解放する

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::domain::{CourierError, TaskEnvelope, TaskId, TaskType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownState {
    Running,
    Draining,
    Stopped,
}

impl fmt::Display for ShutdownState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownState::Running => f.write_str("running"),
            ShutdownState::Draining => f.write_str("draining"),
            ShutdownState::Stopped => f.write_str("stopped"),
        }
    }
}

/// One envelope currently owned by a worker slot.
#[derive(Debug, Clone)]
pub struct InFlightTask {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub queue: String,
    pub attempt: u32,
    pub started_at: Instant,
}

/// Outcome of [`ShutdownCoordinator::drain`].
#[derive(Debug, Clone)]
pub enum DrainReport {
    /// The in-flight set emptied before the deadline.
    Graceful { elapsed: Duration },
    /// The deadline elapsed; `abandoned` were still running.
    Forced {
        elapsed: Duration,
        deadline: Duration,
        abandoned: Vec<InFlightTask>,
    },
}

impl DrainReport {
    pub fn is_graceful(&self) -> bool {
        matches!(self, DrainReport::Graceful { .. })
    }

    pub fn elapsed(&self) -> Duration {
        match self {
            DrainReport::Graceful { elapsed } | DrainReport::Forced { elapsed, .. } => *elapsed,
        }
    }

    /// `Forced` becomes `CourierError::DrainTimeout`.
    pub fn into_result(self) -> Result<Duration, CourierError> {
        match self {
            DrainReport::Graceful { elapsed } => Ok(elapsed),
            DrainReport::Forced {
                deadline,
                abandoned,
                ..
            } => Err(CourierError::DrainTimeout {
                deadline,
                abandoned: abandoned.len(),
            }),
        }
    }
}

type CloseFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), CourierError>> + Send>;

struct Resource {
    name: String,
    close: CloseFn,
}

struct Inner {
    state: ShutdownState,
    in_flight: HashMap<u64, InFlightTask>,
    next_slot: u64,
    resources: Vec<Resource>,
}

pub struct ShutdownCoordinator {
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ShutdownState>,
    idle: Notify,
    force_stop: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Arc<Self> {
        let (state_tx, _) = watch::channel(ShutdownState::Running);
        Arc::new(Self {
            inner: Mutex::new(Inner {
                state: ShutdownState::Running,
                in_flight: HashMap::new(),
                next_slot: 0,
                resources: Vec::new(),
            }),
            state_tx,
            idle: Notify::new(),
            force_stop: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> ShutdownState {
        self.inner.lock().state
    }

    pub fn subscribe(&self) -> watch::Receiver<ShutdownState> {
        self.state_tx.subscribe()
    }

    /// Resolves once the state has left `Running`.
    pub fn draining(&self) -> impl Future<Output = ()> + Send + use<> {
        let mut rx = self.state_tx.subscribe();
        async move {
            // sender は self が持っているので、閉じるのは coordinator ごと drop されたときだけ
            let _ = rx.wait_for(|state| *state != ShutdownState::Running).await;
        }
    }

    /// Cancelled when a drain is forced; worker slots derive their
    /// per-attempt tokens from it.
    pub fn force_stop_token(&self) -> &CancellationToken {
        &self.force_stop
    }

    /// Enter `Draining`. Returns `false` if shutdown was already under way.
    pub fn request_shutdown(&self, reason: &str) -> bool {
        let mut inner = self.inner.lock();
        let moved = self.advance(&mut inner, ShutdownState::Draining);
        if moved {
            info!(reason, in_flight = inner.in_flight.len(), "shutdown requested");
        }
        moved
    }

    /// Put `envelope` into the in-flight set, unless shutdown has started.
    ///
    /// The returned guard removes the entry when dropped.
    pub fn admit(self: &Arc<Self>, envelope: &TaskEnvelope) -> Option<InFlightGuard> {
        let mut inner = self.inner.lock();
        if inner.state != ShutdownState::Running {
            return None;
        }
        let slot = inner.next_slot;
        inner.next_slot += 1;
        inner.in_flight.insert(
            slot,
            InFlightTask {
                task_id: envelope.id(),
                task_type: envelope.task_type().clone(),
                queue: envelope.queue().to_string(),
                attempt: envelope.attempt(),
                started_at: Instant::now(),
            },
        );
        Some(InFlightGuard {
            coordinator: Arc::clone(self),
            slot,
        })
    }

    pub fn in_flight(&self) -> Vec<InFlightTask> {
        self.inner.lock().in_flight.values().cloned().collect()
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.lock().in_flight.len()
    }

    /// Wait for the in-flight set to empty, at most `deadline`.
    ///
    /// Enters `Draining` first if nobody did yet, and always ends in `Stopped`.
    /// On a forced stop the remaining entries are dropped from the set and
    /// their handlers are cancelled; their leases are left to expire at the broker.
    pub async fn drain(&self, deadline: Duration) -> DrainReport {
        self.request_shutdown("drain");
        let started = Instant::now();
        let until = started + deadline;

        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                if inner.in_flight.is_empty() {
                    self.advance(&mut inner, ShutdownState::Stopped);
                    let elapsed = started.elapsed();
                    info!(elapsed_ms = elapsed.as_millis() as u64, "drain completed");
                    return DrainReport::Graceful { elapsed };
                }
            }

            if tokio::time::timeout_at(until, notified).await.is_err() {
                break;
            }
        }

        let abandoned: Vec<InFlightTask> = {
            let mut inner = self.inner.lock();
            let abandoned = inner.in_flight.drain().map(|(_, task)| task).collect();
            self.advance(&mut inner, ShutdownState::Stopped);
            abandoned
        };
        self.force_stop.cancel();

        let elapsed = started.elapsed();
        let task_ids: Vec<String> = abandoned.iter().map(|t| t.task_id.to_string()).collect();
        warn!(
            deadline_ms = deadline.as_millis() as u64,
            abandoned = abandoned.len(),
            task_ids = ?task_ids,
            "worker shutdown timed out, forcing exit"
        );
        DrainReport::Forced {
            elapsed,
            deadline,
            abandoned,
        }
    }

    /// Register a dependent resource. Resources are closed in reverse
    /// registration order by [`release_resources`](Self::release_resources).
    pub fn register_resource<F, Fut>(&self, name: impl Into<String>, close: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), CourierError>> + Send + 'static,
    {
        self.inner.lock().resources.push(Resource {
            name: name.into(),
            close: Box::new(move || close().boxed()),
        });
    }

    /// Close every registered resource, newest first. Only runs once `Stopped`;
    /// returns the names closed, in closing order.
    pub async fn release_resources(&self) -> Vec<String> {
        let resources = {
            let mut inner = self.inner.lock();
            if inner.state != ShutdownState::Stopped {
                warn!(state = %inner.state, "resources are released only after the worker pool stopped");
                return Vec::new();
            }
            std::mem::take(&mut inner.resources)
        };

        let mut closed = Vec::with_capacity(resources.len());
        for resource in resources.into_iter().rev() {
            match (resource.close)().await {
                Ok(()) => info!(resource = %resource.name, "resource closed"),
                Err(err) => warn!(resource = %resource.name, error = %err, "failed to close resource"),
            }
            closed.push(resource.name);
        }
        closed
    }

    fn advance(&self, inner: &mut Inner, to: ShutdownState) -> bool {
        if to <= inner.state {
            return false;
        }
        inner.state = to;
        self.state_tx.send_replace(to);
        true
    }

    fn leave(&self, slot: u64) {
        let mut inner = self.inner.lock();
        // forced drain で既に外されている場合は何もしない
        if inner.in_flight.remove(&slot).is_some() && inner.in_flight.is_empty() {
            self.idle.notify_waiters();
        }
    }
}

/// Membership of one envelope in the in-flight set.
pub struct InFlightGuard {
    coordinator: Arc<ShutdownCoordinator>,
    slot: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.coordinator.leave(self.slot);
    }
}
