//! InMemoryBroker - 開発・テスト用の broker
//!
//! # 実装詳細
//! - queue ごとの ready `VecDeque` + 遅延配送用の min-heap
//! - lease には token と期限（visibility timeout）を付ける
//!   - 期限切れの lease は次の `lease()` で ready に戻る（再配送）
//!   - 古い token での ack などは `LeaseLost`
//! - `set_available(false)` で broker 障害を再現できる
//!
//! 時刻は `tokio::time::Instant` を使うので、paused time のテストでも動く。

use std::collections::{BTreeMap, BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::ports::{Broker, BrokerError, QueueCounts, TaskLease};

/// 加算がオーバーフローするときの代わりの「ずっと先」
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + delay` without panicking on overflow.
fn instant_after(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// A message that went to the dead-letter set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub queue: String,
    pub bytes: Vec<u8>,
    pub reason: String,
}

#[derive(Debug, Clone)]
struct Message {
    id: u64,
    queue: String,
    bytes: Vec<u8>,
}

/// Delayed message entry; BinaryHeap を min-heap として使うため順序を反転。
#[derive(Debug)]
struct Scheduled {
    visible_at: Instant,
    seq: u64,
    message: Message,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.visible_at == other.visible_at && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .visible_at
            .cmp(&self.visible_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug)]
struct Leased {
    message: Message,
    token: u64,
    expires_at: Instant,
}

struct BrokerState {
    ready: HashMap<String, VecDeque<Message>>,
    scheduled: BinaryHeap<Scheduled>,
    leased: HashMap<u64, Leased>,
    dead: Vec<DeadLetter>,
    succeeded: HashMap<String, usize>,
    next_message_id: u64,
    next_token: u64,
    visibility_timeout: Duration,
    available: bool,
    closed: bool,
}

impl BrokerState {
    fn new(visibility_timeout: Duration) -> Self {
        Self {
            ready: HashMap::new(),
            scheduled: BinaryHeap::new(),
            leased: HashMap::new(),
            dead: Vec::new(),
            succeeded: HashMap::new(),
            next_message_id: 1,
            next_token: 1,
            visibility_timeout,
            available: true,
            closed: false,
        }
    }

    fn check_reachable(&self) -> Result<(), BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        if !self.available {
            return Err(BrokerError::Unavailable("in-memory broker switched off".into()));
        }
        Ok(())
    }

    fn push(&mut self, message: Message, delay: Duration, now: Instant) {
        if delay.is_zero() {
            self.ready
                .entry(message.queue.clone())
                .or_default()
                .push_back(message);
        } else {
            let seq = message.id;
            self.scheduled.push(Scheduled {
                visible_at: instant_after(now, delay),
                seq,
                message,
            });
        }
    }

    /// Move delayed messages whose time has come to the back of their ready queue.
    fn promote_scheduled(&mut self, now: Instant) {
        while let Some(entry) = self.scheduled.peek() {
            if entry.visible_at > now {
                break;
            }
            if let Some(entry) = self.scheduled.pop() {
                self.ready
                    .entry(entry.message.queue.clone())
                    .or_default()
                    .push_back(entry.message);
            }
        }
    }

    /// Expired leases go back to the front of their queue for redelivery.
    fn reap_expired(&mut self, now: Instant) {
        let expired: Vec<u64> = self
            .leased
            .iter()
            .filter(|(_, l)| l.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(leased) = self.leased.remove(&id) {
                tracing::warn!(
                    queue = %leased.message.queue,
                    message_id = id,
                    "lease expired, message redelivered"
                );
                self.ready
                    .entry(leased.message.queue.clone())
                    .or_default()
                    .push_front(leased.message);
            }
        }
    }

    /// Remove a lease if `token` still owns it.
    fn take_lease(&mut self, message_id: u64, token: u64, queue: &str) -> Result<Leased, BrokerError> {
        self.check_reachable()?;
        match self.leased.get(&message_id) {
            Some(l) if l.token == token => {}
            _ => {
                return Err(BrokerError::LeaseLost {
                    queue: queue.to_string(),
                });
            }
        }
        self.leased
            .remove(&message_id)
            .ok_or_else(|| BrokerError::LeaseLost {
                queue: queue.to_string(),
            })
    }

    fn next_wake(&self) -> Option<Instant> {
        self.scheduled.peek().map(|s| s.visible_at)
    }
}

pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
}

impl InMemoryBroker {
    pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(60);

    pub fn new() -> Self {
        Self::with_visibility_timeout(Self::DEFAULT_VISIBILITY_TIMEOUT)
    }

    pub fn with_visibility_timeout(visibility_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::new(visibility_timeout))),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Pre-create queues so they show up in `counts()` while still empty.
    pub async fn declare_queues<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.state.lock().await;
        for name in names {
            state.ready.entry(name.into()).or_default();
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    pub async fn set_available(&self, available: bool) {
        self.state.lock().await.available = available;
        if available {
            self.notify.notify_one();
        }
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().await.dead.clone()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn enqueue(
        &self,
        queue: &str,
        bytes: Vec<u8>,
        delay: Duration,
    ) -> Result<(), BrokerError> {
        {
            let mut state = self.state.lock().await;
            state.check_reachable()?;
            let id = state.next_message_id;
            state.next_message_id += 1;
            let message = Message {
                id,
                queue: queue.to_string(),
                bytes,
            };
            state.push(message, delay, Instant::now());
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn lease(&self, queue: &str) -> Result<Option<Box<dyn TaskLease>>, BrokerError> {
        let mut state = self.state.lock().await;
        state.check_reachable()?;
        let now = Instant::now();
        state.promote_scheduled(now);
        state.reap_expired(now);

        let Some(message) = state.ready.get_mut(queue).and_then(|q| q.pop_front()) else {
            return Ok(None);
        };

        let token = state.next_token;
        state.next_token += 1;
        let expires_at = instant_after(now, state.visibility_timeout);
        let lease = InMemoryLease {
            message_id: message.id,
            token,
            queue: message.queue.clone(),
            bytes: message.bytes.clone(),
            state: Arc::clone(&self.state),
            notify: Arc::clone(&self.notify),
        };
        state.leased.insert(
            message.id,
            Leased {
                message,
                token,
                expires_at,
            },
        );
        Ok(Some(Box::new(lease)))
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        self.state.lock().await.check_reachable()
    }

    async fn counts(&self) -> Result<BTreeMap<String, QueueCounts>, BrokerError> {
        let state = self.state.lock().await;
        state.check_reachable()?;

        let mut counts: BTreeMap<String, QueueCounts> = BTreeMap::new();
        for (name, ready) in &state.ready {
            counts.entry(name.clone()).or_default().ready = ready.len();
        }
        for scheduled in &state.scheduled {
            counts
                .entry(scheduled.message.queue.clone())
                .or_default()
                .scheduled += 1;
        }
        for leased in state.leased.values() {
            counts
                .entry(leased.message.queue.clone())
                .or_default()
                .leased += 1;
        }
        for (name, n) in &state.succeeded {
            counts.entry(name.clone()).or_default().succeeded = *n;
        }
        for dead in &state.dead {
            counts.entry(dead.queue.clone()).or_default().dead += 1;
        }
        Ok(counts)
    }

    async fn wait_for_work(&self, timeout: Duration) {
        let next_wake = self.state.lock().await.next_wake();
        let deadline = instant_after(Instant::now(), timeout);
        let wake_at = next_wake.map_or(deadline, |w| w.min(deadline));
        tokio::select! {
            _ = self.notify.notified() => {},
            _ = tokio::time::sleep_until(wake_at) => {},
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
        Ok(())
    }
}

struct InMemoryLease {
    message_id: u64,
    token: u64,
    queue: String,
    bytes: Vec<u8>,
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
}

#[async_trait]
impl TaskLease for InMemoryLease {
    fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn queue(&self) -> &str {
        &self.queue
    }

    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.take_lease(self.message_id, self.token, &self.queue)?;
        *state.succeeded.entry(self.queue.clone()).or_default() += 1;
        Ok(())
    }

    async fn retry(self: Box<Self>, bytes: Vec<u8>, delay: Duration) -> Result<(), BrokerError> {
        {
            let mut state = self.state.lock().await;
            let leased = state.take_lease(self.message_id, self.token, &self.queue)?;
            let message = Message {
                id: leased.message.id,
                queue: leased.message.queue,
                bytes,
            };
            state.push(message, delay, Instant::now());
        } // Lock released here

        self.notify.notify_one();
        Ok(())
    }

    async fn dead_letter(self: Box<Self>, reason: String) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        let leased = state.take_lease(self.message_id, self.token, &self.queue)?;
        state.dead.push(DeadLetter {
            queue: leased.message.queue,
            bytes: leased.message.bytes,
            reason,
        });
        Ok(())
    }

    async fn release(self: Box<Self>) -> Result<(), BrokerError> {
        {
            let mut state = self.state.lock().await;
            let leased = state.take_lease(self.message_id, self.token, &self.queue)?;
            state
                .ready
                .entry(leased.message.queue.clone())
                .or_default()
                .push_front(leased.message);
        }
        self.notify.notify_one();
        Ok(())
    }
}
