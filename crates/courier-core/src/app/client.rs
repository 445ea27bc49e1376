//! EnqueueClient - producer 側の API
//!
//! HTTP 層はこれだけを使う。
//! - options を設定済みの queue とデフォルト値で検証・補完する
//! - ID を採番し、correlation ID を envelope に載せる
//! - broker への書き込みは `enqueue_timeout` で打ち切る（無期限に待たない）
//! - broker が受け付けなければ `QueueUnavailable`（呼び出し側は 503 相当を返す）

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::CourierConfig;
use crate::domain::queue::names_by_priority;
use crate::domain::{CorrelationId, CourierError, NewEnvelope, QueueSpec, TaskEnvelope, TaskId, TaskType};
use crate::ports::{Broker, Clock, IdGenerator, QueueCounts, SystemClock, UlidGenerator};
use crate::typed::{EnvelopeCodec, Task};

/// Caller-supplied options; `None` falls back to the configured default.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub queue: Option<String>,
    pub max_retries: Option<u32>,
    pub timeout: Option<Duration>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// What the broker confirmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueuedTask {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub queue: String,
    pub correlation_id: CorrelationId,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "error", rename_all = "snake_case")]
pub enum Connectivity {
    Up,
    Down(String),
}

impl Connectivity {
    pub fn is_up(&self) -> bool {
        matches!(self, Connectivity::Up)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    /// Highest weight first.
    pub queue_names: Vec<String>,
    pub connectivity: Connectivity,
}

#[derive(Clone)]
pub struct EnqueueClient {
    broker: Arc<dyn Broker>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    queues: Vec<QueueSpec>,
    default_queue: String,
    default_max_retries: u32,
    default_timeout: Duration,
    enqueue_timeout: Duration,
    health_check_timeout: Duration,
}

impl EnqueueClient {
    pub fn new(broker: Arc<dyn Broker>, config: &CourierConfig) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self::with_clock(broker, config, clock)
    }

    pub fn with_clock(broker: Arc<dyn Broker>, config: &CourierConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            ids: Arc::new(UlidGenerator::new(Arc::clone(&clock))),
            broker,
            clock,
            queues: config.queues.clone(),
            default_queue: config.default_queue.clone(),
            default_max_retries: config.default_max_retries,
            default_timeout: config.default_timeout,
            enqueue_timeout: config.enqueue_timeout,
            health_check_timeout: config.health_check_timeout,
        }
    }

    /// Validate `options`, build the envelope and write it to the broker.
    ///
    /// Without a `correlation_id` a fresh one is generated.
    pub async fn enqueue(
        &self,
        task_type: impl Into<TaskType>,
        payload: Vec<u8>,
        options: EnqueueOptions,
        correlation_id: Option<CorrelationId>,
    ) -> Result<EnqueuedTask, CourierError> {
        let task_type = task_type.into();
        if !task_type.is_valid() {
            return Err(CourierError::InvalidOptions(
                "task type must not be empty".to_string(),
            ));
        }
        let queue = options.queue.unwrap_or_else(|| self.default_queue.clone());
        if !self.queues.iter().any(|q| q.name == queue) {
            return Err(CourierError::UnknownQueue(queue));
        }

        let envelope = TaskEnvelope::new(NewEnvelope {
            id: self.ids.generate_task_id(),
            task_type,
            payload,
            queue,
            max_retries: options.max_retries.unwrap_or(self.default_max_retries),
            timeout: options.timeout.unwrap_or(self.default_timeout),
            correlation_id: correlation_id.unwrap_or_else(CorrelationId::generate),
            enqueued_at: self.clock.now(),
        })?;
        let bytes = EnvelopeCodec::encode(&envelope)?;

        let write = self.broker.enqueue(envelope.queue(), bytes, Duration::ZERO);
        match tokio::time::timeout(self.enqueue_timeout, write).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(
                    task_type = %envelope.task_type(),
                    queue = envelope.queue(),
                    correlation_id = %envelope.correlation_id(),
                    error = %err,
                    "enqueue rejected by broker"
                );
                return Err(CourierError::QueueUnavailable(err.to_string()));
            }
            Err(_) => {
                warn!(
                    task_type = %envelope.task_type(),
                    queue = envelope.queue(),
                    timeout_ms = self.enqueue_timeout.as_millis() as u64,
                    "enqueue timed out"
                );
                return Err(CourierError::QueueUnavailable(format!(
                    "broker did not confirm within {}ms",
                    self.enqueue_timeout.as_millis()
                )));
            }
        }

        info!(
            task_id = %envelope.id(),
            task_type = %envelope.task_type(),
            queue = envelope.queue(),
            max_retries = envelope.max_retries(),
            correlation_id = %envelope.correlation_id(),
            "task enqueued"
        );
        Ok(EnqueuedTask {
            task_id: envelope.id(),
            task_type: envelope.task_type().clone(),
            queue: envelope.queue().to_string(),
            correlation_id: envelope.correlation_id().clone(),
            enqueued_at: envelope.enqueued_at(),
        })
    }

    /// Serialize `task` as JSON and enqueue it under `T::TYPE`.
    pub async fn submit_typed<T: Task>(
        &self,
        task: &T,
        options: EnqueueOptions,
        correlation_id: Option<CorrelationId>,
    ) -> Result<EnqueuedTask, CourierError> {
        let payload = serde_json::to_vec(task)
            .map_err(|e| CourierError::InvalidOptions(format!("payload encode: {e}")))?;
        self.enqueue(T::TYPE, payload, options, correlation_id).await
    }

    /// Configured queue names and whether the broker answers a ping in time.
    pub async fn query_status(&self) -> QueueStatus {
        QueueStatus {
            queue_names: names_by_priority(&self.queues),
            connectivity: self.ping().await,
        }
    }

    pub async fn ping(&self) -> Connectivity {
        match tokio::time::timeout(self.health_check_timeout, self.broker.ping()).await {
            Ok(Ok(())) => Connectivity::Up,
            Ok(Err(err)) => Connectivity::Down(err.to_string()),
            Err(_) => Connectivity::Down(format!(
                "no answer within {}ms",
                self.health_check_timeout.as_millis()
            )),
        }
    }

    pub async fn queue_counts(&self) -> Result<BTreeMap<String, QueueCounts>, CourierError> {
        Ok(self.broker.counts().await?)
    }
}
