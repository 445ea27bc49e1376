//! TaskContext - handler に渡す実行コンテキスト

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::domain::{CorrelationId, TaskEnvelope, TaskId, TaskType};

/// Per-attempt context handed to a handler.
///
/// `cancel` is the only cancellation signal a handler receives. It fires when
/// the attempt times out or the worker is force-stopped; handlers that ignore
/// it keep running after their slot has been reclaimed.
#[derive(Debug, Clone)]
pub struct TaskContext {
    task_id: TaskId,
    task_type: TaskType,
    queue: String,
    attempt: u32,
    max_retries: u32,
    correlation_id: CorrelationId,
    deadline: Instant,
    cancel: CancellationToken,
}

impl TaskContext {
    pub fn for_envelope(envelope: &TaskEnvelope, cancel: CancellationToken) -> Self {
        Self {
            task_id: envelope.id(),
            task_type: envelope.task_type().clone(),
            queue: envelope.queue().to_string(),
            attempt: envelope.attempt(),
            max_retries: envelope.max_retries(),
            correlation_id: envelope.correlation_id().clone(),
            deadline: Instant::now() + envelope.timeout(),
            cancel,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn task_type(&self) -> &TaskType {
        &self.task_type
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the attempt is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}
