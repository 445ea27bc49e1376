//! Built-in tasks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::domain::HandlerError;
use courier_core::typed::{Handler, Task, TaskContext};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Round-trip check through the queue: the API enqueues it, a worker logs it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingTask {
    pub message: String,
    pub request_id: String,
    pub queued_at: DateTime<Utc>,
}

impl Task for PingTask {
    const TYPE: &'static str = "worker:ping";
}

pub struct PingHandler;

#[async_trait]
impl Handler<PingTask> for PingHandler {
    async fn handle(&self, ctx: &TaskContext, task: PingTask) -> Result<(), HandlerError> {
        let latency_ms = (Utc::now() - task.queued_at).num_milliseconds();
        info!(
            task_id = %ctx.task_id(),
            request_id = %task.request_id,
            message = %task.message,
            latency_ms,
            "pong"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::domain::{CorrelationId, NewEnvelope, TaskEnvelope, TaskId, TaskType};
    use courier_core::typed::{DynHandler, TypedHandler};
    use std::time::Duration;

    fn ctx_for(envelope: &TaskEnvelope) -> TaskContext {
        // 取り消されない token
        TaskContext::for_envelope(envelope, Default::default())
    }

    fn envelope(payload: Vec<u8>) -> TaskEnvelope {
        TaskEnvelope::new(NewEnvelope {
            id: TaskId::from(ulid::Ulid::new()),
            task_type: TaskType::new(PingTask::TYPE),
            payload,
            queue: "default".to_string(),
            max_retries: 3,
            timeout: Duration::from_secs(30),
            correlation_id: CorrelationId::new("req-1"),
            enqueued_at: Utc::now(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn ping_handler_accepts_ping_payload() {
        let payload = serde_json::to_vec(&PingTask {
            message: "hi".into(),
            request_id: "req-1".into(),
            queued_at: Utc::now(),
        })
        .unwrap();
        let env = envelope(payload);

        let handler = TypedHandler::<PingTask, _>::new(PingHandler);
        handler
            .handle_dyn(&ctx_for(&env), env.payload())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn ping_handler_rejects_foreign_payload_as_fatal() {
        let env = envelope(br#"{"unexpected": true}"#.to_vec());
        let handler = TypedHandler::<PingTask, _>::new(PingHandler);

        let err = handler
            .handle_dyn(&ctx_for(&env), env.payload())
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Fatal(_)));
    }
}
