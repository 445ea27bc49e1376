//! Interceptors - handler の周りに巻く横断的処理
//!
//! `intercept(next) -> wrapped` だけを持つ小さな trait。
//! registry の構築時に一度だけ巻くので、実行時のコストは関数呼び出し分のみ。

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::domain::HandlerError;
use crate::typed::{DynHandler, TaskContext};

pub trait Interceptor: Send + Sync {
    fn intercept(&self, next: Arc<dyn DynHandler>) -> Arc<dyn DynHandler>;
}

/// Logs "task started" / "task completed" / "task failed" with the duration.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingInterceptor;

impl Interceptor for LoggingInterceptor {
    fn intercept(&self, next: Arc<dyn DynHandler>) -> Arc<dyn DynHandler> {
        Arc::new(Logged { next })
    }
}

struct Logged {
    next: Arc<dyn DynHandler>,
}

#[async_trait]
impl DynHandler for Logged {
    async fn handle_dyn(&self, ctx: &TaskContext, payload: &[u8]) -> Result<(), HandlerError> {
        let started = Instant::now();
        info!(
            task_id = %ctx.task_id(),
            task_type = %ctx.task_type(),
            queue = ctx.queue(),
            attempt = ctx.attempt(),
            correlation_id = %ctx.correlation_id(),
            "task started"
        );

        let result = self.next.handle_dyn(ctx, payload).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(()) => info!(
                task_id = %ctx.task_id(),
                task_type = %ctx.task_type(),
                correlation_id = %ctx.correlation_id(),
                duration_ms,
                "task completed"
            ),
            Err(err) => warn!(
                task_id = %ctx.task_id(),
                task_type = %ctx.task_type(),
                correlation_id = %ctx.correlation_id(),
                attempt = ctx.attempt(),
                kind = ?err.kind(),
                error = %err,
                duration_ms,
                "task failed"
            ),
        }
        result
    }
}

/// Turns a panicking handler into a transient failure.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryInterceptor;

impl Interceptor for RecoveryInterceptor {
    fn intercept(&self, next: Arc<dyn DynHandler>) -> Arc<dyn DynHandler> {
        Arc::new(Recovered { next })
    }
}

struct Recovered {
    next: Arc<dyn DynHandler>,
}

#[async_trait]
impl DynHandler for Recovered {
    async fn handle_dyn(&self, ctx: &TaskContext, payload: &[u8]) -> Result<(), HandlerError> {
        match AssertUnwindSafe(self.next.handle_dyn(ctx, payload))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(
                    task_id = %ctx.task_id(),
                    task_type = %ctx.task_type(),
                    panic = %message,
                    "handler panicked"
                );
                Err(HandlerError::transient(format!("handler panicked: {message}")))
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
