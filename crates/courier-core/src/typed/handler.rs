//! Handler trait - Task を実行する Handler の定義
//!
//! # 学習ポイント
//! - ジェネリック trait (Handler<T>)
//! - Object-safe trait (DynHandler)
//! - Type erasure パターン (TypedHandler<T, H> → DynHandler)

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;

use super::context::TaskContext;
use super::task::Task;
use crate::domain::HandlerError;

/// Handler は Task を実行する
///
/// # 使用例
/// ```ignore
/// struct PingHandler;
///
/// #[async_trait]
/// impl Handler<PingTask> for PingHandler {
///     async fn handle(&self, ctx: &TaskContext, task: PingTask) -> Result<(), HandlerError> {
///         tracing::info!(message = %task.message, "pong");
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Handler<T: Task>: Send + Sync {
    async fn handle(&self, ctx: &TaskContext, task: T) -> Result<(), HandlerError>;
}

/// DynHandler は object-safe な Handler の抽象化
///
/// payload は bytes のまま受け取るので、`HashMap<TaskType, Arc<dyn DynHandler>>`
/// に格納できる。interceptor もこの層で包む。
#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn handle_dyn(&self, ctx: &TaskContext, payload: &[u8]) -> Result<(), HandlerError>;
}

pub struct TypedHandler<T: Task, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<T>,
}

impl<T: Task, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Task, H: Handler<T>> DynHandler for TypedHandler<T, H> {
    async fn handle_dyn(&self, ctx: &TaskContext, payload: &[u8]) -> Result<(), HandlerError> {
        // schema が合わない payload はリトライしても直らない
        let task: T = serde_json::from_slice(payload)
            .map_err(|e| HandlerError::fatal(format!("json decode: {e}")))?;
        self.handler.handle(ctx, task).await
    }
}

/// Closure-backed handler working on raw payload bytes.
pub struct FnHandler<F> {
    f: F,
}

/// Wrap `f(ctx, payload)` as a [`DynHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(TaskContext, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> DynHandler for FnHandler<F>
where
    F: Fn(TaskContext, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle_dyn(&self, ctx: &TaskContext, payload: &[u8]) -> Result<(), HandlerError> {
        (self.f)(ctx.clone(), payload.to_vec()).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::domain::envelope::tests::sample;
    use serde::{Deserialize, Serialize};
    use tokio_util::sync::CancellationToken;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub(crate) struct EchoTask {
        pub value: i32,
    }

    impl Task for EchoTask {
        const TYPE: &'static str = "test:echo";
    }

    pub(crate) struct EchoHandler;

    #[async_trait]
    impl Handler<EchoTask> for EchoHandler {
        async fn handle(&self, _ctx: &TaskContext, task: EchoTask) -> Result<(), HandlerError> {
            if task.value < 0 {
                return Err(HandlerError::transient("negative"));
            }
            Ok(())
        }
    }

    fn ctx() -> TaskContext {
        TaskContext::for_envelope(&sample(3), CancellationToken::new())
    }

    #[tokio::test]
    async fn typed_handler_decodes_payload() {
        let typed = TypedHandler::<EchoTask, _>::new(EchoHandler);
        assert!(typed.handle_dyn(&ctx(), br#"{"value": 1}"#).await.is_ok());
        assert_eq!(
            typed.handle_dyn(&ctx(), br#"{"value": -1}"#).await,
            Err(HandlerError::transient("negative"))
        );
    }

    #[tokio::test]
    async fn typed_handler_rejects_bad_payload_as_fatal() {
        let typed = TypedHandler::<EchoTask, _>::new(EchoHandler);
        let err = typed.handle_dyn(&ctx(), b"{}").await.unwrap_err();
        assert!(matches!(err, HandlerError::Fatal(_)));
    }

    #[tokio::test]
    async fn fn_handler_sees_context_and_payload() {
        let handler = handler_fn(|ctx: TaskContext, payload: Vec<u8>| async move {
            assert_eq!(ctx.task_type().as_str(), "worker:ping");
            assert_eq!(payload, b"hello");
            Ok(())
        });
        handler.handle_dyn(&ctx(), b"hello").await.unwrap();
    }
}
