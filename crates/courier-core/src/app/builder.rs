//! AppBuilder - アプリケーションの構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - interceptor は build 時に一度だけ巻く

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::warn;

use super::client::EnqueueClient;
use super::dispatcher::{DispatchStats, Dispatcher, QueueSelector};
use super::interceptor::{Interceptor, LoggingInterceptor, RecoveryInterceptor};
use super::shutdown::{DrainReport, ShutdownCoordinator};
use super::worker_pool::WorkerPool;
use crate::config::CourierConfig;
use crate::domain::CourierError;
use crate::ports::{Broker, Clock, SystemClock};
use crate::typed::{DynHandler, Handler, HandlerRegistry, Task};

/// AppBuilder はアプリケーションを構築
///
/// # 使用例
/// ```ignore
/// let app = AppBuilder::new(config)
///     .register::<PingTask, _>(PingHandler)?
///     .with_default_interceptors()
///     .expect_tasks(&["worker:ping"])
///     .build(broker)?;
/// ```
///
/// # Fail-fast 設計
/// - expect_tasks() で期待される task_type を登録
/// - build() 時に「期待集合 ⊆ 登録済み集合」と設定値をチェック
pub struct AppBuilder {
    config: CourierConfig,
    registry: HandlerRegistry,
    interceptors: Vec<Arc<dyn Interceptor>>,
    expected_tasks: Option<Vec<String>>,
    clock: Arc<dyn Clock>,
}

/// BuildError はアプリケーション構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing task types: {0:?}. These tasks were expected but not registered.")]
    MissingTaskTypes(Vec<String>),

    #[error(transparent)]
    Invalid(#[from] CourierError),
}

impl AppBuilder {
    pub fn new(config: CourierConfig) -> Self {
        Self {
            config,
            registry: HandlerRegistry::new(),
            interceptors: Vec::new(),
            expected_tasks: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// 型付き Handler を登録（同じ task_type の二重登録はエラー）
    pub fn register<T: Task, H: Handler<T> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, CourierError> {
        self.registry.register_typed::<T, H>(handler)?;
        Ok(self)
    }

    /// bytes のまま扱う Handler を登録
    pub fn register_dyn(
        mut self,
        task_type: &str,
        handler: Arc<dyn DynHandler>,
    ) -> Result<Self, CourierError> {
        self.registry.register(task_type, handler)?;
        Ok(self)
    }

    /// 先に追加したものほど外側に巻かれる
    pub fn interceptor(mut self, interceptor: impl Interceptor + 'static) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// logging（外側）→ recovery（内側）
    pub fn with_default_interceptors(self) -> Self {
        self.interceptor(LoggingInterceptor)
            .interceptor(RecoveryInterceptor)
    }

    pub fn expect_tasks(mut self, task_types: &[&str]) -> Self {
        self.expected_tasks = Some(task_types.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// 検証してから各コンポーネントを組み立てる
    ///
    /// broker は coordinator にリソースとして登録され、Stopped 後に close される。
    pub fn build(self, broker: Arc<dyn Broker>) -> Result<App, BuildError> {
        self.config.validate()?;

        if let Some(expected_tasks) = &self.expected_tasks {
            let registered_types: Vec<String> = self
                .registry
                .registered_types()
                .into_iter()
                .map(|t| t.as_str().to_string())
                .collect();
            let missing_tasks: Vec<String> = expected_tasks
                .iter()
                .filter(|x| !registered_types.contains(x))
                .cloned()
                .collect();
            if !missing_tasks.is_empty() {
                return Err(BuildError::MissingTaskTypes(missing_tasks));
            }
        }

        let registry = Arc::new(self.registry.with_interceptors(&self.interceptors));
        let coordinator = ShutdownCoordinator::new();
        let pool = Arc::new(WorkerPool::new(
            Arc::clone(&registry),
            self.config.retry.clone(),
            Arc::clone(&coordinator),
            self.config.concurrency,
        ));
        let client = EnqueueClient::with_clock(Arc::clone(&broker), &self.config, self.clock);

        let closing = Arc::clone(&broker);
        coordinator.register_resource("broker", move || async move {
            closing.close().await.map_err(CourierError::from)
        });

        Ok(App {
            config: self.config,
            broker,
            registry,
            coordinator,
            pool,
            client,
        })
    }
}

/// Wired components sharing one broker and one shutdown coordinator.
pub struct App {
    config: CourierConfig,
    broker: Arc<dyn Broker>,
    registry: Arc<HandlerRegistry>,
    coordinator: Arc<ShutdownCoordinator>,
    pool: Arc<WorkerPool>,
    client: EnqueueClient,
}

impl App {
    pub fn config(&self) -> &CourierConfig {
        &self.config
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.coordinator
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn client(&self) -> &EnqueueClient {
        &self.client
    }

    /// Start the dispatcher loop; it returns once shutdown is requested.
    pub fn spawn_dispatcher(&self) -> JoinHandle<DispatchStats> {
        let dispatcher = Dispatcher::new(
            Arc::clone(&self.broker),
            Arc::clone(&self.pool),
            Arc::clone(&self.coordinator),
            QueueSelector::new(self.config.dispatch_policy, &self.config.queues),
            self.config.poll_interval,
        );
        tokio::spawn(dispatcher.run())
    }

    /// Enter Draining and wait for in-flight work under `worker_drain_timeout`.
    ///
    /// After a graceful drain the remaining slot tasks (lease releases,
    /// dead-letters) are joined under the same deadline, so resources are
    /// not closed underneath them.
    pub async fn shutdown(&self, reason: &str) -> DrainReport {
        self.coordinator.request_shutdown(reason);
        let started = Instant::now();
        let report = self.coordinator.drain(self.config.worker_drain_timeout).await;
        if report.is_graceful() {
            let left = self.config.worker_drain_timeout.saturating_sub(started.elapsed());
            if !self.pool.join_slots(left).await {
                warn!(
                    timeout_ms = self.config.worker_drain_timeout.as_millis() as u64,
                    "worker slots still settling after drain"
                );
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::QueueSpec;
    use crate::impls::InMemoryBroker;
    use crate::typed::handler::tests::{EchoHandler, EchoTask};
    use crate::typed::handler_fn;

    fn broker() -> Arc<dyn Broker> {
        Arc::new(InMemoryBroker::new())
    }

    #[test]
    fn test_build_success() {
        let app = AppBuilder::new(CourierConfig::default())
            .register::<EchoTask, _>(EchoHandler)
            .unwrap()
            .expect_tasks(&[EchoTask::TYPE])
            .build(broker());
        assert!(app.is_ok());
    }

    #[test]
    fn test_build_missing_task_types() {
        let app = AppBuilder::new(CourierConfig::default())
            .register::<EchoTask, _>(EchoHandler)
            .unwrap()
            .expect_tasks(&[EchoTask::TYPE, "worker:ping"])
            .build(broker());
        assert!(matches!(
            app,
            Err(BuildError::MissingTaskTypes(missing)) if missing == vec!["worker:ping".to_string()]
        ));
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let config = CourierConfig {
            queues: vec![QueueSpec::new("low", 1)],
            ..CourierConfig::default()
        };
        let app = AppBuilder::new(config).build(broker());
        assert!(matches!(app, Err(BuildError::Invalid(CourierError::Config(_)))));
    }

    #[test]
    fn test_double_registration_fails() {
        let noop = || -> Arc<dyn DynHandler> { Arc::new(handler_fn(|_ctx, _p| async { Ok(()) })) };
        let result = AppBuilder::new(CourierConfig::default())
            .register_dyn("worker:ping", noop())
            .unwrap()
            .register_dyn("worker:ping", noop());
        assert!(matches!(result, Err(CourierError::DuplicateHandler(_))));
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_released_leases() {
        let broker = Arc::new(InMemoryBroker::new());
        let app = AppBuilder::new(CourierConfig::default())
            .register::<EchoTask, _>(EchoHandler)
            .unwrap()
            .build(broker.clone())
            .unwrap();
        app.client()
            .submit_typed(&EchoTask { value: 7 }, Default::default(), None)
            .await
            .unwrap();

        let lease = broker.lease("default").await.unwrap().unwrap();
        let permit = app.pool().acquire_slot().await.unwrap();
        app.coordinator().request_shutdown("test");
        let _slot = app.pool().execute(lease, permit);

        assert!(app.shutdown("test").await.is_graceful());
        let counts = broker.counts().await.unwrap()["default"];
        assert_eq!(counts.ready, 1);
        assert_eq!(counts.leased, 0);
    }

    #[tokio::test]
    async fn test_broker_is_closed_after_shutdown() {
        let broker = Arc::new(InMemoryBroker::new());
        let app = AppBuilder::new(CourierConfig::default())
            .build(broker.clone())
            .unwrap();

        let report = app.shutdown("test").await;
        assert!(report.is_graceful());
        assert_eq!(app.coordinator().release_resources().await, vec!["broker"]);
        assert!(broker.ping().await.is_err());
    }
}
