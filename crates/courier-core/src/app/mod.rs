//! App - アプリケーション層
//!
//! ports と typed を組み合わせて、dispatch / retry / shutdown を実装します。
//!
//! # 主要コンポーネント
//! - **AppBuilder**: 構築とワイヤリング（起動時検証）
//! - **Dispatcher**: 重み付き queue から lease を取るループ
//! - **WorkerPool**: 固定数の slot で handler を実行
//! - **ShutdownCoordinator**: Running → Draining → Stopped
//! - **EnqueueClient**: producer 側 API
//! - **Interceptor**: handler に巻く logging / recovery

pub mod builder;
pub mod client;
pub mod dispatcher;
pub mod interceptor;
pub mod shutdown;
pub mod worker_pool;

pub use self::builder::{App, AppBuilder, BuildError};
pub use self::client::{Connectivity, EnqueueClient, EnqueueOptions, EnqueuedTask, QueueStatus};
pub use self::dispatcher::{DispatchStats, Dispatcher, QueueSelector};
pub use self::interceptor::{Interceptor, LoggingInterceptor, RecoveryInterceptor};
pub use self::shutdown::{DrainReport, InFlightGuard, InFlightTask, ShutdownCoordinator, ShutdownState};
pub use self::worker_pool::WorkerPool;
