//! courier-core
//!
//! Job dispatch / retry engine and the coordinated shutdown protocol.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task_type, queue, envelope, decision, errors）
//! - **ports**: 抽象化レイヤー（Broker, Clock, IdGenerator）
//! - **impls**: 実装（InMemoryBroker、開発・テスト・単一プロセス用）
//! - **typed**: 型付き Task API（Task, Handler, HandlerRegistry, EnvelopeCodec）
//! - **retry**: backoff とリトライ判断
//! - **config**: 起動時に一度だけ組み立てる設定値
//! - **app**: dispatcher, worker pool, shutdown coordinator, enqueue client, builder

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod retry;
pub mod typed;

pub use app::{App, AppBuilder, BuildError};
pub use config::{CourierConfig, DispatchPolicy};
pub use domain::{CourierError, HandlerError};
pub use retry::RetryPolicy;
