//! Impls - ports の実装（開発用・テスト用）
//!
//! # 含まれる実装
//! - **InMemoryBroker**: 単一プロセス用の broker
//!
//! 本番用の broker（Redis など）は別クレートに置く想定。

pub mod inmem_broker;

pub use self::inmem_broker::{DeadLetter, InMemoryBroker};
