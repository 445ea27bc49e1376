//! Ports - 抽象化レイヤー
//!
//! 外部システム（broker）や環境（時刻・ID 生成）への依存を trait で切り出す。
//! - broker が queue/lease 状態の正本（core は何も永続化しない）

pub mod broker;
pub mod clock;
pub mod id_generator;

pub use self::broker::{Broker, BrokerError, QueueCounts, TaskLease};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
