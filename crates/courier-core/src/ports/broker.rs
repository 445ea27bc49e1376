//! Broker port - 外部の durable queue（Redis など）への窓口
//!
//! core は broker をブラックボックスとして扱います。
//! - at-least-once 配送
//! - lease は一人の worker だけが持つ（visibility timeout 切れで再配送）
//! - payload は encode 済み envelope の bytes（中身は broker に見せない）

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::CourierError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// The lease expired and the message was handed to someone else.
    #[error("lease on queue `{queue}` is no longer held")]
    LeaseLost { queue: String },

    #[error("broker connection is closed")]
    Closed,
}

impl From<BrokerError> for CourierError {
    fn from(err: BrokerError) -> Self {
        CourierError::BrokerUnavailable(err.to_string())
    }
}

/// Per-queue message counts, for status endpoints and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub ready: usize,
    pub scheduled: usize,
    pub leased: usize,
    pub succeeded: usize,
    pub dead: usize,
}

/// A leased message. The holder must settle it exactly once.
#[async_trait]
pub trait TaskLease: Send + Sync {
    /// Encoded envelope as stored by the producer.
    fn bytes(&self) -> &[u8];

    fn queue(&self) -> &str;

    /// Success: remove the message for good.
    async fn ack(self: Box<Self>) -> Result<(), BrokerError>;

    /// Settle this delivery and enqueue `bytes` on the same queue after `delay`.
    async fn retry(self: Box<Self>, bytes: Vec<u8>, delay: Duration) -> Result<(), BrokerError>;

    /// Settle this delivery into the dead-letter set.
    async fn dead_letter(self: Box<Self>, reason: String) -> Result<(), BrokerError>;

    /// Give the message back untouched (no attempt consumed).
    async fn release(self: Box<Self>) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Write one message; it becomes visible after `delay`.
    async fn enqueue(&self, queue: &str, bytes: Vec<u8>, delay: Duration)
    -> Result<(), BrokerError>;

    /// Non-blocking poll for one ready message on `queue`.
    async fn lease(&self, queue: &str) -> Result<Option<Box<dyn TaskLease>>, BrokerError>;

    async fn ping(&self) -> Result<(), BrokerError>;

    async fn counts(&self) -> Result<BTreeMap<String, QueueCounts>, BrokerError>;

    /// Wake-up hint for pollers: returns when new work may be available or
    /// `timeout` elapsed, whichever first.
    async fn wait_for_work(&self, timeout: Duration) {
        tokio::time::sleep(timeout).await;
    }

    async fn close(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}
