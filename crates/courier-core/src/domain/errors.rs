//! Errors - エラー型と分類
//!
//! - `HandlerError`: handler が返すエラー（Transient / Fatal を明示）
//! - `CourierError`: core 全体のエラー分類（運用上の taxonomy）

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::task_type::TaskType;

/// How a failed attempt should be treated by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// 一時的なエラー（リトライ推奨）。timeout も常にこちら。
    Transient,
    /// 恒久的なエラー（リトライ無意味）
    Fatal,
}

/// Error returned by a task handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("fatal failure: {0}")]
    Fatal(String),
}

impl HandlerError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            HandlerError::Transient(_) => FailureKind::Transient,
            HandlerError::Fatal(_) => FailureKind::Fatal,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            HandlerError::Transient(m) | HandlerError::Fatal(m) => m,
        }
    }
}

#[derive(Debug, Error)]
pub enum CourierError {
    #[error("no handler registered for task type `{0}`")]
    UnknownTaskType(TaskType),

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("transient failure: {0}")]
    TransientFailure(String),

    #[error("fatal failure: {0}")]
    FatalFailure(String),

    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// The broker refused (or did not confirm in time) a producer write.
    #[error("queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("drain deadline of {deadline:?} elapsed with {abandoned} task(s) still in flight")]
    DrainTimeout { deadline: Duration, abandoned: usize },

    #[error("unknown queue `{0}`")]
    UnknownQueue(String),

    #[error("invalid enqueue options: {0}")]
    InvalidOptions(String),

    #[error("duplicate handler for task type `{0}`")]
    DuplicateHandler(TaskType),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<HandlerError> for CourierError {
    fn from(err: HandlerError) -> Self {
        match err {
            HandlerError::Transient(m) => CourierError::TransientFailure(m),
            HandlerError::Fatal(m) => CourierError::FatalFailure(m),
        }
    }
}
