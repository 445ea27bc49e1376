//! Decision model: what happens to an envelope after a failed attempt.

use std::time::Duration;

use super::envelope::TaskEnvelope;
use super::errors::FailureKind;

/// The next action for a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Re-enqueue `next` (attempt + 1) on the same queue, visible after `delay`.
    Retry { next: TaskEnvelope, delay: Duration },

    /// Give up: dead-letter the task and report the failure once.
    Drop { kind: FailureKind, reason: String },
}

impl Decision {
    pub fn is_retry(&self) -> bool {
        matches!(self, Decision::Retry { .. })
    }
}

/// Final state of one dispatched envelope, as seen by the worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Succeeded,
    RetryScheduled,
    Dropped,
    /// Handed back to the broker untouched (shutdown started before it ran).
    Released,
}
