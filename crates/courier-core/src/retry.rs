//! Retry policy: decides whether and when a failed attempt runs again.
//!
//! ```text
//! next_delay(attempt) = base_delay * 2^attempt
//! attempt 0 → 1×base, attempt 1 → 2×base, attempt 2 → 4×base, ...
//! ```
//!
//! `attempt` is the attempt that just failed. Jitter is applied on top of the
//! exact value as `± random(0, delay * jitter)`. The result never exceeds
//! [`RetryPolicy::MAX_BACKOFF`], even for attempts where `2^attempt` overflows.

use std::time::Duration;

use rand::Rng;

use crate::domain::{Decision, FailureKind, HandlerError, TaskEnvelope};

/// Retry policy for failed tasks.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first failure (attempt 0).
    pub base_delay: Duration,

    /// Jitter factor in `[0.0, 1.0]`. 0 disables jitter.
    pub jitter: f64,

    /// Upper bound applied after doubling, before jitter.
    pub max_delay: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            jitter: 0.0,
            max_delay: None,
        }
    }
}

impl RetryPolicy {
    /// Hard ceiling on any single backoff, independent of `max_delay`.
    pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

    pub fn new(base_delay: Duration) -> Self {
        Self {
            base_delay,
            ..Self::default()
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Exact backoff for the failed `attempt`, without jitter.
    ///
    /// Clamped to [`MAX_BACKOFF`](Self::MAX_BACKOFF) for very large attempts.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let delay = match 2u32.checked_pow(attempt) {
            Some(factor) => self.base_delay.saturating_mul(factor),
            None => Self::MAX_BACKOFF,
        }
        .min(Self::MAX_BACKOFF);
        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    /// Backoff for the failed `attempt` with jitter drawn from `rng`.
    pub fn next_delay_jittered<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay = self.next_delay(attempt);
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = delay.as_secs_f64() * self.jitter.min(1.0);
        let offset = rng.gen_range(-spread..=spread);
        let jittered = (delay.as_secs_f64() + offset).max(0.0);
        Duration::try_from_secs_f64(jittered)
            .unwrap_or(delay)
            .min(Self::MAX_BACKOFF)
    }

    /// Decide what to do with `envelope` after `error`, using the thread rng for jitter.
    pub fn decide(&self, envelope: &TaskEnvelope, error: &HandlerError) -> Decision {
        self.decide_with(envelope, error, &mut rand::thread_rng())
    }

    /// Same as [`decide`](Self::decide) with an explicit rng.
    ///
    /// - Fatal → Drop
    /// - Transient with `attempt + 1 > max_retries` → Drop (retries exhausted)
    /// - otherwise → Retry on the same queue with `attempt + 1`
    pub fn decide_with<R: Rng + ?Sized>(
        &self,
        envelope: &TaskEnvelope,
        error: &HandlerError,
        rng: &mut R,
    ) -> Decision {
        if error.kind() == FailureKind::Fatal {
            return Decision::Drop {
                kind: FailureKind::Fatal,
                reason: error.message().to_string(),
            };
        }
        match envelope.next_attempt() {
            Some(next) => Decision::Retry {
                next,
                delay: self.next_delay_jittered(envelope.attempt(), rng),
            },
            None => Decision::Drop {
                kind: FailureKind::Transient,
                reason: format!(
                    "retries exhausted after {} attempt(s): {}",
                    envelope.attempt() + 1,
                    error.message()
                ),
            },
        }
    }
}
