//! TaskEnvelope - 1 件の仕事とそのメタデータ
//!
//! broker に載るのはこの envelope を encode した bytes です。
//! - `id` は enqueue 時に一度だけ採番し、リトライ後も変わらない
//! - `attempt` はリトライごとにちょうど 1 増える
//! - 不変条件: `attempt <= max_retries <= MAX_RETRIES`, `0 < timeout <= MAX_TIMEOUT`

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::CourierError;
use super::ids::{CorrelationId, TaskId};
use super::task_type::TaskType;

/// Fields a producer supplies for a brand-new envelope (attempt 0).
#[derive(Debug, Clone)]
pub struct NewEnvelope {
    pub id: TaskId,
    pub task_type: TaskType,
    pub payload: Vec<u8>,
    pub queue: String,
    pub max_retries: u32,
    pub timeout: Duration,
    pub correlation_id: CorrelationId,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    id: TaskId,
    #[serde(rename = "type")]
    task_type: TaskType,
    #[serde(with = "base64_bytes")]
    payload: Vec<u8>,
    queue: String,
    max_retries: u32,
    attempt: u32,
    #[serde(rename = "timeout_ms", with = "duration_millis")]
    timeout: Duration,
    correlation_id: CorrelationId,
    enqueued_at: DateTime<Utc>,
}

impl TaskEnvelope {
    /// Upper bound on `max_retries`.
    pub const MAX_RETRIES: u32 = 1_000;

    /// Upper bound on the per-attempt timeout.
    pub const MAX_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

    /// Build the first attempt of a task.
    ///
    /// `timeout` is rounded up to whole milliseconds, which is the wire precision.
    pub fn new(parts: NewEnvelope) -> Result<Self, CourierError> {
        if parts.timeout > Self::MAX_TIMEOUT {
            return Err(CourierError::InvalidOptions(format!(
                "timeout must be at most {}ms",
                Self::MAX_TIMEOUT.as_millis()
            )));
        }
        let envelope = Self {
            id: parts.id,
            task_type: parts.task_type,
            payload: parts.payload,
            queue: parts.queue,
            max_retries: parts.max_retries,
            attempt: 0,
            timeout: ceil_millis(parts.timeout),
            correlation_id: parts.correlation_id,
            enqueued_at: parts.enqueued_at,
        };
        envelope
            .validate()
            .map_err(CourierError::InvalidOptions)?;
        Ok(envelope)
    }

    /// Checks the invariants every envelope must hold, on creation and after decode.
    pub fn validate(&self) -> Result<(), String> {
        if !self.task_type.is_valid() {
            return Err("task type must not be empty".to_string());
        }
        if self.queue.trim().is_empty() {
            return Err("queue must not be empty".to_string());
        }
        if self.timeout.is_zero() {
            return Err("timeout must be positive".to_string());
        }
        if self.timeout > Self::MAX_TIMEOUT {
            return Err(format!(
                "timeout must be at most {}ms",
                Self::MAX_TIMEOUT.as_millis()
            ));
        }
        if self.max_retries > Self::MAX_RETRIES {
            return Err(format!(
                "max_retries must be at most {}",
                Self::MAX_RETRIES
            ));
        }
        if self.attempt > self.max_retries {
            return Err(format!(
                "attempt {} exceeds max_retries {}",
                self.attempt, self.max_retries
            ));
        }
        Ok(())
    }

    /// The envelope for the next attempt, or `None` once retries are used up.
    pub fn next_attempt(&self) -> Option<TaskEnvelope> {
        if self.attempt >= self.max_retries {
            return None;
        }
        let mut next = self.clone();
        next.attempt += 1;
        Some(next)
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn task_type(&self) -> &TaskType {
        &self.task_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }
}

fn ceil_millis(duration: Duration) -> Duration {
    let whole = Duration::from_millis(duration.as_millis() as u64);
    if whole < duration {
        whole + Duration::from_millis(1)
    } else {
        whole
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ulid::Ulid;

    pub(crate) fn parts(max_retries: u32) -> NewEnvelope {
        NewEnvelope {
            id: TaskId::from_ulid(Ulid::new()),
            task_type: TaskType::new("worker:ping"),
            payload: b"hello".to_vec(),
            queue: "default".to_string(),
            max_retries,
            timeout: Duration::from_secs(30),
            correlation_id: CorrelationId::new("req-1"),
            enqueued_at: Utc::now(),
        }
    }

    pub(crate) fn sample(max_retries: u32) -> TaskEnvelope {
        TaskEnvelope::new(parts(max_retries)).unwrap()
    }

    #[test]
    fn new_envelope_starts_at_attempt_zero() {
        let env = sample(3);
        assert_eq!(env.attempt(), 0);
        assert_eq!(env.max_retries(), 3);
        assert_eq!(env.payload(), b"hello");
    }

    #[test]
    fn next_attempt_increments_by_one_until_max() {
        let env = sample(2);
        let a1 = env.next_attempt().unwrap();
        let a2 = a1.next_attempt().unwrap();
        assert_eq!(a1.attempt(), 1);
        assert_eq!(a2.attempt(), 2);
        assert_eq!(a2.id(), env.id());
        assert!(a2.next_attempt().is_none());
    }

    #[test]
    fn zero_retries_has_no_next_attempt() {
        assert!(sample(0).next_attempt().is_none());
    }

    #[test]
    fn rejects_zero_timeout_and_blank_queue() {
        let mut parts = NewEnvelope {
            id: TaskId::from_ulid(Ulid::new()),
            task_type: TaskType::new("t"),
            payload: vec![],
            queue: "default".to_string(),
            max_retries: 1,
            timeout: Duration::ZERO,
            correlation_id: CorrelationId::generate(),
            enqueued_at: Utc::now(),
        };
        assert!(matches!(
            TaskEnvelope::new(parts.clone()),
            Err(CourierError::InvalidOptions(_))
        ));

        parts.timeout = Duration::from_secs(1);
        parts.queue = " ".to_string();
        assert!(TaskEnvelope::new(parts).is_err());
    }

    #[test]
    fn sub_millisecond_timeout_rounds_up() {
        let env = TaskEnvelope::new(NewEnvelope {
            timeout: Duration::from_micros(300),
            ..parts(1)
        })
        .unwrap();
        assert_eq!(env.timeout(), Duration::from_millis(1));

        let env = TaskEnvelope::new(NewEnvelope {
            timeout: Duration::from_micros(1_500),
            ..parts(1)
        })
        .unwrap();
        assert_eq!(env.timeout(), Duration::from_millis(2));
    }

    #[test]
    fn rejects_options_beyond_the_bounds() {
        let err = TaskEnvelope::new(NewEnvelope {
            max_retries: u32::MAX,
            ..parts(0)
        })
        .unwrap_err();
        assert!(matches!(err, CourierError::InvalidOptions(m) if m.contains("max_retries")));

        let err = TaskEnvelope::new(NewEnvelope {
            timeout: Duration::MAX,
            ..parts(1)
        })
        .unwrap_err();
        assert!(matches!(err, CourierError::InvalidOptions(m) if m.contains("timeout")));

        assert!(TaskEnvelope::new(NewEnvelope {
            max_retries: TaskEnvelope::MAX_RETRIES,
            timeout: TaskEnvelope::MAX_TIMEOUT,
            ..parts(0)
        })
        .is_ok());
    }

    #[test]
    fn wire_shape_uses_type_and_timeout_ms() {
        let env = sample(3);
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["type"], "worker:ping");
        assert_eq!(v["timeout_ms"], 30_000);
        assert_eq!(v["payload"], "aGVsbG8=");
        assert_eq!(v["attempt"], 0);
    }
}
