//! CourierConfig - プロセス起動時に一度だけ組み立てる設定値
//!
//! グローバル状態は持たない。各コンポーネントはコンストラクタで受け取る。

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::queue::names_by_priority;
use crate::domain::{CourierError, QUEUE_DEFAULT, QueueSpec, TaskEnvelope};
use crate::retry::RetryPolicy;

/// How the dispatcher picks the next queue to poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPolicy {
    /// Highest-weight non-empty queue first. Lower queues can starve.
    Strict,
    /// Smooth weighted round-robin over the queue weights.
    #[default]
    WeightedFair,
}

impl fmt::Display for DispatchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchPolicy::Strict => f.write_str("strict"),
            DispatchPolicy::WeightedFair => f.write_str("weighted"),
        }
    }
}

impl FromStr for DispatchPolicy {
    type Err = CourierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(DispatchPolicy::Strict),
            "weighted" | "weighted_fair" | "weighted-fair" => Ok(DispatchPolicy::WeightedFair),
            other => Err(CourierError::Config(format!(
                "unknown dispatch policy `{other}` (expected `strict` or `weighted`)"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CourierConfig {
    pub queues: Vec<QueueSpec>,
    pub dispatch_policy: DispatchPolicy,
    /// Number of worker slots.
    pub concurrency: usize,
    pub retry: RetryPolicy,
    /// Back-off between dispatcher polls when every queue is empty or the broker errors.
    pub poll_interval: Duration,
    pub visibility_timeout: Duration,
    pub worker_drain_timeout: Duration,
    pub http_drain_timeout: Duration,
    pub enqueue_timeout: Duration,
    pub health_check_timeout: Duration,
    pub default_queue: String,
    pub default_max_retries: u32,
    pub default_timeout: Duration,
    pub listen_addr: SocketAddr,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            queues: QueueSpec::defaults(),
            dispatch_policy: DispatchPolicy::default(),
            concurrency: 10,
            retry: RetryPolicy::default(),
            poll_interval: Duration::from_millis(100),
            visibility_timeout: Duration::from_secs(60),
            worker_drain_timeout: Duration::from_secs(30),
            http_drain_timeout: Duration::from_secs(10),
            enqueue_timeout: Duration::from_secs(2),
            health_check_timeout: Duration::from_secs(2),
            default_queue: QUEUE_DEFAULT.to_string(),
            default_max_retries: 3,
            default_timeout: Duration::from_secs(30),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

impl CourierConfig {
    /// Fail fast on values no component can work with.
    pub fn validate(&self) -> Result<(), CourierError> {
        if self.queues.is_empty() {
            return Err(config_err("at least one queue must be configured"));
        }
        let mut seen = HashSet::new();
        for queue in &self.queues {
            if queue.name.trim().is_empty() {
                return Err(config_err("queue name must not be empty"));
            }
            if queue.weight == 0 {
                return Err(config_err(format!(
                    "weight for queue `{}` must be positive",
                    queue.name
                )));
            }
            if !seen.insert(queue.name.as_str()) {
                return Err(config_err(format!("duplicate queue `{}`", queue.name)));
            }
        }
        if !self.has_queue(&self.default_queue) {
            return Err(config_err(format!(
                "default queue `{}` is not configured",
                self.default_queue
            )));
        }
        if self.concurrency == 0 {
            return Err(config_err("concurrency must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(config_err("retry jitter must be within [0, 1]"));
        }
        for (name, value) in [
            ("poll_interval", self.poll_interval),
            ("visibility_timeout", self.visibility_timeout),
            ("worker_drain_timeout", self.worker_drain_timeout),
            ("http_drain_timeout", self.http_drain_timeout),
            ("enqueue_timeout", self.enqueue_timeout),
            ("health_check_timeout", self.health_check_timeout),
            ("default_timeout", self.default_timeout),
        ] {
            if value.is_zero() {
                return Err(config_err(format!("{name} must be positive")));
            }
        }
        if self.default_timeout > TaskEnvelope::MAX_TIMEOUT {
            return Err(config_err(format!(
                "default_timeout must be at most {}ms",
                TaskEnvelope::MAX_TIMEOUT.as_millis()
            )));
        }
        if self.default_max_retries > TaskEnvelope::MAX_RETRIES {
            return Err(config_err(format!(
                "default_max_retries must be at most {}",
                TaskEnvelope::MAX_RETRIES
            )));
        }
        Ok(())
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.queues.iter().any(|q| q.name == name)
    }

    /// Queue names, highest weight first.
    pub fn queue_names(&self) -> Vec<String> {
        names_by_priority(&self.queues)
    }
}

fn config_err(message: impl Into<String>) -> CourierError {
    CourierError::Config(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("strict", DispatchPolicy::Strict)]
    #[case("weighted", DispatchPolicy::WeightedFair)]
    #[case("Weighted_Fair", DispatchPolicy::WeightedFair)]
    #[case(" weighted-fair ", DispatchPolicy::WeightedFair)]
    fn dispatch_policy_parses(#[case] input: &str, #[case] expected: DispatchPolicy) {
        assert_eq!(input.parse::<DispatchPolicy>().unwrap(), expected);
    }

    #[test]
    fn dispatch_policy_rejects_unknown_names() {
        assert!(matches!(
            "random".parse::<DispatchPolicy>(),
            Err(CourierError::Config(_))
        ));
    }

    #[test]
    fn default_config_is_valid() {
        let config = CourierConfig::default();
        config.validate().unwrap();
        assert_eq!(config.dispatch_policy, DispatchPolicy::WeightedFair);
        assert_eq!(config.queue_names(), vec!["critical", "default", "low"]);
    }

    #[rstest]
    #[case::no_queues(CourierConfig { queues: vec![], ..CourierConfig::default() })]
    #[case::duplicate_queue(CourierConfig {
        queues: vec![QueueSpec::new("default", 1), QueueSpec::new("default", 2)],
        ..CourierConfig::default()
    })]
    #[case::zero_weight(CourierConfig {
        queues: vec![QueueSpec::new("default", 0)],
        ..CourierConfig::default()
    })]
    #[case::missing_default_queue(CourierConfig {
        queues: vec![QueueSpec::new("critical", 1)],
        ..CourierConfig::default()
    })]
    #[case::zero_concurrency(CourierConfig { concurrency: 0, ..CourierConfig::default() })]
    #[case::zero_enqueue_timeout(CourierConfig {
        enqueue_timeout: Duration::ZERO,
        ..CourierConfig::default()
    })]
    #[case::huge_default_max_retries(CourierConfig {
        default_max_retries: u32::MAX,
        ..CourierConfig::default()
    })]
    #[case::huge_default_timeout(CourierConfig {
        default_timeout: Duration::from_secs(30 * 24 * 60 * 60),
        ..CourierConfig::default()
    })]
    #[case::jitter_out_of_range(CourierConfig {
        retry: RetryPolicy::default().with_jitter(1.5),
        ..CourierConfig::default()
    })]
    fn invalid_configs_are_rejected(#[case] config: CourierConfig) {
        assert!(matches!(config.validate(), Err(CourierError::Config(_))));
    }
}
