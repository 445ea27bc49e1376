//! Queue definitions: name + weight, fixed at startup.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Queue names shipped with the default configuration.
pub const QUEUE_CRITICAL: &str = "critical";
pub const QUEUE_DEFAULT: &str = "default";
pub const QUEUE_LOW: &str = "low";

/// A named queue and its share of dispatch slots.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueSpec {
    pub name: String,
    pub weight: u32,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>, weight: u32) -> Self {
        Self {
            name: name.into(),
            weight,
        }
    }

    /// `critical=6, default=3, low=1`
    pub fn defaults() -> Vec<QueueSpec> {
        vec![
            QueueSpec::new(QUEUE_CRITICAL, 6),
            QueueSpec::new(QUEUE_DEFAULT, 3),
            QueueSpec::new(QUEUE_LOW, 1),
        ]
    }
}

impl fmt::Display for QueueSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.weight)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueSpecParseError {
    #[error("expected `name=weight`, got `{0}`")]
    Format(String),

    #[error("queue name must not be empty")]
    EmptyName,

    #[error("weight for queue `{0}` must be a positive integer")]
    InvalidWeight(String),
}

impl FromStr for QueueSpec {
    type Err = QueueSpecParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, weight) = s
            .split_once('=')
            .ok_or_else(|| QueueSpecParseError::Format(s.to_string()))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(QueueSpecParseError::EmptyName);
        }
        let weight: u32 = weight
            .trim()
            .parse()
            .map_err(|_| QueueSpecParseError::InvalidWeight(name.to_string()))?;
        if weight == 0 {
            return Err(QueueSpecParseError::InvalidWeight(name.to_string()));
        }
        Ok(QueueSpec::new(name, weight))
    }
}

/// Queue names ordered by weight, highest first (ties keep configuration order).
pub fn names_by_priority(queues: &[QueueSpec]) -> Vec<String> {
    let mut sorted: Vec<&QueueSpec> = queues.iter().collect();
    sorted.sort_by(|a, b| b.weight.cmp(&a.weight));
    sorted.into_iter().map(|q| q.name.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::simple("critical=6", QueueSpec::new("critical", 6))]
    #[case::spaces(" low = 1 ", QueueSpec::new("low", 1))]
    fn parses_name_weight_pairs(#[case] input: &str, #[case] expected: QueueSpec) {
        assert_eq!(input.parse::<QueueSpec>().unwrap(), expected);
    }

    #[rstest]
    #[case::no_separator("critical", QueueSpecParseError::Format("critical".into()))]
    #[case::empty_name("=3", QueueSpecParseError::EmptyName)]
    #[case::zero_weight("low=0", QueueSpecParseError::InvalidWeight("low".into()))]
    #[case::negative("low=-1", QueueSpecParseError::InvalidWeight("low".into()))]
    fn rejects_bad_specs(#[case] input: &str, #[case] expected: QueueSpecParseError) {
        assert_eq!(input.parse::<QueueSpec>().unwrap_err(), expected);
    }

    #[test]
    fn priority_order_is_by_descending_weight() {
        let queues = vec![
            QueueSpec::new("low", 1),
            QueueSpec::new("critical", 6),
            QueueSpec::new("default", 3),
        ];
        assert_eq!(names_by_priority(&queues), vec!["critical", "default", "low"]);
    }
}
