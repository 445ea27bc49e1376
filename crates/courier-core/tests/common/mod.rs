#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use courier_core::impls::InMemoryBroker;
use courier_core::ports::{Broker, QueueCounts};
use courier_core::{App, AppBuilder, CourierConfig, RetryPolicy};

pub fn config() -> CourierConfig {
    CourierConfig {
        concurrency: 2,
        retry: RetryPolicy::new(Duration::from_millis(100)),
        poll_interval: Duration::from_millis(10),
        ..CourierConfig::default()
    }
}

pub fn build(builder: AppBuilder) -> (App, Arc<InMemoryBroker>) {
    let broker = Arc::new(InMemoryBroker::new());
    let app = builder.build(broker.clone()).unwrap();
    (app, broker)
}

pub async fn counts(broker: &InMemoryBroker, queue: &str) -> QueueCounts {
    broker
        .counts()
        .await
        .unwrap()
        .get(queue)
        .copied()
        .unwrap_or_default()
}

/// Polls the counts of `queue` every millisecond (virtual time in paused
/// tests) until `check` holds, for up to 30s.
pub async fn wait_for_counts(
    broker: &InMemoryBroker,
    queue: &str,
    check: impl Fn(&QueueCounts) -> bool,
) -> QueueCounts {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let current = counts(broker, queue).await;
            if check(&current) {
                return current;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("queue counts did not reach the expected state in time")
}
