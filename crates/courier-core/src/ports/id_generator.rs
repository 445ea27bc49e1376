//! IdGenerator port - task id の採番

use crate::domain::TaskId;
use crate::ports::Clock;
use ulid::Ulid;

/// Mints task ids. Called concurrently from every producer, hence `Send + Sync`.
pub trait IdGenerator: Send + Sync {
    fn generate_task_id(&self) -> TaskId;
}

/// Clock の時刻 + 乱数部で ULID を作る。
/// FixedClock を渡せば timestamp 部分が決定的になる。
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_task_id(&self) -> TaskId {
        let timestamp_ms = self.clock.now().timestamp_millis() as u64;
        TaskId::from(Ulid::from_parts(timestamp_ms, rand::random()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FixedClock, SystemClock};
    use chrono::{TimeZone, Utc};
    use std::collections::HashSet;

    #[test]
    fn task_ids_do_not_collide() {
        let ids = UlidGenerator::new(SystemClock);
        let seen: HashSet<TaskId> = (0..256).map(|_| ids.generate_task_id()).collect();
        assert_eq!(seen.len(), 256);
    }

    #[test]
    fn timestamp_part_follows_the_clock() {
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 9, 30, 0).unwrap();
        let ids = UlidGenerator::new(FixedClock::new(at));

        let a = ids.generate_task_id();
        let b = ids.generate_task_id();

        assert_ne!(a, b);
        assert_eq!(a.as_ulid().timestamp_ms(), at.timestamp_millis() as u64);
        assert_eq!(b.as_ulid().timestamp_ms(), at.timestamp_millis() as u64);
    }
}
