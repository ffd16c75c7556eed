//! IdGenerator port - ID 生成を trait の裏に置く。
//!
//! ULID の timestamp 部分は [`Clock`] から取るので、`FixedClock` の下で
//! 作った ID は固定された時刻でソートされます。乱数部分だけが実行ごとに
//! 変わります。
//!
//! # Implementations
//! - **UlidGenerator**: ULID-based, timestamp taken from a [`Clock`]

use crate::domain::{DeadLetterId, TaskId};
use crate::ports::Clock;
use ulid::Ulid;

/// Generates identifiers usable across processes without coordination.
pub trait IdGenerator: Send + Sync {
    fn generate_task_id(&self) -> TaskId;

    fn generate_dead_letter_id(&self) -> DeadLetterId;
}

/// ULID generator whose timestamp half comes from the injected clock,
/// so ids created under a `FixedClock` sort by the pinned time.
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_task_id(&self) -> TaskId {
        TaskId::from(self.next_ulid())
    }

    fn generate_dead_letter_id(&self) -> DeadLetterId {
        DeadLetterId::from(self.next_ulid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FixedClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn ulid_generator_generates_unique_ids() {
        let id_gen = UlidGenerator::new(SystemClock);

        let id1 = id_gen.generate_task_id();
        let id2 = id_gen.generate_task_id();
        let id3 = id_gen.generate_task_id();

        assert_ne!(id1, id2);
        assert_ne!(id2, id3);
        assert_ne!(id1, id3);
    }

    #[test]
    fn ulid_generator_uses_clock_timestamp() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let id_gen = UlidGenerator::new(FixedClock::new(fixed_time));

        let id1 = id_gen.generate_task_id();
        let id2 = id_gen.generate_dead_letter_id();

        assert_eq!(id1.as_ulid().timestamp_ms(), fixed_time.timestamp_millis() as u64);
        assert_eq!(id2.as_ulid().timestamp_ms(), fixed_time.timestamp_millis() as u64);
        assert!(id2.to_string().starts_with("dlq-"));
    }
}
