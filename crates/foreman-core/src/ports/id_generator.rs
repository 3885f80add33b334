//! IdGenerator port - ID 生成の抽象化
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース（本番用）

use std::sync::Mutex;
use std::time::SystemTime;

use ulid::{Generator, Ulid};

use crate::domain::{ProofId, RunId, TaskId};
use crate::ports::Clock;

/// IdGenerator は分散システムで使える ID を生成
///
/// # Thread Safety
/// - `Send + Sync` を要求（複数 worker / loop から使う）
pub trait IdGenerator: Send + Sync {
    fn task_id(&self) -> TaskId;

    fn run_id(&self) -> RunId;

    fn proof_id(&self) -> ProofId;
}

/// UlidGenerator は ULID ベースの ID 生成器
///
/// Timestamps come from the injected [`Clock`]. Within one millisecond the
/// ids are monotonic, so ids generated in order also sort in order; the queue
/// relies on this to break `created_at` ties FIFO.
pub struct UlidGenerator<C> {
    clock: C,
    monotonic: Mutex<Generator>,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            monotonic: Mutex::new(Generator::new()),
        }
    }

    fn next(&self) -> Ulid {
        let now = self.clock.now();
        let at = SystemTime::from(now);
        let mut generator = self
            .monotonic
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match generator.generate_from_datetime(at) {
            Ok(ulid) => ulid,
            // 同一ミリ秒内で乱数部が溢れた場合のみ。順序保証は諦める
            Err(_) => Ulid::from_parts(now.timestamp_millis().max(0) as u64, rand::random()),
        }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn task_id(&self) -> TaskId {
        TaskId::from(self.next())
    }

    fn run_id(&self) -> RunId {
        RunId::from(self.next())
    }

    fn proof_id(&self) -> ProofId {
        ProofId::from(self.next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{ManualClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn ulid_generator_generates_unique_ids() {
        let id_gen = UlidGenerator::new(SystemClock);

        let id1 = id_gen.task_id();
        let id2 = id_gen.task_id();
        let id3 = id_gen.task_id();

        assert_ne!(id1, id2);
        assert_ne!(id2, id3);
        assert_ne!(id1, id3);
    }

    #[test]
    fn ids_from_a_frozen_clock_share_timestamp_and_stay_ordered() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let id_gen = UlidGenerator::new(ManualClock::new(fixed_time));

        let id1 = id_gen.task_id();
        let id2 = id_gen.task_id();

        assert!(id1 < id2);
        assert_eq!(id1.as_ulid().timestamp_ms(), id2.as_ulid().timestamp_ms());
        assert_eq!(
            id1.as_ulid().timestamp_ms(),
            fixed_time.timestamp_millis() as u64
        );
    }

    #[test]
    fn different_id_types_are_generated() {
        let id_gen = UlidGenerator::new(SystemClock);

        assert!(id_gen.task_id().to_string().starts_with("task-"));
        assert!(id_gen.run_id().to_string().starts_with("run-"));
        assert!(id_gen.proof_id().to_string().starts_with("proof-"));
    }
}
