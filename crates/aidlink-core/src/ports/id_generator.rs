//! SessionIdGenerator - PollSession の ID 生成
//!
//! Clock の時刻を ULID の timestamp 部に使うので、FixedClock なら
//! timestamp 部分が決定的になる（ランダム部分は rand）。

use ulid::Ulid;

use crate::domain::SessionId;
use crate::ports::Clock;

pub trait IdGenerator: Send + Sync {
    fn generate_session_id(&self) -> SessionId;
}

pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_session_id(&self) -> SessionId {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        SessionId::from_ulid(Ulid::from_parts(timestamp_ms, rand::random()))
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
        assert_ne!(id_gen.generate_session_id(), id_gen.generate_session_id());
    }

    #[test]
    fn fixed_clock_pins_timestamp_part() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let id_gen = UlidGenerator::new(FixedClock::new(fixed_time));

        let id1 = id_gen.generate_session_id();
        let id2 = id_gen.generate_session_id();

        assert_ne!(id1, id2);
        assert_eq!(id1.as_ulid().timestamp_ms(), fixed_time.timestamp_millis() as u64);
        assert_eq!(id2.as_ulid().timestamp_ms(), fixed_time.timestamp_millis() as u64);
    }
}
