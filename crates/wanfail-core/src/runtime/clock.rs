use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::telemetry::store::to_delta;

/// Wall-clock time derived from the tokio clock.
///
/// Anchored once; every later reading is the anchor plus monotonic elapsed
/// time, so a paused test runtime drives decision timestamps too.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    wall: DateTime<Utc>,
    mono: Instant,
}

impl Clock {
    pub fn start() -> Self {
        Self::starting_at(Utc::now())
    }

    pub fn starting_at(wall: DateTime<Utc>) -> Self {
        Self {
            wall,
            mono: Instant::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.wall + to_delta(self.mono.elapsed())
    }
}
