//! Global sample grid
//!
//! Every table row sits on a tick: the number of sample periods since the Unix
//! epoch at an integer sample rate. Integer ticks keep padding, bucketing and
//! joins exact where floating-point timestamps would drift.

use chrono::{DateTime, Duration, Utc};

use crate::config::Granularity;

const NANOS_PER_SEC: i64 = 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleGrid {
    rate: u32,
}

impl SampleGrid {
    pub fn new(rate: u32) -> Self {
        Self { rate }
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    /// Nearest tick to `t`
    pub fn tick_of(&self, t: DateTime<Utc>) -> i64 {
        let rate = self.rate as i64;
        let sub = t.timestamp_subsec_nanos() as i64;
        t.timestamp() * rate + (sub * rate + NANOS_PER_SEC / 2) / NANOS_PER_SEC
    }

    /// UTC instant of a tick
    pub fn instant_of(&self, tick: i64) -> DateTime<Utc> {
        let nanos = (tick as i128 * NANOS_PER_SEC as i128).div_euclid(self.rate as i128);
        DateTime::<Utc>::from(std::time::UNIX_EPOCH) + Duration::nanoseconds(nanos as i64)
    }

    /// Number of ticks in `secs` seconds
    pub fn ticks_in(&self, secs: i64) -> i64 {
        secs * self.rate as i64
    }

    /// Ticks per granularity step
    pub fn step(&self, g: Granularity) -> i64 {
        self.ticks_in(g.seconds())
    }

    pub fn floor(&self, tick: i64, g: Granularity) -> i64 {
        let step = self.step(g);
        tick.div_euclid(step) * step
    }

    pub fn ceil(&self, tick: i64, g: Granularity) -> i64 {
        let step = self.step(g);
        -(-tick).div_euclid(step) * step
    }

    pub fn is_aligned(&self, tick: i64, g: Granularity) -> bool {
        tick.rem_euclid(self.step(g)) == 0
    }
}
