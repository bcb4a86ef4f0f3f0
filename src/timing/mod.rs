mod buffer;
mod clock;

pub use buffer::{ConflictPolicy, EventBuffer, EventKey, EventRange, MergeReport, RangeIter};
pub use clock::{Clock, ClockReader, ClockState, ManualSource, MonotonicSource, TickSource};

use crate::events::Tick;

pub const TICKS_PER_QUARTER: u64 = 960;

pub const MIN_BPM: f64 = 20.0;
pub const MAX_BPM: f64 = 400.0;

/// Ticks per minute at the given tempo. Kept as a product of integers so
/// whole-millisecond positions convert without rounding error.
fn ticks_per_minute(bpm: f64) -> f64 {
    bpm * TICKS_PER_QUARTER as f64
}

const MICROS_PER_MINUTE: f64 = 60_000_000.0;

pub fn micros_to_ticks(micros: f64, bpm: f64) -> f64 {
    micros * ticks_per_minute(bpm) / MICROS_PER_MINUTE
}

pub(crate) fn ticks_to_micros(ticks: f64, bpm: f64) -> f64 {
    ticks * MICROS_PER_MINUTE / ticks_per_minute(bpm)
}

pub fn millis_to_ticks(millis: f64, bpm: f64) -> Tick {
    micros_to_ticks(millis * 1000.0, bpm).round().max(0.0) as Tick
}

pub fn ticks_to_millis(ticks: Tick, bpm: f64) -> f64 {
    ticks as f64 * MICROS_PER_MINUTE / ticks_per_minute(bpm) / 1000.0
}
