use anyhow::Result;
use chrono::{DateTime, Utc};

/// Handle for a pending one-shot timeout.
pub type TimerId = u64;

/// Interface to the local clock driver.
///
/// The driver owns the actual slewing machinery; the tracker only decides
/// what to feed it. Frequencies at the absolute surface
/// (`set_absolute_frequency`/`absolute_frequency`) are in ppm; the deltas
/// handed to `accumulate_*` are dimensionless (seconds per second). Offsets
/// are in seconds, positive when the local clock is ahead of the reference.
///
/// A `rate` of 0 means "no rate limit": correct as fast as driver policy
/// allows.
#[cfg_attr(test, mockall::automock)]
pub trait ClockDriver {
    /// Raw (unsmoothed) local time.
    fn raw_time(&mut self) -> Result<DateTime<Utc>>;

    /// Offset still being slewed out, i.e. the correction that has been
    /// requested but not yet applied.
    fn pending_offset(&mut self) -> Result<f64>;

    /// Commit a frequency delta and start slewing `offset` away at `rate`.
    fn accumulate_frequency_and_offset(&mut self, dfreq: f64, offset: f64, rate: f64) -> Result<()>;

    /// Start slewing `offset` away at `rate` without touching frequency.
    fn accumulate_offset(&mut self, offset: f64, rate: f64) -> Result<()>;

    /// Jump the clock immediately, removing `offset` seconds of error.
    fn apply_step(&mut self, offset: f64) -> Result<()>;

    fn set_absolute_frequency(&mut self, freq_ppm: f64) -> Result<()>;

    fn absolute_frequency(&mut self) -> Result<f64>;

    /// Arm an end-of-day leap: +1 inserts a second, -1 deletes one,
    /// 0 disarms.
    fn set_leap(&mut self, leap: i8) -> Result<()>;

    /// Worst-case frequency error the clock can gain between updates, ppm.
    fn max_clock_error_ppm(&self) -> f64;

    /// Precision quantum of the clock, seconds.
    fn precision(&self) -> f64;
}

/// One-shot timeout service provided by the host event loop.
///
/// When a timeout armed here fires, the host calls back into the tracker
/// (`Tracker::fallback_timeout`) on the same thread. The tracker keeps at
/// most one timeout outstanding at any time.
#[cfg_attr(test, mockall::automock)]
pub trait Scheduler {
    fn schedule(&mut self, at: DateTime<Utc>) -> TimerId;

    /// Cancel a pending timeout. Cancelling an already-fired id is a no-op.
    fn cancel(&mut self, id: TimerId);
}
