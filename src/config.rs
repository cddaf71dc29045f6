use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Tunables for the reference tracker, read once at initialisation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Where to persist the `freq_ppm skew_ppm` pair, if anywhere.
    pub drift_file: Option<PathBuf>,

    /// Upper bound on measurement skew (ppm) for absorbing its frequency
    /// estimate into the absolute frequency.
    pub max_update_skew_ppm: f64,

    /// Shape parameter for the slew rate: an offset equal to the source
    /// stddev is corrected within this multiple of the update interval.
    pub correction_time_ratio: f64,

    /// Step allowance: > 0 counts remaining steps, < 0 is unlimited,
    /// 0 never steps.
    pub make_step_limit: i32,
    /// Residual offset (seconds) above which a step is taken.
    pub make_step_threshold: f64,

    /// Warm-up: number of initial updates accepted unconditionally
    /// (< 0 disables the offset gate entirely).
    pub max_offset_delay: i32,
    /// Violations tolerated after warm-up (< 0 ignores forever, 0 ends the
    /// current mode on the first one).
    pub max_offset_ignore: i32,
    /// Magnitude gate on the re-anchored offset, seconds.
    pub max_offset: f64,

    pub do_log_change: bool,
    pub log_change_threshold: f64,

    pub do_mail_change: bool,
    pub mail_change_threshold: f64,
    pub mail_change_user: Option<String>,

    /// Fallback-drift exponent range; enabled iff `1 <= min <= max`.
    /// Slot `i` averages over a `2^i` second window.
    pub fb_drift_min: i32,
    pub fb_drift_max: i32,

    /// Timezone with leap-second data to cross-check source leap bits.
    pub leap_tzname: Option<String>,

    /// Offset (seconds) at or above which `InitStepSlew` steps instead of
    /// slewing.
    pub init_step_threshold: f64,

    /// Serve time with a local (orphan) reference while unsynchronised.
    pub allow_local_reference: bool,
    pub local_stratum: u8,

    /// Append tracking records here, if set.
    pub log_tracking: Option<PathBuf>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            drift_file: None,
            max_update_skew_ppm: 1000.0,
            correction_time_ratio: 3.0,
            make_step_limit: 0,
            make_step_threshold: 0.0,
            max_offset_delay: -1,
            max_offset_ignore: 0,
            max_offset: 0.0,
            do_log_change: false,
            log_change_threshold: 1.0,
            do_mail_change: false,
            mail_change_threshold: 0.5,
            mail_change_user: None,
            fb_drift_min: 0,
            fb_drift_max: 0,
            leap_tzname: None,
            init_step_threshold: 0.1,
            allow_local_reference: false,
            local_stratum: 10,
            log_tracking: None,
        }
    }
}
