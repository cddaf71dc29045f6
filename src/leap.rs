//! Leap second determination.
//!
//! Sources report a leap indicator with each measurement, but the bits are
//! occasionally wrong (misconfigured upstream servers are a classic). When a
//! timezone with leap-second data is configured, the indicator reported as
//! `Normal` is cross-checked against the system timezone database; either
//! way, insertions and deletions are only honoured on the two days of the
//! year they can actually occur.

use chrono::{DateTime, Datelike, TimeZone, Utc};
use log::warn;
use serde::{Deserialize, Serialize};

/// Leap indicator carried in the reference state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Leap {
    Normal,
    InsertSecond,
    DeleteSecond,
    #[default]
    Unsynchronised,
}

impl Leap {
    /// Single-character rendering used in tracking records.
    pub fn log_char(self) -> char {
        match self {
            Leap::Normal => 'N',
            Leap::InsertSecond => '+',
            Leap::DeleteSecond => '-',
            Leap::Unsynchronised => '?',
        }
    }
}

/// Leap data changes at most twice a year; the timezone is requeried every
/// 12 hours.
const TZ_RECHECK_SECS: i64 = 12 * 3600;

pub struct LeapOracle {
    tzname: Option<String>,
    cached_key: i64,
    cached: Leap,
}

impl LeapOracle {
    pub fn new(tzname: Option<String>) -> Self {
        LeapOracle {
            tzname,
            cached_key: -1,
            cached: Leap::Normal,
        }
    }

    /// Probe the configured timezone on two dates with known answers.
    /// On failure the timezone is dropped and the oracle falls back to
    /// trusting source indicators. Returns whether a timezone is in use.
    pub fn validate(&mut self) -> bool {
        let Some(tz) = self.tzname.clone() else {
            return false;
        };

        let jun = Utc.with_ymd_and_hms(2008, 6, 30, 0, 0, 0).unwrap();
        let dec = Utc.with_ymd_and_hms(2008, 12, 31, 0, 0, 0).unwrap();
        if probe_tz(&tz, &jun) == Some(Leap::Normal) && probe_tz(&tz, &dec) == Some(Leap::InsertSecond)
        {
            true
        } else {
            warn!("Timezone {} failed leap second check, ignoring", tz);
            self.tzname = None;
            false
        }
    }

    /// Resolve the leap status for a measurement reporting `source` at `now`
    /// and the value to hand to the clock driver.
    pub fn status_for(&mut self, source: Leap, now: &DateTime<Utc>) -> (Leap, i8) {
        if source == Leap::Unsynchronised {
            return (Leap::Unsynchronised, 0);
        }

        let mut leap = source;
        if self.tzname.is_some() && leap == Leap::Normal {
            leap = self.tz_leap(now);
        }

        // Leap seconds can only occur at the end of June or December (UTC).
        if matches!(leap, Leap::InsertSecond | Leap::DeleteSecond) && !is_leap_day(now) {
            leap = Leap::Normal;
        }

        let applied = match leap {
            Leap::InsertSecond => 1,
            Leap::DeleteSecond => -1,
            _ => 0,
        };
        (leap, applied)
    }

    fn tz_leap(&mut self, now: &DateTime<Utc>) -> Leap {
        let key = now.timestamp() / TZ_RECHECK_SECS;
        if key == self.cached_key {
            return self.cached;
        }
        self.cached_key = key;
        self.cached = match self.tzname.as_deref().and_then(|tz| probe_tz(tz, now)) {
            Some(leap) => leap,
            None => {
                warn!("Could not query timezone for leap data");
                Leap::Normal
            }
        };
        self.cached
    }
}

fn is_leap_day(when: &DateTime<Utc>) -> bool {
    (when.month() == 6 && when.day() == 30) || (when.month() == 12 && when.day() == 31)
}

#[cfg(unix)]
extern "C" {
    fn tzset();
}

/// Ask the timezone database whether the UTC day of `when` ends in a leap
/// second, by normalizing 23:59:60 of that day under `TZ=<tz>`.
///
/// This temporarily mutates the process-global `TZ`; the tracker is the only
/// caller and runs on a single thread.
#[cfg(unix)]
fn probe_tz(tz: &str, when: &DateTime<Utc>) -> Option<Leap> {
    use std::ffi::CString;

    let saved = std::env::var_os("TZ");
    let name = CString::new("TZ").ok()?;
    let value = CString::new(tz).ok()?;

    let mut tm: libc::tm = unsafe { std::mem::zeroed() };
    tm.tm_year = when.year() - 1900;
    tm.tm_mon = when.month0() as i32;
    tm.tm_mday = when.day() as i32;
    tm.tm_hour = 23;
    tm.tm_min = 59;
    tm.tm_sec = 60;
    tm.tm_isdst = -1;

    let ret = unsafe {
        libc::setenv(name.as_ptr(), value.as_ptr(), 1);
        tzset();
        let ret = libc::mktime(&mut tm);
        match &saved {
            Some(old) => {
                // Values read from the environment are valid C strings.
                if let Ok(old) = CString::new(old.to_string_lossy().as_bytes()) {
                    libc::setenv(name.as_ptr(), old.as_ptr(), 1);
                }
            }
            None => {
                libc::unsetenv(name.as_ptr());
            }
        }
        tzset();
        ret
    };

    if ret == -1 {
        return None;
    }
    Some(match tm.tm_sec {
        60 => Leap::InsertSecond,
        1 => Leap::DeleteSecond,
        _ => Leap::Normal,
    })
}

#[cfg(not(unix))]
fn probe_tz(_tz: &str, _when: &DateTime<Utc>) -> Option<Leap> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, 0, 0).unwrap()
    }

    #[test]
    fn test_log_chars() {
        assert_eq!(Leap::Normal.log_char(), 'N');
        assert_eq!(Leap::InsertSecond.log_char(), '+');
        assert_eq!(Leap::DeleteSecond.log_char(), '-');
        assert_eq!(Leap::Unsynchronised.log_char(), '?');
    }

    #[test]
    fn test_unsynchronised_passes_through() {
        let mut oracle = LeapOracle::new(None);
        let (leap, applied) = oracle.status_for(Leap::Unsynchronised, &at(2016, 12, 31, 12));
        assert_eq!(leap, Leap::Unsynchronised);
        assert_eq!(applied, 0);
    }

    #[test]
    fn test_insert_allowed_on_leap_days() {
        let mut oracle = LeapOracle::new(None);

        let (leap, applied) = oracle.status_for(Leap::InsertSecond, &at(2016, 12, 31, 12));
        assert_eq!(leap, Leap::InsertSecond);
        assert_eq!(applied, 1);

        let (leap, applied) = oracle.status_for(Leap::DeleteSecond, &at(2015, 6, 30, 3));
        assert_eq!(leap, Leap::DeleteSecond);
        assert_eq!(applied, -1);
    }

    #[test]
    fn test_insert_downgraded_off_leap_days() {
        let mut oracle = LeapOracle::new(None);

        for when in [at(2016, 1, 15, 12), at(2016, 12, 30, 23), at(2016, 7, 1, 0)] {
            let (leap, applied) = oracle.status_for(Leap::InsertSecond, &when);
            assert_eq!(leap, Leap::Normal, "at {}", when);
            assert_eq!(applied, 0);
        }
    }

    #[test]
    fn test_normal_without_tz_stays_normal() {
        let mut oracle = LeapOracle::new(None);
        let (leap, applied) = oracle.status_for(Leap::Normal, &at(2016, 12, 31, 12));
        assert_eq!(leap, Leap::Normal);
        assert_eq!(applied, 0);
    }

    /// Plain UTC carries no leap table, so 23:59:60 normalizes to 00:00:00
    /// of the next day and validation must reject it.
    #[cfg(unix)]
    #[test]
    fn test_validate_rejects_leapless_zone() {
        let mut oracle = LeapOracle::new(Some("UTC0".to_string()));
        assert!(!oracle.validate());

        // Once rejected, the oracle trusts the source indicator only.
        let (leap, _) = oracle.status_for(Leap::Normal, &at(2016, 12, 31, 12));
        assert_eq!(leap, Leap::Normal);
    }

    #[test]
    fn test_cache_key_granularity() {
        // Two instants within the same 12 h window share a cache slot.
        let a = at(2016, 12, 31, 1).timestamp() / TZ_RECHECK_SECS;
        let b = at(2016, 12, 31, 11).timestamp() / TZ_RECHECK_SECS;
        let c = at(2016, 12, 31, 13).timestamp() / TZ_RECHECK_SECS;
        assert_eq!(a, b);
        assert_ne!(b, c);
    }
}
