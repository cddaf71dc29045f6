use chrono::{DateTime, Duration, Utc};

/// Difference `a - b` in seconds.
pub fn diff_secs(a: &DateTime<Utc>, b: &DateTime<Utc>) -> f64 {
    let d = a.signed_duration_since(*b);
    d.num_seconds() as f64 + d.subsec_nanos() as f64 * 1e-9
}

/// `t + secs`, rounded to the nearest nanosecond.
pub fn add_secs(t: &DateTime<Utc>, secs: f64) -> DateTime<Utc> {
    *t + Duration::nanoseconds((secs * 1e9).round() as i64)
}
