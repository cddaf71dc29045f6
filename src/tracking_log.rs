//! Append-only columnar log of reference updates.

use chrono::{DateTime, Utc};
use log::warn;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::IpAddr;
use std::path::Path;

use crate::leap::Leap;

const HEADER: &str = "   Date (UTC) Time     IP Address   St   Freq ppm   Skew ppm     Offset L Co  Offset sd Rem. corr.";

/// One row of the tracking log.
#[derive(Debug, Clone)]
pub struct TrackingRecord {
    pub when: DateTime<Utc>,
    pub ref_ip: Option<IpAddr>,
    pub ref_id: u32,
    pub stratum: u8,
    pub freq_ppm: f64,
    pub skew_ppm: f64,
    pub offset: f64,
    pub leap: Leap,
    pub combined_sources: u32,
    pub offset_sd: f64,
    pub uncorrected: f64,
}

pub struct TrackingLog {
    file: Option<File>,
}

impl TrackingLog {
    /// Open (or create) the log for appending; a fresh file gets the column
    /// header. Failures are logged and disable the log.
    pub fn open(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return TrackingLog { file: None };
        };

        let file = OpenOptions::new().create(true).append(true).open(path);
        let file = match file {
            Ok(mut file) => {
                let fresh = file.metadata().map(|m| m.len() == 0).unwrap_or(false);
                if fresh {
                    if let Err(e) = writeln!(file, "{}", HEADER) {
                        warn!("Could not write tracking log header: {}", e);
                    }
                }
                Some(file)
            }
            Err(e) => {
                warn!("Could not open tracking log {}: {}", path.display(), e);
                None
            }
        };
        TrackingLog { file }
    }

    pub fn append(&mut self, rec: &TrackingRecord) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        let row = format!(
            "{} {:<15} {:2} {:10.3} {:10.3} {:10.3e} {} {:2} {:10.3e} {:10.3e}",
            rec.when.format("%Y-%m-%d %H:%M:%S"),
            format_ref(rec.ref_ip, rec.ref_id),
            rec.stratum,
            rec.freq_ppm,
            rec.skew_ppm,
            rec.offset,
            rec.leap.log_char(),
            rec.combined_sources,
            rec.offset_sd,
            rec.uncorrected,
        );
        if let Err(e) = writeln!(file, "{}", row) {
            warn!("Could not write tracking log record: {}", e);
        }
    }
}

/// Render the reference identity: the source IP when there is one, else the
/// 4-byte reference id as ASCII if printable, else as a dotted quad.
pub fn format_ref(ref_ip: Option<IpAddr>, ref_id: u32) -> String {
    if let Some(ip) = ref_ip {
        return ip.to_string();
    }
    let bytes = ref_id.to_be_bytes();
    if bytes.iter().all(|b| b.is_ascii_graphic()) {
        bytes.iter().map(|&b| b as char).collect()
    } else {
        format!("{}.{}.{}.{}", bytes[0], bytes[1], bytes[2], bytes[3])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::fs;
    use std::net::Ipv4Addr;
    use tempfile::tempdir;

    fn record() -> TrackingRecord {
        TrackingRecord {
            when: Utc.with_ymd_and_hms(2016, 12, 31, 12, 0, 0).unwrap(),
            ref_ip: None,
            ref_id: 0x4D414E55,
            stratum: 1,
            freq_ppm: -3.514,
            skew_ppm: 0.25,
            offset: 1.0e-2,
            leap: Leap::InsertSecond,
            combined_sources: 1,
            offset_sd: 1.0e-3,
            uncorrected: 0.0,
        }
    }

    #[test]
    fn test_format_ref_variants() {
        assert_eq!(format_ref(None, 0x4D414E55), "MANU");
        assert_eq!(format_ref(None, 0x7f7f0101), "127.127.1.1");
        assert_eq!(format_ref(None, 0), "0.0.0.0");
        assert_eq!(
            format_ref(Some(IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3))), 0x4D414E55),
            "10.1.2.3"
        );
    }

    #[test]
    fn test_header_written_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tracking.log");

        let mut log = TrackingLog::open(Some(&path));
        log.append(&record());
        drop(log);

        let mut log = TrackingLog::open(Some(&path));
        log.append(&record());
        drop(log);

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], HEADER);
        assert!(lines[1].starts_with("2016-12-31 12:00:00 MANU"));
    }

    #[test]
    fn test_row_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tracking.log");

        let mut log = TrackingLog::open(Some(&path));
        log.append(&record());
        drop(log);

        let content = fs::read_to_string(&path).unwrap();
        let row = content.lines().nth(1).unwrap();
        assert!(row.contains(" + "), "leap char missing: {}", row);
        assert!(row.contains("-3.514"));
        assert!(row.contains("0.250"));
    }

    #[test]
    fn test_disabled_log_is_silent() {
        let mut log = TrackingLog::open(None);
        log.append(&record());
    }
}
