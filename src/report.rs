use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::leap::Leap;

/// Full status snapshot for report consumers (monitoring, control sockets).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackingReport {
    pub ref_id: u32,
    pub ip_addr: Option<IpAddr>,
    pub stratum: u8,
    pub leap_status: Leap,
    pub ref_time: DateTime<Utc>,
    /// Offset still being slewed out of the clock, seconds.
    pub current_correction: f64,
    /// Absolute frequency of the local clock, ppm.
    pub freq_ppm: f64,
    pub resid_freq_ppm: f64,
    pub skew_ppm: f64,
    pub root_delay: f64,
    pub root_dispersion: f64,
    pub last_update_interval: f64,
    pub last_offset: f64,
    pub rms_offset: f64,
}

/// The values advertised to downstream clients, for the protocol encoder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceParams {
    pub is_synchronised: bool,
    pub leap_status: Leap,
    pub stratum: u8,
    pub ref_id: u32,
    pub ref_time: DateTime<Utc>,
    pub root_delay: f64,
    pub root_dispersion: f64,
}
