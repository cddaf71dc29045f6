//! Reference tracker - the clock-discipline core of the daemon.
//!
//! The tracker receives fused offset/frequency estimates from the source
//! pipeline, decides how the local clock should be corrected (slewed or
//! stepped), and maintains the values the daemon advertises as its own
//! reference to downstream clients.
//!
//! Key pieces wired together here:
//! - Measurement fusion: successive estimates are combined with
//!   inverse-variance weights so a noisy source cannot yank the frequency
//! - Step policy: offsets beyond a configured threshold consume a step
//!   allowance instead of being slewed
//! - Leap handling, drift-file persistence and the fallback-drift ladder
//!   that keeps steering the oscillator when synchronisation is lost

use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::net::IpAddr;

use crate::config::TrackerConfig;
use crate::drift_file;
use crate::fallback_drift::FallbackDrifts;
use crate::leap::{Leap, LeapOracle};
use crate::mode::{Mode, ModeEndHandler, ModeMachine};
use crate::notify::ChangeNotifier;
use crate::report::{ReferenceParams, TrackingReport};
use crate::sanity::{OffsetVerdict, SanityGate};
use crate::timeutil::{add_secs, diff_secs};
use crate::tracking_log::{TrackingLog, TrackingRecord};
use crate::traits::{ClockDriver, Scheduler, TimerId};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Floor for every skew the tracker stores or receives.
pub const MIN_SKEW: f64 = 1.0e-12;

/// Reference id advertised while serving local (orphan) time.
pub const LOCAL_REFERENCE_ID: u32 = 0x7f7f0101;

/// Reference id of operator-supplied settings ("MANU").
pub const MANUAL_REFERENCE_ID: u32 = 0x4d41_4e55;

/// Stratum advertised with no reference and no local mode.
const UNSYNCHRONISED_STRATUM: u8 = 16;

/// How much tracked time may pass before the drift file is rewritten.
const DRIFT_FILE_REWRITE_SECS: f64 = 3600.0;

// ============================================================================
// MEASUREMENT INPUT
// ============================================================================

/// One fused measurement from the source pipeline.
///
/// `offset` is positive when the local clock is ahead of the source at
/// `ref_time`; `frequency` and `skew` are dimensionless (s/s).
#[derive(Debug, Clone)]
pub struct RefUpdate {
    pub stratum: u8,
    pub leap: Leap,
    pub combined_sources: u32,
    pub ref_id: u32,
    pub ref_ip: Option<IpAddr>,
    pub ref_time: DateTime<Utc>,
    pub offset: f64,
    pub offset_sd: f64,
    pub frequency: f64,
    pub skew: f64,
    pub root_delay: f64,
    pub root_dispersion: f64,
}

// ============================================================================
// TRACKER
// ============================================================================

/// Single owner of the reference state, driven by the host event loop.
pub struct Tracker<C, S>
where
    C: ClockDriver,
    S: Scheduler,
{
    driver: C,
    scheduler: S,
    config: TrackerConfig,

    // Reference state
    synchronised: bool,
    leap_status: Leap,
    /// Last leap value pushed to the clock driver.
    leap_applied: i8,
    stratum: u8,
    ref_id: u32,
    ref_ip: Option<IpAddr>,
    /// The source-side timestamp the estimator was anchored to, exactly as
    /// received.
    ref_time: DateTime<Utc>,
    our_skew: f64,
    our_residual_freq: f64,
    root_delay: f64,
    root_dispersion: f64,

    // Offset statistics for reporting
    last_offset: f64,
    avg2_offset: f64,
    avg2_moving: bool,

    last_ref_update: Option<DateTime<Utc>>,
    last_ref_update_interval: f64,
    drift_file_age: f64,

    // Policy components
    gate: SanityGate,
    leap_oracle: LeapOracle,
    fb_drifts: FallbackDrifts,
    fb_timer: Option<TimerId>,
    mode: ModeMachine,
    notifier: ChangeNotifier,
    tracking_log: TrackingLog,

    // Local (orphan) reference
    local_enabled: bool,
    local_stratum: u8,

    /// Fractional skew bound for frequency absorption.
    max_update_skew: f64,
}

impl<C, S> Tracker<C, S>
where
    C: ClockDriver,
    S: Scheduler,
{
    /// Initialise the tracker: recover persisted frequency and skew, verify
    /// the leap timezone, and emit the initial unsynchronised record.
    pub fn new(config: TrackerConfig, mut driver: C, scheduler: S) -> Result<Self> {
        // Until a drift file or a measurement says otherwise, the frequency
        // uncertainty is total.
        let mut our_skew = 1.0;

        let mut loaded = false;
        if let Some(path) = &config.drift_file {
            if let Some((freq_ppm, skew_ppm)) = drift_file::load(path) {
                driver.set_absolute_frequency(freq_ppm)?;
                our_skew = (skew_ppm * 1.0e-6).max(MIN_SKEW);
                info!("Frequency {:.3} ppm read from {}", freq_ppm, path.display());
                loaded = true;
            }
        }
        if !loaded {
            info!(
                "Initial frequency {:.3} ppm",
                driver.absolute_frequency()?
            );
        }

        let mut leap_oracle = LeapOracle::new(config.leap_tzname.clone());
        leap_oracle.validate();

        let mut tracker = Tracker {
            gate: SanityGate::new(&config),
            fb_drifts: FallbackDrifts::new(config.fb_drift_min, config.fb_drift_max),
            fb_timer: None,
            mode: ModeMachine::new(config.init_step_threshold),
            notifier: ChangeNotifier::new(&config),
            tracking_log: TrackingLog::open(config.log_tracking.as_deref()),
            local_enabled: config.allow_local_reference,
            local_stratum: config.local_stratum,
            max_update_skew: config.max_update_skew_ppm * 1.0e-6,
            leap_oracle,
            driver,
            scheduler,
            config,
            synchronised: false,
            leap_status: Leap::Unsynchronised,
            leap_applied: 0,
            stratum: 0,
            ref_id: 0,
            ref_ip: None,
            ref_time: DateTime::<Utc>::default(),
            our_skew,
            our_residual_freq: 0.0,
            root_delay: 0.0,
            root_dispersion: 0.0,
            last_offset: 0.0,
            avg2_offset: 0.0,
            avg2_moving: false,
            last_ref_update: None,
            last_ref_update_interval: 0.0,
            drift_file_age: 0.0,
        };

        // First entry in the tracking log marks where this run began.
        tracker.set_unsynchronised()?;
        Ok(tracker)
    }

    /// Shut down: disarm any leap handed to the driver, persist the drift
    /// state and drop the fallback ladder.
    pub fn finalise(&mut self) {
        self.cancel_fb_timeout();

        if self.leap_applied != 0 {
            if let Err(e) = self.driver.set_leap(0) {
                warn!("Could not clear leap second: {}", e);
            }
            self.leap_applied = 0;
        }

        if let Some(path) = &self.config.drift_file {
            if self.drift_file_age > 0.0 {
                match self.driver.absolute_frequency() {
                    Ok(freq_ppm) => drift_file::store(path, freq_ppm, self.our_skew),
                    Err(e) => warn!("Could not read frequency for drift file: {}", e),
                }
            }
        }

        self.fb_drifts.release();
    }

    // ========================================================================
    // MEASUREMENT INTAKE
    // ========================================================================

    /// Process one measurement from the source pipeline.
    pub fn set_reference(&mut self, update: &RefUpdate) -> Result<()> {
        self.cancel_fb_timeout();
        self.fb_drifts.reset_armed();

        if self.mode.mode() != Mode::Normal {
            self.mode
                .on_measurement(&mut self.driver, true, update.offset);
            return Ok(());
        }

        // NaN survives the clamp (any comparison with it is false) and is
        // caught by the finiteness check before it can reach a weight.
        let skew = if update.skew < MIN_SKEW {
            MIN_SKEW
        } else {
            update.skew
        };
        if !SanityGate::skew_ok(skew) {
            warn!(
                "Ignoring reference update with invalid skew {}",
                update.skew
            );
            return Ok(());
        }

        let raw = self.driver.raw_time()?;
        let uncorrected = self.driver.pending_offset()?;
        let now = add_secs(&raw, uncorrected);

        // Re-anchor the sample from the source's epoch to now.
        let our_offset = update.offset + diff_secs(&now, &update.ref_time) * update.frequency;

        match self.gate.offset_ok(our_offset) {
            OffsetVerdict::Accept => {}
            OffsetVerdict::Ignore => return Ok(()),
            OffsetVerdict::EndMode => {
                self.mode.end(false);
                return Ok(());
            }
        }

        self.synchronised = update.leap != Leap::Unsynchronised;
        self.stratum = update.stratum.saturating_add(1);
        self.ref_id = update.ref_id;
        self.ref_ip = update.ref_ip;
        self.ref_time = update.ref_time;
        self.root_delay = update.root_delay;
        self.root_dispersion = update.root_dispersion;

        let update_interval = match self.last_ref_update {
            Some(prev) => diff_secs(&now, &prev).max(0.0),
            None => 0.0,
        };
        self.last_ref_update = Some(match self.last_ref_update {
            Some(prev) if prev > now => prev,
            _ => now,
        });

        // Treat the area under offset-vs-time as the cost of a correction:
        // an offset of one source stddev is corrected within
        // correction_time_ratio * update_interval.
        let correction_rate =
            self.config.correction_time_ratio * 0.5 * update.offset_sd * update_interval;

        let (accumulate, step) = if self.gate.should_step(our_offset, uncorrected) {
            (uncorrected, our_offset - uncorrected)
        } else {
            (our_offset, 0.0)
        };

        if skew < self.max_update_skew || update.leap == Leap::Unsynchronised {
            let old_skew = self.our_skew;
            // Inverse-variance weights; prior state counts for nothing when
            // it was not synchronised (manual settings win outright).
            let old_weight = if self.synchronised {
                1.0 / (old_skew * old_skew)
            } else {
                0.0
            };
            let new_weight = 3.0 / (skew * skew);
            let sum_weight = old_weight + new_weight;

            // The clock already runs at the previously committed frequency,
            // so the prior delta is zero by convention.
            let fused = update.frequency * new_weight / sum_weight;
            let delta_old = -fused;
            let delta_new = update.frequency - fused;
            self.our_skew = ((delta_old * delta_old * old_weight
                + delta_new * delta_new * new_weight)
                / sum_weight)
                .sqrt()
                + (old_skew * old_weight + skew * new_weight) / sum_weight;
            self.our_residual_freq = update.frequency - fused;

            self.driver
                .accumulate_frequency_and_offset(fused, accumulate, correction_rate)?;
        } else {
            // Too noisy to trust the frequency estimate at all.
            debug!("Skew {:.3} ppm too high to track frequency", skew * 1.0e6);
            self.our_residual_freq = update.frequency;
            self.driver.accumulate_offset(accumulate, correction_rate)?;
        }

        // The leap must reach the driver before a step lands on the same
        // tick, and both before the record is written.
        let (leap_status, leap_applied) = self.leap_oracle.status_for(update.leap, &now);
        self.leap_status = leap_status;
        if leap_applied != self.leap_applied {
            self.driver.set_leap(leap_applied)?;
            self.leap_applied = leap_applied;
        }

        self.notifier.offset_update(&now, our_offset);

        if step != 0.0 {
            self.driver.apply_step(step)?;
            warn!("System clock was stepped by {:.6} seconds", -step);
        }

        let abs_freq_ppm = self.driver.absolute_frequency()?;
        self.tracking_log.append(&TrackingRecord {
            when: now,
            ref_ip: update.ref_ip,
            ref_id: update.ref_id,
            stratum: self.stratum,
            freq_ppm: abs_freq_ppm,
            skew_ppm: self.our_skew * 1.0e6,
            offset: our_offset,
            leap: self.leap_status,
            combined_sources: update.combined_sources,
            offset_sd: update.offset_sd,
            uncorrected,
        });

        if let Some(path) = &self.config.drift_file {
            self.drift_file_age += update_interval;
            if self.drift_file_age < 0.0 || self.drift_file_age > DRIFT_FILE_REWRITE_SECS {
                drift_file::store(path, abs_freq_ppm, self.our_skew);
                self.drift_file_age = 0.0;
            }
        }

        if self.fb_drifts.is_enabled() {
            self.fb_drifts
                .update(abs_freq_ppm, update_interval, self.last_ref_update_interval);
        }

        self.last_ref_update_interval = update_interval;
        self.last_offset = our_offset;

        let square = our_offset * our_offset;
        if self.avg2_moving {
            self.avg2_offset += 0.1 * (square - self.avg2_offset);
        } else {
            if self.avg2_offset > 0.0 && self.avg2_offset < square {
                self.avg2_moving = true;
            }
            self.avg2_offset = square;
        }

        Ok(())
    }

    /// Operator-supplied reference settings. The zero old-state weight in
    /// the fusion means the operator's numbers win outright.
    pub fn set_manual_reference(
        &mut self,
        ref_time: DateTime<Utc>,
        offset: f64,
        frequency: f64,
        skew: f64,
    ) -> Result<()> {
        self.set_reference(&RefUpdate {
            stratum: 0,
            leap: Leap::Unsynchronised,
            combined_sources: 1,
            ref_id: MANUAL_REFERENCE_ID,
            ref_ip: None,
            ref_time,
            offset,
            offset_sd: 0.0,
            frequency,
            skew,
            root_delay: 0.0,
            root_dispersion: 0.0,
        })
    }

    /// Synchronisation has been lost: start the fallback-drift ladder and
    /// stop claiming a reference.
    pub fn set_unsynchronised(&mut self) -> Result<()> {
        if self.mode.mode() != Mode::Normal {
            self.mode.on_measurement(&mut self.driver, false, 0.0);
            return Ok(());
        }

        let raw = self.driver.raw_time()?;
        let uncorrected = self.driver.pending_offset()?;
        let now = add_secs(&raw, uncorrected);

        self.schedule_fb_drift(&now)?;

        let (leap_status, leap_applied) = self.leap_oracle.status_for(Leap::Unsynchronised, &now);
        self.leap_status = leap_status;
        if leap_applied != self.leap_applied {
            self.driver.set_leap(leap_applied)?;
            self.leap_applied = leap_applied;
        }
        self.synchronised = false;

        let abs_freq_ppm = self.driver.absolute_frequency()?;
        self.tracking_log.append(&TrackingRecord {
            when: now,
            ref_ip: None,
            ref_id: 0,
            stratum: 0,
            freq_ppm: abs_freq_ppm,
            skew_ppm: self.our_skew * 1.0e6,
            offset: 0.0,
            leap: self.leap_status,
            combined_sources: 0,
            offset_sd: 0.0,
            uncorrected: 0.0,
        });
        Ok(())
    }

    // ========================================================================
    // FALLBACK DRIFT
    // ========================================================================

    fn schedule_fb_drift(&mut self, now: &DateTime<Utc>) -> Result<()> {
        if !self.fb_drifts.is_enabled() || self.fb_timer.is_some() {
            return Ok(());
        }
        let Some(last) = self.last_ref_update else {
            return Ok(());
        };

        let unsynchronised = diff_secs(now, &last);
        let plan = self.fb_drifts.schedule(unsynchronised);
        if let Some((i, freq_ppm)) = plan.apply_now {
            info!("Fallback drift {} ({:.3} ppm) active", i, freq_ppm);
            self.driver.set_absolute_frequency(freq_ppm)?;
        }
        if let Some(delay) = plan.arm_delay {
            let at = add_secs(&last, delay);
            self.fb_timer = Some(self.scheduler.schedule(at));
        }
        Ok(())
    }

    /// Host callback for the timeout armed by `set_unsynchronised`: switch
    /// to the slot that has now matured and arm the next rung.
    pub fn fallback_timeout(&mut self) -> Result<()> {
        debug_assert!(!self.synchronised, "fallback timeout while synchronised");
        self.fb_timer = None;

        if let Some((i, freq_ppm)) = self.fb_drifts.fire_armed() {
            info!("Fallback drift {} ({:.3} ppm) active", i, freq_ppm);
            self.driver.set_absolute_frequency(freq_ppm)?;
        }

        let raw = self.driver.raw_time()?;
        let uncorrected = self.driver.pending_offset()?;
        let now = add_secs(&raw, uncorrected);
        self.schedule_fb_drift(&now)
    }

    fn cancel_fb_timeout(&mut self) {
        if let Some(id) = self.fb_timer.take() {
            self.scheduler.cancel(id);
        }
    }

    // ========================================================================
    // STATUS
    // ========================================================================

    /// The values to advertise downstream at `local_time`.
    pub fn reference_params(&self, local_time: &DateTime<Utc>) -> ReferenceParams {
        if self.synchronised {
            let elapsed = diff_secs(local_time, &self.ref_time);
            let error_rate = self.our_skew
                + self.our_residual_freq.abs()
                + self.driver.max_clock_error_ppm() * 1.0e-6;
            ReferenceParams {
                is_synchronised: true,
                leap_status: self.leap_status,
                stratum: self.stratum,
                ref_id: self.ref_id,
                ref_time: self.ref_time,
                root_delay: self.root_delay,
                root_dispersion: self.root_dispersion + error_rate * elapsed,
            }
        } else if self.local_enabled {
            ReferenceParams {
                is_synchronised: false,
                leap_status: Leap::Normal,
                stratum: self.local_stratum,
                ref_id: LOCAL_REFERENCE_ID,
                ref_time: add_secs(local_time, -1.0),
                root_delay: 0.0,
                root_dispersion: self.driver.precision(),
            }
        } else {
            ReferenceParams {
                is_synchronised: false,
                leap_status: Leap::Unsynchronised,
                stratum: 0,
                ref_id: 0,
                ref_time: DateTime::<Utc>::default(),
                root_delay: 1.0,
                root_dispersion: 1.0,
            }
        }
    }

    pub fn our_stratum(&self) -> u8 {
        if self.synchronised {
            self.stratum
        } else if self.local_enabled {
            self.local_stratum
        } else {
            UNSYNCHRONISED_STRATUM
        }
    }

    /// Full status snapshot for report consumers.
    pub fn tracking_report(&mut self, local_time: &DateTime<Utc>) -> Result<TrackingReport> {
        let params = self.reference_params(local_time);
        let current_correction = self.driver.pending_offset()?;
        let freq_ppm = self.driver.absolute_frequency()?;

        Ok(TrackingReport {
            ref_id: params.ref_id,
            ip_addr: if self.synchronised { self.ref_ip } else { None },
            stratum: params.stratum,
            leap_status: params.leap_status,
            ref_time: params.ref_time,
            current_correction,
            freq_ppm,
            resid_freq_ppm: self.our_residual_freq * 1.0e6,
            skew_ppm: self.our_skew * 1.0e6,
            root_delay: params.root_delay,
            root_dispersion: params.root_dispersion,
            last_update_interval: self.last_ref_update_interval,
            last_offset: self.last_offset,
            rms_offset: self.avg2_offset.sqrt(),
        })
    }

    // ========================================================================
    // SETTINGS
    // ========================================================================

    pub fn enable_local(&mut self, stratum: u8) {
        self.local_enabled = true;
        self.local_stratum = stratum;
    }

    pub fn disable_local(&mut self) {
        self.local_enabled = false;
    }

    pub fn is_local_active(&self) -> bool {
        self.local_enabled
    }

    pub fn modify_max_update_skew(&mut self, ppm: f64) {
        self.max_update_skew = ppm * 1.0e-6;
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.mode.set_mode(mode);
    }

    pub fn mode(&self) -> Mode {
        self.mode.mode()
    }

    pub fn set_mode_end_handler(&mut self, handler: ModeEndHandler) {
        self.mode.set_end_handler(handler);
    }

    /// Parameter-change notification from the clock driver, delivered as a
    /// message by the host loop (never as a reentrant callback). Keeps the
    /// update anchor in the driver's new timescale; an unknown external
    /// step invalidates it instead.
    pub fn handle_clock_change(
        &mut self,
        when: &DateTime<Utc>,
        dfreq: f64,
        doffset: f64,
        unknown_step: bool,
    ) {
        if unknown_step {
            self.last_ref_update = None;
        } else if let Some(anchor) = self.last_ref_update {
            let elapsed = diff_secs(when, &anchor);
            self.last_ref_update = Some(add_secs(&anchor, elapsed * dfreq - doffset));
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
