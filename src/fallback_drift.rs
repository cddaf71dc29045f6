//! Fallback drift estimation.
//!
//! While synchronised, the ladder maintains one estimate of the absolute
//! frequency per time constant `2^i` seconds. Short averages follow the
//! oscillator quickly but are noisy; long ones are stable but take hours to
//! build up. When synchronisation is lost the tracker walks up the ladder as
//! the outage grows, switching to progressively longer (and better) averages
//! of the clock's natural drift.

use log::debug;

/// Frequency jumps larger than this are treated as a discontinuity (a reset
/// of the absolute frequency, not oscillator behaviour) and restart the
/// affected averages.
const FREQ_DISCONTINUITY_PPM: f64 = 10.0;

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    freq_ppm: f64,
    /// Seconds of history accumulated so far.
    secs: f64,
}

/// What `schedule` decided: a frequency to push right now, and/or a timeout
/// to arm relative to the last reference update.
#[derive(Debug, Clone, Copy, Default)]
pub struct FallbackPlan {
    /// `(exponent, freq_ppm)` to apply immediately.
    pub apply_now: Option<(i32, f64)>,
    /// Seconds after the last reference update at which the armed slot
    /// becomes due.
    pub arm_delay: Option<f64>,
}

pub struct FallbackDrifts {
    min: i32,
    max: i32,
    slots: Vec<Slot>,
    /// Exponent of the slot currently in effect; 0 means none.
    next: i32,
    /// Exponent armed behind the outstanding timeout, if any.
    armed: Option<i32>,
}

impl FallbackDrifts {
    /// Slots are allocated only for `1 <= min <= max`; any other range
    /// disables the ladder entirely.
    pub fn new(min: i32, max: i32) -> Self {
        let enabled = min >= 1 && max >= min;
        FallbackDrifts {
            min,
            max,
            slots: if enabled {
                vec![Slot::default(); (max - min + 1) as usize]
            } else {
                Vec::new()
            },
            next: 0,
            armed: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.slots.is_empty()
    }

    /// Forget any armed or applied slot; the caller cancels the timeout.
    pub fn reset_armed(&mut self) {
        self.next = 0;
        self.armed = None;
    }

    pub fn release(&mut self) {
        self.slots.clear();
        self.reset_armed();
    }

    /// Fold the driver's absolute frequency after a good measurement into
    /// every slot. Updates after a long gap (or backwards time) would skew
    /// the windows and are skipped wholesale.
    pub fn update(&mut self, freq_ppm: f64, update_interval: f64, last_update_interval: f64) {
        if update_interval < 0.0 || update_interval > last_update_interval * 4.0 {
            return;
        }

        for (idx, slot) in self.slots.iter_mut().enumerate() {
            let secs = 2f64.powi(self.min + idx as i32);

            if (freq_ppm - slot.freq_ppm).abs() > FREQ_DISCONTINUITY_PPM {
                slot.secs = 0.0;
            }

            if slot.secs < secs {
                // Weighted mean over a 2*secs window until enough history
                // exists for exponential updating.
                let weight = 0.5 * update_interval;
                if slot.secs + weight <= 0.0 {
                    continue;
                }
                slot.freq_ppm =
                    (slot.freq_ppm * slot.secs + weight * freq_ppm) / (slot.secs + weight);
                slot.secs += weight;
            } else {
                slot.freq_ppm += (1.0 - (-update_interval / secs).exp()) * (freq_ppm - slot.freq_ppm);
            }
        }
    }

    /// Pick what to do for an outage of `unsynchronised` seconds: apply the
    /// largest mature slot already due, and arm the next one up the ladder.
    pub fn schedule(&mut self, unsynchronised: f64) -> FallbackPlan {
        let mut plan = FallbackPlan::default();
        if !self.is_enabled() || self.armed.is_some() {
            return plan;
        }

        for i in self.min..=self.max {
            let secs = 2f64.powi(i);
            let slot = self.slots[(i - self.min) as usize];
            if slot.secs < secs {
                continue;
            }
            if secs <= unsynchronised {
                if i > self.next {
                    plan.apply_now = Some((i, slot.freq_ppm));
                }
            } else {
                let reached = plan.apply_now.map(|(a, _)| a).unwrap_or(self.next);
                if i > reached {
                    self.armed = Some(i);
                    plan.arm_delay = Some(secs);
                }
                break;
            }
        }

        if let Some((i, freq)) = plan.apply_now {
            debug!("Fallback drift {} ({:.3} ppm) is due", i, freq);
            self.next = i;
        }
        plan
    }

    /// The outstanding timeout fired: hand back the armed slot's frequency
    /// and advance the cursor. The caller re-runs `schedule` to climb on.
    pub fn fire_armed(&mut self) -> Option<(i32, f64)> {
        let i = self.armed.take()?;
        self.next = i;
        Some((i, self.slots[(i - self.min) as usize].freq_ppm))
    }
}
