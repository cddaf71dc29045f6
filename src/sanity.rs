//! Acceptance policies for incoming measurements.
//!
//! Three independent gates protect the estimator: a finiteness check on the
//! reported skew (a NaN here would poison every weight downstream), a
//! magnitude gate on the re-anchored offset with a warm-up and a tolerated
//! violation budget, and the step allowance that decides when an offset is
//! corrected by jumping the clock instead of slewing.

use log::warn;

use crate::config::TrackerConfig;

/// Outcome of the offset gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetVerdict {
    Accept,
    /// Drop the sample, keep going.
    Ignore,
    /// Drop the sample and terminate the current operating mode.
    EndMode,
}

pub struct SanityGate {
    max_offset_delay: i32,
    max_offset_ignore: i32,
    max_offset: f64,
    make_step_limit: i32,
    make_step_threshold: f64,
}

impl SanityGate {
    pub fn new(cfg: &TrackerConfig) -> Self {
        SanityGate {
            max_offset_delay: cfg.max_offset_delay,
            max_offset_ignore: cfg.max_offset_ignore,
            max_offset: cfg.max_offset,
            make_step_limit: cfg.make_step_limit,
            make_step_threshold: cfg.make_step_threshold,
        }
    }

    /// A skew that is not a finite number must never reach the fusion
    /// weights or the clock driver.
    pub fn skew_ok(skew: f64) -> bool {
        skew.is_finite()
    }

    pub fn offset_ok(&mut self, offset: f64) -> OffsetVerdict {
        if self.max_offset_delay < 0 {
            return OffsetVerdict::Accept;
        }
        if self.max_offset_delay > 0 {
            self.max_offset_delay -= 1;
            return OffsetVerdict::Accept;
        }
        if offset.abs() <= self.max_offset {
            return OffsetVerdict::Accept;
        }

        warn!(
            "Adjustment of {:.3} seconds exceeds the allowed maximum of {:.3} seconds ({})",
            -offset,
            self.max_offset,
            if self.max_offset_ignore == 0 {
                "exiting"
            } else {
                "ignored"
            }
        );
        if self.max_offset_ignore == 0 {
            OffsetVerdict::EndMode
        } else {
            if self.max_offset_ignore > 0 {
                self.max_offset_ignore -= 1;
            }
            OffsetVerdict::Ignore
        }
    }

    /// Whether the residual left after the pending correction warrants a
    /// step. A positive allowance is consumed on every call, spent or not.
    pub fn should_step(&mut self, offset: f64, uncorrected: f64) -> bool {
        if self.make_step_limit == 0 {
            return false;
        }
        if self.make_step_limit > 0 {
            self.make_step_limit -= 1;
        }
        (offset - uncorrected).abs() > self.make_step_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(delay: i32, ignore: i32, max_offset: f64) -> SanityGate {
        SanityGate::new(&TrackerConfig {
            max_offset_delay: delay,
            max_offset_ignore: ignore,
            max_offset,
            ..TrackerConfig::default()
        })
    }

    #[test]
    fn test_skew_guard_rejects_non_finite() {
        assert!(!SanityGate::skew_ok(f64::NAN));
        assert!(!SanityGate::skew_ok(f64::INFINITY));
        assert!(!SanityGate::skew_ok(f64::NEG_INFINITY));
        assert!(SanityGate::skew_ok(1e-7));
        assert!(SanityGate::skew_ok(1e-12));
    }

    #[test]
    fn test_offset_gate_disabled() {
        let mut g = gate(-1, 0, 0.1);
        for _ in 0..10 {
            assert_eq!(g.offset_ok(1000.0), OffsetVerdict::Accept);
        }
    }

    #[test]
    fn test_offset_gate_warmup_then_enforce() {
        let mut g = gate(2, 0, 0.5);
        // Two warm-up samples are accepted no matter how bad.
        assert_eq!(g.offset_ok(5.0), OffsetVerdict::Accept);
        assert_eq!(g.offset_ok(5.0), OffsetVerdict::Accept);
        // Third violation terminates the mode (no ignores left).
        assert_eq!(g.offset_ok(5.0), OffsetVerdict::EndMode);
        // In-range offsets are still fine.
        assert_eq!(g.offset_ok(0.2), OffsetVerdict::Accept);
    }

    #[test]
    fn test_offset_gate_ignore_budget() {
        let mut g = gate(0, 2, 0.5);
        assert_eq!(g.offset_ok(2.0), OffsetVerdict::Ignore);
        assert_eq!(g.offset_ok(2.0), OffsetVerdict::Ignore);
        assert_eq!(g.offset_ok(2.0), OffsetVerdict::EndMode);
    }

    #[test]
    fn test_offset_gate_ignore_forever() {
        let mut g = gate(0, -1, 0.5);
        for _ in 0..100 {
            assert_eq!(g.offset_ok(2.0), OffsetVerdict::Ignore);
        }
    }

    #[test]
    fn test_step_never_when_limit_zero() {
        let mut g = SanityGate::new(&TrackerConfig {
            make_step_limit: 0,
            make_step_threshold: 0.1,
            ..TrackerConfig::default()
        });
        assert!(!g.should_step(100.0, 0.0));
    }

    #[test]
    fn test_step_budget_consumed() {
        let mut g = SanityGate::new(&TrackerConfig {
            make_step_limit: 1,
            make_step_threshold: 0.1,
            ..TrackerConfig::default()
        });
        assert!(g.should_step(1.0, 0.0));
        // Budget spent, the next large offset is slewed.
        assert!(!g.should_step(1.0, 0.0));
    }

    #[test]
    fn test_step_unlimited() {
        let mut g = SanityGate::new(&TrackerConfig {
            make_step_limit: -1,
            make_step_threshold: 0.1,
            ..TrackerConfig::default()
        });
        for _ in 0..10 {
            assert!(g.should_step(1.0, 0.0));
        }
        assert!(!g.should_step(1.0, 0.95));
    }

    #[test]
    fn test_step_accounts_for_pending_correction() {
        let mut g = SanityGate::new(&TrackerConfig {
            make_step_limit: -1,
            make_step_threshold: 0.5,
            ..TrackerConfig::default()
        });
        // Offset is large but mostly already being slewed away.
        assert!(!g.should_step(1.0, 0.8));
        assert!(g.should_step(1.0, -0.2));
    }
}
