//! Operating mode of the tracker.
//!
//! Outside `Normal` operation the estimator is bypassed: each mode consumes
//! exactly one measurement, acts on it, and reports completion through the
//! registered end handler.

use log::{info, warn};

use crate::traits::ClockDriver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Regular tracking through the estimator.
    Normal,
    /// Correct the initial offset, stepping when it is too large to slew.
    InitStepSlew,
    /// Step the clock once and stop.
    UpdateOnce,
    /// Report the offset once without touching the clock.
    PrintOnce,
    /// Consume measurements without acting.
    Ignore,
}

pub type ModeEndHandler = Box<dyn FnMut(bool)>;

pub struct ModeMachine {
    mode: Mode,
    end_handler: Option<ModeEndHandler>,
    init_step_threshold: f64,
}

impl ModeMachine {
    pub fn new(init_step_threshold: f64) -> Self {
        ModeMachine {
            mode: Mode::Normal,
            end_handler: None,
            init_step_threshold,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    pub fn set_end_handler(&mut self, handler: ModeEndHandler) {
        self.end_handler = Some(handler);
    }

    /// Terminate the current mode and report `result` to the handler.
    pub fn end(&mut self, result: bool) {
        self.mode = Mode::Ignore;
        if let Some(handler) = self.end_handler.as_mut() {
            handler(result);
        }
    }

    /// Feed one measurement (`valid = false` when synchronisation was lost
    /// before a usable sample arrived).
    pub fn on_measurement<C: ClockDriver>(&mut self, driver: &mut C, valid: bool, offset: f64) {
        match self.mode {
            Mode::Normal | Mode::Ignore => {}
            Mode::InitStepSlew => {
                if !valid {
                    warn!("No suitable source for initial correction");
                    self.end(false);
                    return;
                }
                let step = offset.abs() >= self.init_step_threshold;
                info!(
                    "System's initial offset: {:.6} seconds {}",
                    offset,
                    if step { "(step)" } else { "(slew)" }
                );
                let result = if step {
                    driver.apply_step(offset)
                } else {
                    driver.accumulate_offset(offset, 0.0)
                };
                if let Err(e) = result {
                    warn!("Could not correct initial offset: {}", e);
                    self.end(false);
                    return;
                }
                self.end(true);
            }
            Mode::UpdateOnce | Mode::PrintOnce => {
                if !valid {
                    self.end(false);
                    return;
                }
                let step = self.mode == Mode::UpdateOnce;
                info!(
                    "System clock wrong by {:.6} seconds ({})",
                    -offset,
                    if step { "step" } else { "ignored" }
                );
                if step {
                    if let Err(e) = driver.apply_step(offset) {
                        warn!("Could not step clock: {}", e);
                        self.end(false);
                        return;
                    }
                }
                self.end(true);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::MockClockDriver;
    use std::cell::Cell;
    use std::rc::Rc;

    fn with_handler(mut machine: ModeMachine) -> (ModeMachine, Rc<Cell<Option<bool>>>) {
        let result = Rc::new(Cell::new(None));
        let captured = result.clone();
        machine.set_end_handler(Box::new(move |ok| captured.set(Some(ok))));
        (machine, result)
    }

    #[test]
    fn test_init_step_slew_steps_large_offset() {
        let mut driver = MockClockDriver::new();
        driver
            .expect_apply_step()
            .withf(|offset| (offset - 0.5).abs() < 1e-12)
            .times(1)
            .returning(|_| Ok(()));

        let (mut machine, result) = with_handler(ModeMachine::new(0.1));
        machine.set_mode(Mode::InitStepSlew);
        machine.on_measurement(&mut driver, true, 0.5);

        assert_eq!(machine.mode(), Mode::Ignore);
        assert_eq!(result.get(), Some(true));
    }

    #[test]
    fn test_init_step_slew_slews_small_offset() {
        let mut driver = MockClockDriver::new();
        driver
            .expect_accumulate_offset()
            .withf(|offset, rate| (offset - 0.05).abs() < 1e-12 && *rate == 0.0)
            .times(1)
            .returning(|_, _| Ok(()));

        let (mut machine, result) = with_handler(ModeMachine::new(0.1));
        machine.set_mode(Mode::InitStepSlew);
        machine.on_measurement(&mut driver, true, 0.05);

        assert_eq!(result.get(), Some(true));
    }

    #[test]
    fn test_init_step_slew_fails_without_sample() {
        let mut driver = MockClockDriver::new();
        let (mut machine, result) = with_handler(ModeMachine::new(0.1));
        machine.set_mode(Mode::InitStepSlew);
        machine.on_measurement(&mut driver, false, 0.0);

        assert_eq!(machine.mode(), Mode::Ignore);
        assert_eq!(result.get(), Some(false));
    }

    #[test]
    fn test_update_once_steps() {
        let mut driver = MockClockDriver::new();
        driver.expect_apply_step().times(1).returning(|_| Ok(()));

        let (mut machine, result) = with_handler(ModeMachine::new(0.1));
        machine.set_mode(Mode::UpdateOnce);
        machine.on_measurement(&mut driver, true, 2.0);

        assert_eq!(result.get(), Some(true));
    }

    #[test]
    fn test_print_once_leaves_clock_alone() {
        let mut driver = MockClockDriver::new();

        let (mut machine, result) = with_handler(ModeMachine::new(0.1));
        machine.set_mode(Mode::PrintOnce);
        machine.on_measurement(&mut driver, true, 2.0);

        assert_eq!(result.get(), Some(true));
    }

    #[test]
    fn test_ignore_consumes_without_acting() {
        let mut driver = MockClockDriver::new();

        let (mut machine, result) = with_handler(ModeMachine::new(0.1));
        machine.set_mode(Mode::Ignore);
        machine.on_measurement(&mut driver, true, 2.0);
        machine.on_measurement(&mut driver, false, 0.0);

        assert_eq!(machine.mode(), Mode::Ignore);
        assert_eq!(result.get(), None);
    }
}
