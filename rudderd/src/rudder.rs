//! rudder.rs — rudder axis state machine
//!
//! Drives one rudder motor through fault-clear → configure → home →
//! target cycles in profile position mode. Each step function runs over
//! the register cache and returns immediately; the main loop calls it
//! again after every bus input until it settles.
//!
//! The split: [`Rudder::init`] works towards "homed and in PPM", then
//! [`Rudder::control`] tracks the commanded angle until homing or PPM
//! mode is lost (which sends the outer loop back to `init`).

use tracing::debug;

use ebus_types::axis::MotorParams;
use ebus_types::register::*;

use crate::eposclient::{Bus, DeviceId};

/// Aiming precision when targeting the rudder.
pub const TOLERANCE_DEG: f64 = 0.05;

/// Where a step left the axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Blocked on an in-flight register read.
    Defunct,
    /// Fault recovery or homing sequence in progress.
    Homing,
    /// In motion towards the commanded position.
    Targeting,
    /// Commanded target satisfied within tolerance.
    Reached,
}

pub struct Rudder {
    pub params: MotorParams,
    pub dev: DeviceId,
    /// Commanded angle; NaN holds the current position.
    pub target_deg: f64,
}

impl Rudder {
    pub fn new(bus: &mut Bus, params: MotorParams) -> Self {
        let dev = bus.open_device(params.serial);
        Rudder { params, dev, target_deg: f64::NAN }
    }

    /// Clear a FAULT bit: CLEARFAULT on the control word, and fetch the
    /// ERROR register so the monitor picks the code up from the bus.
    fn clear_fault(&self, bus: &mut Bus, status: u32) {
        debug!("{}: clearing fault 0x{:x}", self.params.label, status);
        bus.invalidate(self.dev, REG_CONTROL);
        bus.set_register(self.dev, REG_CONTROL, CONTROL_CLEARFAULT);
        bus.invalidate(self.dev, REG_ERROR);
        let _ = bus.get_register(self.dev, REG_ERROR);
        bus.invalidate(self.dev, REG_STATUS);
    }

    /// Work towards a state where the homed bit is set and we're in PPM
    /// mode.
    pub fn init(&mut self, bus: &mut Bus) -> Step {
        let Some(status) = bus.get_register(self.dev, REG_STATUS) else {
            return Step::Defunct;
        };

        if status & STATUS_FAULT != 0 {
            self.clear_fault(bus, status);
            return Step::Defunct;
        }

        let control = bus.get_register(self.dev, REG_CONTROL);
        let opmode = bus.get_register(self.dev, REG_OPMODE);
        let (Some(control), Some(opmode)) = (control, opmode) else {
            return Step::Defunct;
        };

        let delta = (self.params.angle_to_qc(TOLERANCE_DEG)
            - self.params.angle_to_qc(0.0))
        .abs();
        let minpos = self.params.home_pos_qc.min(self.params.extr_pos_qc) - 10 * delta;
        let maxpos = self.params.home_pos_qc.max(self.params.extr_pos_qc) + 10 * delta;
        // no limit switch on either rudder; home against the mechanical
        // stop, direction given by which end of the travel home is
        let method: u32 = if self.params.home_pos_qc < self.params.extr_pos_qc { 1 } else { 2 };

        // The inverter makes 5 A; enough to pull out a wedged rudder,
        // and the threshold at which gear friction reads as the stop.
        let config: [(Register, u32); 19] = [
            (Register::new(0x6410, 1), 5000),         // continuous current limit [mA]
            (Register::new(0x2080, 0), 1000),         // homing current threshold [mA]
            (Register::new(0x2081, 0), 0),            // home position [qc]
            (Register::new(0x6065, 0), (50 * delta) as u32), // max following error [qc]
            (Register::new(0x6067, 0), delta as u32), // position window [qc]
            (Register::new(0x6068, 0), 50),           // position time window [ms]
            (Register::new(0x607C, 0), 0),            // home offset [qc]
            (Register::new(0x607D, 1), minpos as u32), // min position limit
            (Register::new(0x607D, 2), maxpos as u32), // max position limit
            (Register::new(0x607F, 0), 8000),         // max profile velocity [rpm]
            (Register::new(0x6081, 0), 3000),         // profile velocity [rpm]
            (Register::new(0x6083, 0), 10000),        // profile acceleration [rpm/s]
            (Register::new(0x6084, 0), 10000),        // profile deceleration [rpm/s]
            (Register::new(0x6085, 0), 10000),        // quickstop deceleration [rpm/s]
            (Register::new(0x6086, 0), 0),            // motion profile: linear ramps
            (Register::new(0x6098, 0), method),       // homing method
            (Register::new(0x6099, 1), 1500),         // switch search speed [rpm]
            (Register::new(0x6099, 2), 300),          // zero search speed [rpm]
            (Register::new(0x609A, 0), 5000),         // homing acceleration [rpm/s]
        ];
        let mut r = true;
        for (reg, value) in config {
            r &= bus.set_register(self.dev, reg, value);
        }
        if !r {
            bus.invalidate(self.dev, REG_CONTROL);
            bus.set_register(self.dev, REG_CONTROL, CONTROL_SHUTDOWN);
            return Step::Defunct;
        }
        debug!("{}: configured", self.params.label);

        if status & STATUS_HOMEREF == 0 {
            if opmode != OPMODE_HOMING {
                debug!("{}: set opmode homing", self.params.label);
                bus.set_register(self.dev, REG_OPMODE, OPMODE_HOMING);
                bus.invalidate(self.dev, REG_CONTROL);
                bus.set_register(self.dev, REG_CONTROL, CONTROL_SHUTDOWN);
                bus.invalidate(self.dev, REG_STATUS);
                return Step::Homing;
            }

            if control == CONTROL_SHUTDOWN {
                debug!("{}: homing, switchon", self.params.label);
                bus.set_register(self.dev, REG_CONTROL, CONTROL_SWITCHON);
            } else if control == CONTROL_SWITCHON {
                debug!("{}: homing, start", self.params.label);
                bus.set_register(self.dev, REG_CONTROL, CONTROL_START);
            } else if control == CONTROL_START && status & STATUS_HOMINGERROR == 0 {
                debug!("{}: homing, waiting", self.params.label);
            } else {
                // homing error, or a control word we never issued
                debug!(
                    "{}: homing bad state: control 0x{:x}, status 0x{:x}",
                    self.params.label, control, status
                );
                bus.invalidate(self.dev, REG_OPMODE);
                bus.set_register(self.dev, REG_OPMODE, OPMODE_HOMING);
                bus.invalidate(self.dev, REG_CONTROL);
                bus.set_register(self.dev, REG_CONTROL, CONTROL_SHUTDOWN);
            }

            bus.invalidate(self.dev, REG_STATUS);
            return Step::Homing;
        }

        debug!("{}: homeref ok", self.params.label);

        if opmode != OPMODE_PPM {
            debug!("{}: set opmode PPM", self.params.label);
            bus.set_register(self.dev, REG_OPMODE, OPMODE_PPM);
            bus.invalidate(self.dev, REG_CONTROL);
            bus.set_register(self.dev, REG_CONTROL, CONTROL_SHUTDOWN);
            bus.invalidate(self.dev, REG_STATUS);
            return Step::Defunct;
        }

        if control != CONTROL_SWITCHON {
            debug!("{}: final switchon", self.params.label);
            bus.invalidate(self.dev, REG_CONTROL);
            bus.set_register(self.dev, REG_CONTROL, CONTROL_SWITCHON);
            bus.invalidate(self.dev, REG_STATUS);
            return Step::Defunct;
        }

        Step::Targeting
    }

    /// Track the commanded angle; assumes `init` has finished.
    pub fn control(&mut self, bus: &mut Bus) -> Step {
        let Some(mut status) = bus.get_register(self.dev, REG_STATUS) else {
            return Step::Defunct;
        };

        if status & STATUS_FAULT != 0 {
            self.clear_fault(bus, status);
            return Step::Homing;
        }

        let opmode = bus.get_register(self.dev, REG_OPMODE);
        let targpos = bus.get_register(self.dev, REG_TARGPOS);
        let (Some(opmode), Some(targpos)) = (opmode, targpos) else {
            return Step::Defunct;
        };

        if status & STATUS_HOMEREF == 0 || opmode != OPMODE_PPM {
            return Step::Homing;
        }

        if self.target_deg.is_nan() {
            return Step::Reached;
        }

        let new_targ_qc = self.params.angle_to_qc(self.target_deg);
        if new_targ_qc != targpos as i32 {
            debug!(
                "{}: target {:.3} -> {:.3} deg",
                self.params.label,
                self.params.qc_to_angle(targpos as i32),
                self.target_deg
            );
            status &= !STATUS_TARGETREACHED;
            bus.invalidate(self.dev, REG_CONTROL);
            bus.set_register(self.dev, REG_TARGPOS, new_targ_qc as u32);
            bus.set_register(self.dev, REG_CONTROL, CONTROL_START);
        }

        bus.invalidate(self.dev, REG_STATUS);
        if status & STATUS_TARGETREACHED != 0 {
            Step::Reached
        } else {
            Step::Targeting
        }
    }
}
