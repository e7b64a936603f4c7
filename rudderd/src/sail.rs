//! sail.rs — sail winch state machine
//!
//! Simpler than the rudders: the winch needs no homing because the
//! boom carries an absolute angle sensor (BMMH). Instead, the skew
//! computer feeds us the measured slip between boom and motor, and the
//! commanded angle is corrected by it before conversion to a target
//! position. The winch also drives the mechanical boom brake through a
//! digital output; the brake release is written through the cache so
//! the valid-expiry keeps re-asserting it while in motion.

use tracing::debug;

use ebus_types::axis::{normalize_deg, MotorParams};
use ebus_types::register::*;

use crate::eposclient::{Bus, DeviceId};
use crate::rudder::Step;

/// Aiming precision for the sail; the winch gear is coarse.
pub const TOLERANCE_DEG: f64 = 1.0;

pub struct Sail {
    pub params: MotorParams,
    pub dev: DeviceId,
    /// Commanded sail angle; NaN holds.
    pub target_deg: f64,
    /// Latest skew input; NaN until the skew computer reports.
    pub skew_deg: f64,
    /// Storm sailing: keep the brake disengaged even when parked.
    pub storm: bool,
}

impl Sail {
    pub fn new(bus: &mut Bus, params: MotorParams) -> Self {
        let dev = bus.open_device(params.serial);
        Sail {
            params,
            dev,
            target_deg: f64::NAN,
            skew_deg: f64::NAN,
            storm: false,
        }
    }

    fn clear_fault(&self, bus: &mut Bus, status: u32) {
        debug!("{}: clearing fault 0x{:x}", self.params.label, status);
        bus.invalidate(self.dev, REG_CONTROL);
        bus.set_register(self.dev, REG_CONTROL, CONTROL_CLEARFAULT);
        bus.invalidate(self.dev, REG_ERROR);
        let _ = bus.get_register(self.dev, REG_ERROR);
        bus.invalidate(self.dev, REG_STATUS);
    }

    /// Program profile-position mode and the brake output, then switch
    /// the power stage on.
    pub fn init(&mut self, bus: &mut Bus) -> Step {
        let Some(status) = bus.get_register(self.dev, REG_STATUS) else {
            return Step::Defunct;
        };

        if status & STATUS_FAULT != 0 {
            self.clear_fault(bus, status);
            return Step::Defunct;
        }

        let Some(control) = bus.get_register(self.dev, REG_CONTROL) else {
            return Step::Defunct;
        };

        let tol = (self.params.angle_to_qc(TOLERANCE_DEG) - self.params.angle_to_qc(0.0)).abs();

        let mut r = bus.set_register(self.dev, REG_OPMODE, OPMODE_PPM);
        let config: [(Register, u32); 15] = [
            (Register::new(0x6065, 0), 0xffff_ffff), // max following error: the winch may slip
            (Register::new(0x6067, 0), tol as u32),  // position window [qc]
            (Register::new(0x6068, 0), 50),          // position time window [ms]
            (Register::new(0x607D, 1), 0x8000_0000), // min position limit: unbounded
            (Register::new(0x607D, 2), 0x7fff_ffff), // max position limit: unbounded
            (Register::new(0x607F, 0), 25000),       // max profile velocity [rpm]
            (Register::new(0x6081, 0), 8000),        // profile velocity [rpm]
            (Register::new(0x6083, 0), 10000),       // profile acceleration [rpm/s]
            (Register::new(0x6084, 0), 10000),       // profile deceleration [rpm/s]
            (Register::new(0x6085, 0), 10000),       // quickstop deceleration [rpm/s]
            (Register::new(0x6086, 0), 0),           // motion profile: linear ramps
            // brake on digital output 12
            (REG_OUTPUT_MASK, BRAKE_BIT),
            (REG_OUTPUT_POLARITY, 0),
            (REG_OUTPUT_SIGNAL4, BRAKE_OUTPUT),
            (REG_OUTPUT_STATE, 0), // brake off
        ];
        for (reg, value) in config {
            r &= bus.set_register(self.dev, reg, value);
        }
        if !r {
            bus.invalidate(self.dev, REG_CONTROL);
            bus.set_register(self.dev, REG_CONTROL, CONTROL_SHUTDOWN);
            bus.invalidate(self.dev, REG_STATUS);
            return Step::Defunct;
        }
        debug!("{}: configured", self.params.label);

        // all settings went through, so the shutdown from the previous
        // pass is what the control word now holds
        if control == CONTROL_SHUTDOWN {
            debug!("{}: final switchon", self.params.label);
            bus.invalidate(self.dev, REG_CONTROL);
            bus.set_register(self.dev, REG_CONTROL, CONTROL_SWITCHON);
            bus.invalidate(self.dev, REG_STATUS);
            return Step::Defunct;
        }

        Step::Targeting
    }

    /// Update the target position, skew-corrected, and start motion.
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

        if opmode != OPMODE_PPM {
            return Step::Homing;
        }
        if self.skew_deg.is_nan() {
            // without a skew estimate the conversion would be a guess
            return Step::Defunct;
        }
        if self.target_deg.is_nan() {
            return Step::Reached;
        }

        let curr_targ_qc = targpos as i32;
        let curr_targ_deg = self.params.qc_to_angle(curr_targ_qc);
        let delta_deg = normalize_deg(self.target_deg - self.skew_deg - curr_targ_deg);
        let new_targ_qc = curr_targ_qc + self.params.angle_to_qc(delta_deg);

        if new_targ_qc != curr_targ_qc {
            // release the brake first; the cache re-issues this write
            // whenever the valid expiry lapses
            if !bus.set_register(self.dev, REG_OUTPUT_STATE, 0) {
                return Step::Defunct;
            }
            debug!(
                "{}: target {:.1} -> {:.1}",
                self.params.label,
                curr_targ_deg,
                self.params.qc_to_angle(new_targ_qc)
            );
            status &= !STATUS_TARGETREACHED;
            bus.invalidate(self.dev, REG_CONTROL);
            bus.set_register(self.dev, REG_TARGPOS, new_targ_qc as u32);
            bus.set_register(self.dev, REG_CONTROL, CONTROL_START);
        }

        bus.invalidate(self.dev, REG_STATUS);
        if status & STATUS_TARGETREACHED != 0 {
            // parked: power down, and drop the brake unless storm
            // sailing wants the boom free
            bus.set_register(self.dev, REG_CONTROL, CONTROL_SHUTDOWN);
            if !self.storm {
                bus.set_register(self.dev, REG_OUTPUT_STATE, BRAKE_BIT);
            }
            Step::Reached
        } else {
            Step::Targeting
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eposclient::Bus;
    use crate::rudder::fakebus::FakeDevice;
    use ebus_types::axis::default_params;
    use ebus_types::MsgKind;
    use tokio::sync::mpsc;

    fn setup() -> (Bus, Sail, FakeDevice, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut bus = Bus::new(tx);
        let params = default_params()[2].clone();
        let serial = params.serial;
        let sail = Sail::new(&mut bus, params);
        (bus, sail, FakeDevice::new(serial), rx)
    }

    fn run_init(
        bus: &mut Bus,
        sail: &mut Sail,
        dev: &mut FakeDevice,
        rx: &mut mpsc::UnboundedReceiver<String>,
    ) -> Step {
        let mut state = Step::Defunct;
        for _ in 0..20 {
            state = sail.init(bus);
            if state == Step::Targeting {
                break;
            }
            dev.respond(bus, rx);
        }
        state
    }

    #[test]
    fn init_configures_brake_and_switches_on() {
        let (mut bus, mut sail, mut dev, mut rx) = setup();
        assert_eq!(run_init(&mut bus, &mut sail, &mut dev, &mut rx), Step::Targeting);

        // brake output mapping was programmed, brake left off
        assert_eq!(dev.sets_of(REG_OUTPUT_MASK), vec![BRAKE_BIT]);
        assert_eq!(dev.sets_of(REG_OUTPUT_POLARITY), vec![0]);
        assert_eq!(dev.sets_of(REG_OUTPUT_SIGNAL4), vec![BRAKE_OUTPUT]);
        assert_eq!(dev.sets_of(REG_OUTPUT_STATE), vec![0]);
        // power stage walked shutdown → switchon
        let controls = dev.sets_of(REG_CONTROL);
        assert_eq!(controls.last(), Some(&CONTROL_SWITCHON));
        assert!(controls.contains(&CONTROL_SHUTDOWN));
        assert_eq!(dev.sets_of(REG_OPMODE), vec![OPMODE_PPM]);
    }

    /// Drive control() with the device acking and reporting reached
    /// right after a target write.
    fn run_control(
        bus: &mut Bus,
        sail: &mut Sail,
        dev: &mut FakeDevice,
        rx: &mut mpsc::UnboundedReceiver<String>,
    ) -> Step {
        let mut state = Step::Defunct;
        for _ in 0..20 {
            state = sail.control(bus);
            if state == Step::Reached || state == Step::Homing {
                break;
            }
            for req in dev.respond(bus, rx) {
                if req.reg == REG_TARGPOS {
                    if let MsgKind::Set(_) = req.kind {
                        *dev.regs.entry(REG_STATUS).or_insert(0) |= STATUS_TARGETREACHED;
                    }
                }
            }
        }
        // flush the final round (shutdown / brake writes)
        dev.respond(bus, rx);
        state
    }

    fn ready_device(dev: &mut FakeDevice) {
        dev.regs.insert(REG_STATUS, 0);
        dev.regs.insert(REG_OPMODE, OPMODE_PPM);
        dev.regs.insert(REG_TARGPOS, 0);
        dev.regs.insert(REG_CONTROL, CONTROL_SWITCHON);
    }

    #[test]
    fn skew_compensation_shifts_the_target() {
        let (mut bus, mut sail, mut dev, mut rx) = setup();
        ready_device(&mut dev);
        sail.skew_deg = 5.0;
        sail.target_deg = 90.0;

        assert_eq!(run_control(&mut bus, &mut sail, &mut dev, &mut rx), Step::Reached);

        // commanded − skew, relative to a zero current target
        let want = sail.params.angle_to_qc(85.0) as u32;
        assert_eq!(dev.sets_of(REG_TARGPOS), vec![want]);
    }

    #[test]
    fn without_skew_the_sail_does_not_move() {
        let (mut bus, mut sail, mut dev, mut rx) = setup();
        ready_device(&mut dev);
        sail.target_deg = 90.0;
        // skew still NaN
        let mut state = Step::Defunct;
        for _ in 0..6 {
            state = sail.control(&mut bus);
            dev.respond(&mut bus, &mut rx);
        }
        assert_eq!(state, Step::Defunct);
        assert!(dev.sets_of(REG_TARGPOS).is_empty());
    }

    #[test]
    fn brake_engages_on_reached_unless_storm() {
        let (mut bus, mut sail, mut dev, mut rx) = setup();
        ready_device(&mut dev);
        sail.skew_deg = 0.0;
        sail.target_deg = 90.0;

        assert_eq!(run_control(&mut bus, &mut sail, &mut dev, &mut rx), Step::Reached);
        let brakes = dev.sets_of(REG_OUTPUT_STATE);
        // released for motion, engaged once parked
        assert_eq!(brakes.first(), Some(&0));
        assert_eq!(brakes.last(), Some(&BRAKE_BIT));
        assert!(dev.sets_of(REG_CONTROL).contains(&CONTROL_SHUTDOWN));
    }

    #[test]
    fn storm_flag_suppresses_brake_on() {
        let (mut bus, mut sail, mut dev, mut rx) = setup();
        ready_device(&mut dev);
        sail.skew_deg = 0.0;
        sail.target_deg = 90.0;
        sail.storm = true;

        assert_eq!(run_control(&mut bus, &mut sail, &mut dev, &mut rx), Step::Reached);
        // the brake was released for motion and never re-engaged
        assert_eq!(dev.sets_of(REG_OUTPUT_STATE), vec![0]);
        // but the power stage still shut down
        assert!(dev.sets_of(REG_CONTROL).contains(&CONTROL_SHUTDOWN));
    }

    #[test]
    fn wraparound_takes_the_short_way() {
        let (mut bus, mut sail, mut dev, mut rx) = setup();
        ready_device(&mut dev);
        // current target at +170°, commanded −170°: 20° through the wrap
        let start_qc = sail.params.angle_to_qc(170.0);
        dev.regs.insert(REG_TARGPOS, start_qc as u32);
        sail.skew_deg = 0.0;
        sail.target_deg = -170.0;

        assert_eq!(run_control(&mut bus, &mut sail, &mut dev, &mut rx), Step::Reached);
        let new_qc = dev.sets_of(REG_TARGPOS)[0] as i32;
        let delta_qc = new_qc - start_qc;
        // 20° of travel, sign per the sail's inverted qc axis
        let want = sail.params.angle_to_qc(20.0) - sail.params.angle_to_qc(0.0);
        assert_eq!(delta_qc, want);
    }

    #[test]
    fn fault_returns_homing_for_reinit() {
        let (mut bus, mut sail, mut dev, mut rx) = setup();
        ready_device(&mut dev);
        dev.regs.insert(REG_STATUS, STATUS_FAULT);
        sail.skew_deg = 0.0;
        sail.target_deg = 10.0;
        let state = run_control(&mut bus, &mut sail, &mut dev, &mut rx);
        assert_eq!(state, Step::Homing);
        assert!(dev.sets_of(REG_CONTROL).contains(&CONTROL_CLEARFAULT));
    }
}
