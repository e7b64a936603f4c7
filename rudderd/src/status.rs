//! status.rs — rudder/sail status aggregation
//!
//! Watches the STATUS and position responses of all four devices and
//! condenses them into `ruddersts:` lines for the planner. A rudder
//! angle is only trusted while its HOMEREF bit is up; losing homing
//! reports the angle as `nan` until the controller re-homes. The sail
//! angle comes straight from the absolute BMMH sensor.
//!
//! Emission is rate-limited per axis: a change of more than 0.1° asks
//! for a report, but no axis reports more often than the minimum
//! cadence, and a heartbeat goes out at the maximum cadence even with
//! nothing changing.

use ebus_types::axis::{normalize_deg, Axis, MotorParams};
use ebus_types::proto::RudderSts;
use ebus_types::register::{REG_BMMHPOS, REG_CURRPOS, REG_STATUS, STATUS_HOMEREF};
use ebus_types::{EbusMsg, MsgKind, Timer};

/// Angle change that counts as reportable.
const CHANGE_DEG: f64 = 0.1;

/// Reported axes (the two rudders and the boom angle).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reported {
    Left = 0,
    Right = 1,
    Sail = 2,
}

pub struct StatusAggregator {
    params: [MotorParams; 4],
    sts: RudderSts,
    homed: [bool; 2],
    /// Per-axis emission history; the last stop gates the next report.
    timers: [Timer; 3],
    last_emit_us: i64,
    min_us: i64,
    max_us: i64,
}

impl StatusAggregator {
    pub fn new(params: [MotorParams; 4], min_ms: i64, max_ms: i64) -> Self {
        StatusAggregator {
            params,
            sts: RudderSts::unknown(),
            homed: [false; 2],
            timers: [Timer::new(), Timer::new(), Timer::new()],
            last_emit_us: 0,
            min_us: min_ms * 1000,
            max_us: max_ms * 1000,
        }
    }

    /// Update `slot` and report whether it moved by more than the
    /// change threshold. A NaN-to-value transition does not count as a
    /// change (the max cadence will pick it up).
    fn upd(slot: &mut f64, value: f64) -> bool {
        let diff = value - *slot;
        *slot = value;
        diff * diff > CHANGE_DEG * CHANGE_DEG
    }

    /// Feed one bus line; returns a status message when one is due.
    pub fn handle(&mut self, line: &str, now_us: i64) -> Option<RudderSts> {
        let msg = EbusMsg::parse_response(line)?;
        let MsgKind::Ack(value) = msg.kind else { return None };

        let mut changed: Option<Reported> = None;
        let left = &self.params[Axis::Left as usize];
        let right = &self.params[Axis::Right as usize];
        let bmmh = &self.params[Axis::Bmmh as usize];

        if msg.serial == bmmh.serial && msg.reg == REG_BMMHPOS {
            let mut v = value as i64;
            if v >= 1 << 29 {
                v -= 1 << 30; // bmmh position is 30-bit signed
            }
            let ticks = (v & 4095) as i32;
            let angle = normalize_deg(bmmh.qc_to_angle(ticks));
            if Self::upd(&mut self.sts.sail_deg, angle) {
                changed = Some(Reported::Sail);
            }
        } else if msg.serial == left.serial && msg.reg == REG_STATUS {
            self.homed[0] = value & STATUS_HOMEREF != 0;
            if !self.homed[0] && !self.sts.rudder_l_deg.is_nan() {
                self.sts.rudder_l_deg = f64::NAN;
                changed = Some(Reported::Left);
            }
        } else if msg.serial == right.serial && msg.reg == REG_STATUS {
            self.homed[1] = value & STATUS_HOMEREF != 0;
            if !self.homed[1] && !self.sts.rudder_r_deg.is_nan() {
                self.sts.rudder_r_deg = f64::NAN;
                changed = Some(Reported::Right);
            }
        } else if msg.serial == left.serial && msg.reg == REG_CURRPOS && self.homed[0] {
            if Self::upd(&mut self.sts.rudder_l_deg, left.qc_to_angle(value as i32)) {
                changed = Some(Reported::Left);
            }
        } else if msg.serial == right.serial && msg.reg == REG_CURRPOS && self.homed[1] {
            if Self::upd(&mut self.sts.rudder_r_deg, right.qc_to_angle(value as i32)) {
                changed = Some(Reported::Right);
            }
        }

        let due_change = changed.is_some_and(|axis| {
            let last = self.timers[axis as usize].stopped().unwrap_or(0);
            now_us >= last + self.min_us
        });
        let due_heartbeat = now_us >= self.last_emit_us + self.max_us;
        if !due_change && !due_heartbeat {
            return None;
        }

        if let Some(axis) = changed {
            let t = &mut self.timers[axis as usize];
            t.tick(now_us, true);
            t.tick(now_us, false);
        }
        self.last_emit_us = now_us;
        self.sts.timestamp_ms = now_us / 1000;
        Some(self.sts)
    }

    /// Emission statistics for one axis (diagnostics).
    pub fn stats(&self, axis: usize) -> Option<ebus_types::TimerStats> {
        self.timers.get(axis).and_then(Timer::stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ebus_types::axis::default_params;

    const T0: i64 = 50_000_000_000;
    const LEFT: u32 = 0x09011145;
    const RIGHT: u32 = 0x09010537;
    const BMMH: u32 = 0x00001227;

    fn agg() -> StatusAggregator {
        StatusAggregator::new(default_params(), 250, 1000)
    }

    fn status_line(serial: u32, value: u32) -> String {
        format!("0x{serial:x}:0x6041[0] = 0x{value:x}")
    }

    fn currpos_line(serial: u32, qc: i32) -> String {
        format!("0x{serial:x}:0x6064[0] = 0x{:x}", qc as u32)
    }

    fn bmmh_line(ticks: u32) -> String {
        format!("0x{BMMH:x}:0x6004[0] = 0x{ticks:x}")
    }

    #[test]
    fn unhomed_rudder_position_is_ignored() {
        let mut a = agg();
        // the very first input produces the initial (all-nan) report
        let sts = a.handle(&currpos_line(LEFT, -100000), T0).expect("first report");
        assert!(sts.rudder_l_deg.is_nan());
        assert!(a.sts.rudder_l_deg.is_nan());
    }

    #[test]
    fn homed_rudder_reports_position_changes() {
        let mut a = agg();
        a.handle(&status_line(LEFT, STATUS_HOMEREF as u32), T0);
        // NaN → value is not a "change"; too soon for the heartbeat
        assert_eq!(a.handle(&currpos_line(LEFT, -100000), T0 + 1000), None);
        let sts = a
            .handle(&currpos_line(LEFT, -100000), T0 + 1_100_000)
            .expect("heartbeat");
        let want = default_params()[0].qc_to_angle(-100000);
        assert!((sts.rudder_l_deg - want).abs() < 1e-9);

        // a real movement larger than 0.1° reports right away
        let sts = a
            .handle(&currpos_line(LEFT, -110000), T0 + 1_400_000)
            .expect("change report");
        let want = default_params()[0].qc_to_angle(-110000);
        assert!((sts.rudder_l_deg - want).abs() < 1e-9);
        assert_eq!(sts.timestamp_ms, (T0 + 1_400_000) / 1000);
    }

    #[test]
    fn per_axis_min_cadence_limits_change_reports() {
        let mut a = agg();
        assert!(a.handle(&status_line(LEFT, STATUS_HOMEREF as u32), T0).is_some());
        // heartbeat fills in the first angle
        assert!(a.handle(&currpos_line(LEFT, -10000), T0 + 1_100_000).is_some());
        // first change-driven report
        assert!(a.handle(&currpos_line(LEFT, -20000), T0 + 1_200_000).is_some());
        // 150 ms later: under the per-axis minimum, suppressed
        assert!(a.handle(&currpos_line(LEFT, -30000), T0 + 1_350_000).is_none());
        // 300 ms after the last change report: goes out
        assert!(a.handle(&currpos_line(LEFT, -40000), T0 + 1_500_000).is_some());
    }

    #[test]
    fn losing_homeref_reports_nan() {
        let mut a = agg();
        a.handle(&status_line(RIGHT, STATUS_HOMEREF as u32), T0);
        a.handle(&currpos_line(RIGHT, 50000), T0 + 1_100_000).unwrap();
        assert!(!a.sts.rudder_r_deg.is_nan());

        let sts = a
            .handle(&status_line(RIGHT, 0), T0 + 2_200_000)
            .expect("homing loss is a change");
        assert!(sts.rudder_r_deg.is_nan());
        // positions are distrusted until homed again
        assert_eq!(a.handle(&currpos_line(RIGHT, 50000), T0 + 2_900_000), None);
    }

    #[test]
    fn bmmh_feeds_the_sail_angle() {
        let mut a = agg();
        let sts = a.handle(&bmmh_line(1024), T0 + 1_100_000).expect("heartbeat");
        // 1024 ticks = a quarter turn from the zero at 2048
        let want = normalize_deg(default_params()[3].qc_to_angle(1024));
        assert!((sts.sail_deg - want).abs() < 1e-9);
    }

    #[test]
    fn bmmh_sign_corrected_and_wrapped() {
        let mut a = agg();
        let raw = (1u32 << 30) - 5; // 30-bit −5 → 4091 ticks
        let sts = a.handle(&bmmh_line(raw), T0 + 1_100_000).expect("heartbeat");
        let want = normalize_deg(default_params()[3].qc_to_angle(4091));
        assert!((sts.sail_deg - want).abs() < 1e-9);
    }

    #[test]
    fn heartbeat_without_changes() {
        let mut a = agg();
        assert!(a.handle(&status_line(LEFT, 0), T0).is_some()); // initial report
        assert_eq!(a.handle(&status_line(LEFT, 0), T0 + 100_000), None);
        // nothing changed, but the max cadence forces a report
        assert!(a.handle(&status_line(LEFT, 0), T0 + 1_100_000).is_some());
        assert_eq!(a.handle(&status_line(LEFT, 0), T0 + 1_200_000), None);
    }

    #[test]
    fn foreign_lines_are_ignored() {
        let mut a = agg();
        assert_eq!(a.handle("ruddersts: timestamp_ms:1", T0), None);
        assert_eq!(a.handle(&format!("0x{LEFT:x}:0x6041[0]"), T0), None);
        assert_eq!(a.handle(&format!("0x{LEFT:x}:0x6041[0] # 0x100"), T0), None);
    }
}
