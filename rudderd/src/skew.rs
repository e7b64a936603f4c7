//! skew.rs — boom/motor slip estimation
//!
//! The bus cadence delivers, between two sail CURRPOS responses, one
//! BMMH position response. When a BMMH sample falls strictly between
//! two motor samples that are close enough together, the motor position
//! at the BMMH moment is linearly interpolated and the difference of
//! the two angles (minus the mounting bias) is the skew.
//!
//! If nothing could be reported for a while, the computer emits a burst
//! of three GETs (sail, BMMH, sail) to force a fresh interleaved
//! triple, and backdates its own bookkeeping so the burst does not
//! re-fire immediately.

use ebus_types::axis::{normalize_deg, MotorParams};
use ebus_types::proto::Skew;
use ebus_types::register::{REG_BMMHPOS, REG_CURRPOS};
use ebus_types::{EbusMsg, MsgKind};

/// With the boom at zero the BMMH reports this angle.
pub const BMMH_BIAS_DEG: f64 = 3.25;
/// Force a new measurement if the last report is this old.
pub const REPORT_TIMEOUT_US: i64 = 8 * 1_000_000;
/// Maximum spacing between the two motor samples bracketing a BMMH one.
pub const MOTOR_MAX_INTERVAL_US: i64 = 250 * 1000;

/// What one input line produced.
#[derive(Debug, Default, PartialEq)]
pub struct SkewOutput {
    pub skew: Option<Skew>,
    /// Starvation burst: GET lines to put on the bus.
    pub probes: Vec<EbusMsg>,
}

pub struct SkewComputer {
    sail: MotorParams,
    bmmh: MotorParams,
    /// Last two motor samples, even/odd slots.
    motor_qc: [i32; 2],
    motor_us: [i64; 2],
    samples: u64,
    bmmh_qc: i32,
    bmmh_us: i64,
    last_report_ms: i64,
    timestamps: bool,
}

impl SkewComputer {
    pub fn new(sail: MotorParams, bmmh: MotorParams, timestamps: bool) -> Self {
        SkewComputer {
            sail,
            bmmh,
            motor_qc: [0; 2],
            motor_us: [0; 2],
            samples: 0,
            bmmh_qc: 0,
            bmmh_us: 0,
            last_report_ms: 0,
            timestamps,
        }
    }

    /// Reduce the raw 30-bit signed BMMH position to one turn.
    fn bmmh_ticks(raw: u32) -> i32 {
        let mut v = raw as i64;
        if v >= 1 << 29 {
            v -= 1 << 30;
        }
        (v & 4095) as i32
    }

    /// Feed one bus line; `now_us` is the wall clock (also used when
    /// the line carries no timestamp of its own).
    pub fn handle(&mut self, line: &str, now_us: i64) -> SkewOutput {
        let mut out = SkewOutput::default();
        let mut us = now_us;

        if let Some(msg) = EbusMsg::parse_response(line) {
            if let MsgKind::Ack(value) = msg.kind {
                us = msg.timestamp_us.filter(|&t| t != 0).unwrap_or(now_us);
                if msg.serial == self.sail.serial && msg.reg == REG_CURRPOS {
                    let slot = (self.samples & 1) as usize;
                    self.motor_qc[slot] = value as i32;
                    self.motor_us[slot] = us;
                    self.samples += 1;
                } else if msg.serial == self.bmmh.serial && msg.reg == REG_BMMHPOS {
                    self.bmmh_qc = Self::bmmh_ticks(value);
                    self.bmmh_us = us;
                }
            }
        }

        // pace reports at a quarter of the starvation period
        if us - 1000 * self.last_report_ms < REPORT_TIMEOUT_US / 4 {
            return out;
        }

        // only a bmmh sample newer than the last report can produce a
        // new estimate; re-running a stale triple would just repeat it
        if self.bmmh_us / 1000 > self.last_report_ms {
            if let Some(motor_qc) = self.interpolate() {
                let angle_deg = normalize_deg(
                    self.bmmh.qc_to_angle(self.bmmh_qc)
                        - self.sail.qc_to_angle(motor_qc)
                        - BMMH_BIAS_DEG,
                );
                self.last_report_ms = self.bmmh_us / 1000;
                out.skew = Some(Skew { timestamp_ms: self.last_report_ms, angle_deg });
            }
        }

        if us - 1000 * self.last_report_ms > REPORT_TIMEOUT_US {
            // pretend we reported half a period ago so the burst itself
            // is rate-limited
            self.last_report_ms = (us - REPORT_TIMEOUT_US / 2) / 1000;
            let probe = |serial, reg| {
                let mut m = EbusMsg::get(serial, reg);
                if self.timestamps {
                    m = m.with_timestamp(now_us);
                }
                m
            };
            out.probes = vec![
                probe(self.sail.serial, REG_CURRPOS),
                probe(self.bmmh.serial, REG_BMMHPOS),
                probe(self.sail.serial, REG_CURRPOS),
            ];
        }

        out
    }

    /// Motor position at the BMMH sample moment, if the sample is
    /// strictly bracketed by two close-enough motor samples.
    fn interpolate(&self) -> Option<i32> {
        let (a, b) = (0usize, 1usize);
        let (lo, hi) = if self.motor_us[a] < self.motor_us[b] { (a, b) } else { (b, a) };
        if self.motor_us[lo] < self.bmmh_us
            && self.bmmh_us < self.motor_us[hi]
            && self.motor_us[hi] - self.motor_us[lo] < MOTOR_MAX_INTERVAL_US
        {
            let alpha = (self.bmmh_us - self.motor_us[lo]) as f64
                / (self.motor_us[hi] - self.motor_us[lo]) as f64;
            Some(
                ((1.0 - alpha) * self.motor_qc[lo] as f64 + alpha * self.motor_qc[hi] as f64)
                    as i32,
            )
        } else {
            None
        }
    }
}
