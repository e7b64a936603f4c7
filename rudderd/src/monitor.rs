//! monitor.rs — bus traffic and device error bookkeeping
//!
//! Listens to everything on the bus, keeps per-axis counters of
//! requests, acks and errors, decodes status words and device error
//! codes into readable text, and produces a summary at a bounded
//! cadence. Pure bookkeeping: the monitor never writes to the bus.

use std::fmt::Write as _;

use tracing::warn;

use ebus_types::axis::MotorParams;
use ebus_types::error::strerror;
use ebus_types::register::{REG_STATUS, STATUS_FAULT};
use ebus_types::{EbusMsg, MsgKind};

/// Status word bits, LSB first.
const STATUS_BITS: [&str; 16] = [
    "READY", "ON", "ENABLE", "FAULT", "VOLTAGE", "QUICKSTOP", "DISABLE", "WARNING", "MEASURED",
    "REMOTE", "REACHED", "LIMITED", "ATTAINED", "ERROR", "REFRESH", "HOMEREF",
];

/// Names of the set bits of a status word.
pub fn status_bits(value: u32) -> String {
    let mut out = String::new();
    for (i, name) in STATUS_BITS.iter().enumerate() {
        if value & (1 << i) != 0 {
            if !out.is_empty() {
                out.push_str(", ");
            }
            out.push_str(name);
        }
    }
    out
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AxisCounters {
    pub get: u64,
    pub set: u64,
    pub ack: u64,
    pub err: u64,
    pub fault: u64,
}

pub struct Monitor {
    params: [MotorParams; 4],
    counters: [AxisCounters; 4],
    last_report_us: i64,
    min_us: i64,
    max_us: i64,
    /// Anything worth telling since the last summary.
    noteworthy: bool,
}

impl Monitor {
    pub fn new(params: [MotorParams; 4], min_s: i64, max_s: i64) -> Self {
        Monitor {
            params,
            counters: [AxisCounters::default(); 4],
            last_report_us: 0,
            min_us: min_s * 1_000_000,
            max_us: max_s * 1_000_000,
            noteworthy: false,
        }
    }

    pub fn counters(&self, axis: usize) -> AxisCounters {
        self.counters[axis]
    }

    /// Count one line; returns a summary when the cadence says so.
    pub fn handle(&mut self, line: &str, now_us: i64) -> Option<String> {
        if self.last_report_us == 0 {
            self.last_report_us = now_us;
        }
        if let Some(msg) = EbusMsg::parse(line) {
            if let Some(axis) = self.params.iter().position(|p| p.serial == msg.serial) {
                let c = &mut self.counters[axis];
                match msg.kind {
                    MsgKind::Get => c.get += 1,
                    MsgKind::Set(_) => c.set += 1,
                    MsgKind::Ack(value) => {
                        c.ack += 1;
                        if msg.reg == REG_STATUS && value & STATUS_FAULT != 0 {
                            c.fault += 1;
                            self.noteworthy = true;
                            warn!(
                                "{}: fault status 0x{:x} ({})",
                                self.params[axis].label,
                                value,
                                status_bits(value)
                            );
                        }
                    }
                    MsgKind::Err(code) => {
                        c.err += 1;
                        self.noteworthy = true;
                        warn!(
                            "{}: {} error 0x{:x}: {}",
                            self.params[axis].label,
                            msg.reg,
                            code,
                            strerror(code)
                        );
                    }
                }
            }
        }

        let due = (self.noteworthy && now_us >= self.last_report_us + self.min_us)
            || now_us >= self.last_report_us + self.max_us;
        if !due {
            return None;
        }
        self.noteworthy = false;
        self.last_report_us = now_us;
        Some(self.summary())
    }

    fn summary(&self) -> String {
        let mut out = String::new();
        for (p, c) in self.params.iter().zip(self.counters.iter()) {
            let _ = write!(
                out,
                "{}: get:{} set:{} ack:{} err:{} fault:{}  ",
                p.label, c.get, c.set, c.ack, c.err, c.fault
            );
        }
        out.trim_end().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ebus_types::axis::default_params;

    const T0: i64 = 77_000_000_000;
    const LEFT: u32 = 0x09011145;

    fn monitor() -> Monitor {
        Monitor::new(default_params(), 10, 300)
    }

    #[test]
    fn decodes_status_bits() {
        assert_eq!(status_bits(0), "");
        assert_eq!(status_bits(1 << 3), "FAULT");
        assert_eq!(status_bits((1 << 10) | (1 << 15)), "REACHED, HOMEREF");
    }

    #[test]
    fn counts_traffic_per_axis() {
        let mut m = monitor();
        m.handle(&format!("0x{LEFT:x}:0x6041[0]"), T0);
        m.handle(&format!("0x{LEFT:x}:0x6040[0] := 0x6"), T0);
        m.handle(&format!("0x{LEFT:x}:0x6041[0] = 0x237"), T0);
        m.handle(&format!("0x{LEFT:x}:0x6040[0] # 0x8100020"), T0);
        m.handle("0xdead:0x6041[0] = 0x0", T0); // unknown serial
        let c = m.counters(0);
        assert_eq!((c.get, c.set, c.ack, c.err), (1, 1, 1, 1));
    }

    #[test]
    fn fault_acks_are_counted() {
        let mut m = monitor();
        m.handle(&format!("0x{LEFT:x}:0x6041[0] = 0x8"), T0);
        assert_eq!(m.counters(0).fault, 1);
    }

    #[test]
    fn summary_cadence() {
        let mut m = monitor();
        // noteworthy traffic, but the first summary respects min
        assert!(m
            .handle(&format!("0x{LEFT:x}:0x6040[0] # 0x8100020"), T0)
            .is_none());
        // min elapsed: summary appears and names the axis
        let s = m
            .handle(&format!("0x{LEFT:x}:0x6041[0] = 0x0"), T0 + 11_000_000)
            .expect("summary");
        assert!(s.contains("LEFT"));
        assert!(s.contains("err:1"));
        // quiet: nothing until the max cadence
        assert!(m
            .handle(&format!("0x{LEFT:x}:0x6041[0] = 0x0"), T0 + 22_000_000)
            .is_none());
        assert!(m
            .handle(&format!("0x{LEFT:x}:0x6041[0] = 0x0"), T0 + 322_000_000)
            .is_some());
    }
}
