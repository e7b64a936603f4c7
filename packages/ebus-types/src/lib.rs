//! # ebus-types
//!
//! Shared protocol types for the actuator control core.
//!
//! These types are used by:
//! - `eposcom`: the RS-232 command multiplexer (line grammar, registers)
//! - `linebusd`: the text-line fan-out daemon (timing statistics)
//! - `rudderd`: the axis controllers and helper daemons (everything here)
//!
//! ## Conventions
//!
//! - Registers are the motor controller's object-dictionary addresses,
//!   `(index, subindex)` packed into one word.
//! - All bus traffic is single-line ASCII; formats in [`grammar`] and
//!   [`proto`] must round-trip exactly, and parsers reject any deviation
//!   so a reply can never be mistaken for a request.
//! - Angles are degrees, normalized into (−180, +180] for the
//!   full-circle axes; motor positions are quadrature counts (qc).

pub mod axis;
pub mod error;
pub mod grammar;
pub mod proto;
pub mod register;
pub mod timer;

pub use axis::{Axis, MotorParams};
pub use grammar::{EbusMsg, MsgKind};
pub use register::Register;
pub use timer::{Timer, TimerStats};

/// Wall-clock microseconds since the epoch, as carried in `T:` suffixes.
pub fn now_us() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// Wall-clock milliseconds since the epoch, as carried in `timestamp_ms:`.
pub fn now_ms() -> i64 {
    now_us() / 1000
}
