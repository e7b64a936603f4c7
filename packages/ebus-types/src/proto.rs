//! proto.rs — key:value line messages exchanged with the planner
//!
//! Three message kinds ride the line bus next to the raw register
//! traffic:
//!
//! ```text
//! rudderctl: timestamp_ms:<ms> rudder_l_deg:<v> rudder_r_deg:<v> sail_deg:<v> storm_flag:<0|1>
//! ruddersts: timestamp_ms:<ms> rudder_l_deg:<v> rudder_r_deg:<v> sail_deg:<v>
//! skew: timestamp_ms:<ms> angle_deg:<v>
//! ```
//!
//! An angle of `nan` means "no command; hold" on the way in and "not
//! known" on the way out. Keys are positional: parsers reject lines with
//! missing, reordered or extra fields.

use std::fmt;

/// Angle setpoints from the helmsman. NaN = hold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RudderCtl {
    pub timestamp_ms: i64,
    pub rudder_l_deg: f64,
    pub rudder_r_deg: f64,
    pub sail_deg: f64,
    pub storm_flag: bool,
}

/// Measured angles reported back to the planner.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RudderSts {
    pub timestamp_ms: i64,
    pub rudder_l_deg: f64,
    pub rudder_r_deg: f64,
    pub sail_deg: f64,
}

impl RudderSts {
    pub fn unknown() -> Self {
        RudderSts {
            timestamp_ms: 0,
            rudder_l_deg: f64::NAN,
            rudder_r_deg: f64::NAN,
            sail_deg: f64::NAN,
        }
    }
}

/// Angular slip between the boom sensor and the sail motor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Skew {
    pub timestamp_ms: i64,
    pub angle_deg: f64,
}

impl Skew {
    pub fn unknown() -> Self {
        Skew { timestamp_ms: 0, angle_deg: f64::NAN }
    }
}

struct Deg(f64);

impl fmt::Display for Deg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_nan() {
            write!(f, "nan")
        } else {
            write!(f, "{:.3}", self.0)
        }
    }
}

impl fmt::Display for RudderCtl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rudderctl: timestamp_ms:{} rudder_l_deg:{} rudder_r_deg:{} sail_deg:{} storm_flag:{}",
            self.timestamp_ms,
            Deg(self.rudder_l_deg),
            Deg(self.rudder_r_deg),
            Deg(self.sail_deg),
            self.storm_flag as u8,
        )
    }
}

impl fmt::Display for RudderSts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ruddersts: timestamp_ms:{} rudder_l_deg:{} rudder_r_deg:{} sail_deg:{}",
            self.timestamp_ms,
            Deg(self.rudder_l_deg),
            Deg(self.rudder_r_deg),
            Deg(self.sail_deg),
        )
    }
}

impl fmt::Display for Skew {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "skew: timestamp_ms:{} angle_deg:{}",
            self.timestamp_ms,
            Deg(self.angle_deg)
        )
    }
}

/// Split `key:value`, verifying the key.
fn field<'a>(token: Option<&'a str>, key: &str) -> Option<&'a str> {
    let token = token?;
    let rest = token.strip_prefix(key)?;
    rest.strip_prefix(':')
}

fn parse_deg(s: &str) -> Option<f64> {
    if s.eq_ignore_ascii_case("nan") {
        Some(f64::NAN)
    } else {
        s.parse().ok()
    }
}

impl RudderCtl {
    pub fn parse(line: &str) -> Option<RudderCtl> {
        let mut t = line.trim_end().split_ascii_whitespace();
        if t.next()? != "rudderctl:" {
            return None;
        }
        let msg = RudderCtl {
            timestamp_ms: field(t.next(), "timestamp_ms")?.parse().ok()?,
            rudder_l_deg: parse_deg(field(t.next(), "rudder_l_deg")?)?,
            rudder_r_deg: parse_deg(field(t.next(), "rudder_r_deg")?)?,
            sail_deg: parse_deg(field(t.next(), "sail_deg")?)?,
            storm_flag: match field(t.next(), "storm_flag")? {
                "0" => false,
                "1" => true,
                _ => return None,
            },
        };
        t.next().is_none().then_some(msg)
    }
}

impl RudderSts {
    pub fn parse(line: &str) -> Option<RudderSts> {
        let mut t = line.trim_end().split_ascii_whitespace();
        if t.next()? != "ruddersts:" {
            return None;
        }
        let msg = RudderSts {
            timestamp_ms: field(t.next(), "timestamp_ms")?.parse().ok()?,
            rudder_l_deg: parse_deg(field(t.next(), "rudder_l_deg")?)?,
            rudder_r_deg: parse_deg(field(t.next(), "rudder_r_deg")?)?,
            sail_deg: parse_deg(field(t.next(), "sail_deg")?)?,
        };
        t.next().is_none().then_some(msg)
    }
}

impl Skew {
    pub fn parse(line: &str) -> Option<Skew> {
        let mut t = line.trim_end().split_ascii_whitespace();
        if t.next()? != "skew:" {
            return None;
        }
        let msg = Skew {
            timestamp_ms: field(t.next(), "timestamp_ms")?.parse().ok()?,
            angle_deg: parse_deg(field(t.next(), "angle_deg")?)?,
        };
        t.next().is_none().then_some(msg)
    }
}
