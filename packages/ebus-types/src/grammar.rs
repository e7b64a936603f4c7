//! grammar.rs — the ebus line protocol
//!
//! One message per line. Four grammars, each with an optional
//! ` T:<microseconds>` suffix:
//!
//! ```text
//! 0x<serial>:0x<index>[<subindex>]                    request: GET
//! 0x<serial>:0x<index>[<subindex>] := 0x<value>       request: SET
//! 0x<serial>:0x<index>[<subindex>] = 0x<value>        response: ACK
//! 0x<serial>:0x<index>[<subindex>] # 0x<errcode>      response: ERR
//! ```
//!
//! The parser matches each grammar by position and rejects anything
//! ambiguous: a `:=` without a value, a request with a response operator
//! glued on, trailing junk. Mis-routing a reply as a request would wedge
//! the serial multiplexer, so strictness here is load-bearing.

use std::fmt;

use crate::register::Register;

/// Operation carried by a line. `Get` has no payload; the others carry
/// the 32-bit register value (or device error code for `Err`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    Get,
    Set(u32),
    Ack(u32),
    Err(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EbusMsg {
    pub serial: u32,
    pub reg: Register,
    pub kind: MsgKind,
    pub timestamp_us: Option<i64>,
}

impl EbusMsg {
    pub fn get(serial: u32, reg: Register) -> Self {
        EbusMsg { serial, reg, kind: MsgKind::Get, timestamp_us: None }
    }

    pub fn set(serial: u32, reg: Register, value: u32) -> Self {
        EbusMsg { serial, reg, kind: MsgKind::Set(value), timestamp_us: None }
    }

    pub fn ack(serial: u32, reg: Register, value: u32) -> Self {
        EbusMsg { serial, reg, kind: MsgKind::Ack(value), timestamp_us: None }
    }

    pub fn err(serial: u32, reg: Register, code: u32) -> Self {
        EbusMsg { serial, reg, kind: MsgKind::Err(code), timestamp_us: None }
    }

    pub fn with_timestamp(mut self, us: i64) -> Self {
        self.timestamp_us = Some(us);
        self
    }

    pub fn is_request(&self) -> bool {
        matches!(self.kind, MsgKind::Get | MsgKind::Set(_))
    }

    pub fn is_response(&self) -> bool {
        !self.is_request()
    }

    /// The single-character operator of this message: `?`, `:`, `=`, `#`.
    pub fn op(&self) -> char {
        match self.kind {
            MsgKind::Get => '?',
            MsgKind::Set(_) => ':',
            MsgKind::Ack(_) => '=',
            MsgKind::Err(_) => '#',
        }
    }

    /// Parse any of the four grammars. Returns `None` for anything that
    /// does not match exactly.
    pub fn parse(line: &str) -> Option<EbusMsg> {
        let line = line.trim_end_matches(['\n', '\r']).trim_end();
        let (serial, rest) = hex_prefixed(line)?;
        let rest = rest.strip_prefix(':')?;
        let (index, rest) = hex_prefixed(rest)?;
        if index > u16::MAX as u32 {
            return None;
        }
        let rest = rest.strip_prefix('[')?;
        let close = rest.find(']')?;
        let subindex: u8 = rest[..close].parse().ok()?;
        let reg = Register::new(index as u16, subindex);
        let mut rest = rest[close + 1..].trim_start();

        let kind = if rest.is_empty() || rest.starts_with('?') {
            if let Some(r) = rest.strip_prefix('?') {
                rest = r.trim_start();
            }
            MsgKind::Get
        } else if let Some(r) = rest.strip_prefix(":=") {
            let (value, r) = hex_prefixed(r.trim_start())?;
            rest = r.trim_start();
            MsgKind::Set(value)
        } else if let Some(r) = rest.strip_prefix('=') {
            let (value, r) = hex_prefixed(r.trim_start())?;
            rest = r.trim_start();
            MsgKind::Ack(value)
        } else if let Some(r) = rest.strip_prefix('#') {
            let (code, r) = hex_prefixed(r.trim_start())?;
            rest = r.trim_start();
            MsgKind::Err(code)
        } else {
            return None;
        };

        let timestamp_us = if let Some(t) = rest.strip_prefix("T:") {
            let (us, r) = decimal(t)?;
            rest = r.trim_start();
            Some(us)
        } else {
            None
        };

        if !rest.is_empty() {
            return None;
        }
        Some(EbusMsg { serial, reg, kind, timestamp_us })
    }

    /// Parse, keeping only GET/SET lines.
    pub fn parse_request(line: &str) -> Option<EbusMsg> {
        EbusMsg::parse(line).filter(EbusMsg::is_request)
    }

    /// Parse, keeping only ACK/ERR lines.
    pub fn parse_response(line: &str) -> Option<EbusMsg> {
        EbusMsg::parse(line).filter(EbusMsg::is_response)
    }
}

impl fmt::Display for EbusMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}:{}", self.serial, self.reg)?;
        match self.kind {
            MsgKind::Get => {
                // the short form carries no operator; `?` appears only
                // together with the timestamp
                if let Some(us) = self.timestamp_us {
                    write!(f, " ? T:{us}")?;
                }
                return Ok(());
            }
            MsgKind::Set(v) => write!(f, " := 0x{v:x}")?,
            MsgKind::Ack(v) => write!(f, " = 0x{v:x}")?,
            MsgKind::Err(e) => write!(f, " # 0x{e:x}")?,
        }
        if let Some(us) = self.timestamp_us {
            write!(f, " T:{us}")?;
        }
        Ok(())
    }
}

/// Parse a mandatory `0x`-prefixed hex number, returning it and the rest
/// of the string.
fn hex_prefixed(s: &str) -> Option<(u32, &str)> {
    let s = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))?;
    let end = s
        .find(|c: char| !c.is_ascii_hexdigit())
        .unwrap_or(s.len());
    if end == 0 {
        return None;
    }
    let value = u32::from_str_radix(&s[..end], 16).ok()?;
    Some((value, &s[end..]))
}

fn decimal(s: &str) -> Option<(i64, &str)> {
    let end = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    if end == 0 {
        return None;
    }
    let value: i64 = s[..end].parse().ok()?;
    Some((value, &s[end..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    const REG: Register = Register::new(0x1001, 2);

    #[test]
    fn get_roundtrip() {
        let m = EbusMsg::get(0x1234, REG);
        assert_eq!(m.to_string(), "0x1234:0x1001[2]");
        let p = EbusMsg::parse("0x1234:0x1001[2]").unwrap();
        assert_eq!(p, m);
        assert_eq!(p.op(), '?');
        assert!(p.is_request());
    }

    #[test]
    fn get_with_timestamp_roundtrip() {
        let m = EbusMsg::get(0x1234, REG).with_timestamp(12345678);
        assert_eq!(m.to_string(), "0x1234:0x1001[2] ? T:12345678");
        assert_eq!(EbusMsg::parse(&m.to_string()), Some(m));
    }

    #[test]
    fn set_roundtrip() {
        let m = EbusMsg::set(0x1234, REG, 0x4321);
        assert_eq!(m.to_string(), "0x1234:0x1001[2] := 0x4321");
        let p = EbusMsg::parse(&m.to_string()).unwrap();
        assert_eq!(p, m);
        assert_eq!(p.op(), ':');
    }

    #[test]
    fn ack_err_roundtrip() {
        let a = EbusMsg::ack(0x9011145, Register::new(0x6041, 0), 0x237);
        assert_eq!(a.to_string(), "0x9011145:0x6041[0] = 0x237");
        assert_eq!(EbusMsg::parse(&a.to_string()), Some(a));
        assert_eq!(a.op(), '=');

        let e = EbusMsg::err(0x9011145, Register::new(0x6040, 0), 0x8100020)
            .with_timestamp(55);
        assert_eq!(e.to_string(), "0x9011145:0x6040[0] # 0x8100020 T:55");
        let p = EbusMsg::parse(&e.to_string()).unwrap();
        assert_eq!(p, e);
        assert!(p.is_response());
    }

    #[test]
    fn negative_values_roundtrip_as_twos_complement() {
        let qc: i32 = -240000;
        let m = EbusMsg::set(0x1234, REG, qc as u32);
        let p = EbusMsg::parse(&m.to_string()).unwrap();
        match p.kind {
            MsgKind::Set(v) => assert_eq!(v as i32, qc),
            _ => panic!("wrong kind"),
        }
    }

    #[test]
    fn rejects_set_without_value() {
        assert_eq!(EbusMsg::parse("0x1234:0x1001[2] :="), None);
        assert_eq!(EbusMsg::parse("0x1234:0x1001[2] := "), None);
    }

    #[test]
    fn rejects_mixed_operators() {
        // a line carrying both a set and an ack operator is mis-routed
        // traffic, not a request
        assert_eq!(EbusMsg::parse("0x1234:0x1001[2] := 0x5 = 0x5"), None);
        assert_eq!(EbusMsg::parse("0x1234:0x1001[2] = 0x5 # 0x5"), None);
    }

    #[test]
    fn rejects_trailing_junk_and_bare_numbers() {
        assert_eq!(EbusMsg::parse("0x1234:0x1001[2] = 0x5 garbage"), None);
        assert_eq!(EbusMsg::parse("1234:0x1001[2]"), None);
        assert_eq!(EbusMsg::parse("0x1234:1001[2]"), None);
        assert_eq!(EbusMsg::parse("0x1234:0x1001[2] = 5"), None);
        assert_eq!(EbusMsg::parse(""), None);
        assert_eq!(EbusMsg::parse("ruddersts: timestamp_ms:1"), None);
    }

    #[test]
    fn request_response_filters() {
        assert!(EbusMsg::parse_request("0x1:0x6041[0]").is_some());
        assert!(EbusMsg::parse_request("0x1:0x6041[0] = 0x1").is_none());
        assert!(EbusMsg::parse_response("0x1:0x6041[0] = 0x1").is_some());
        assert!(EbusMsg::parse_response("0x1:0x6041[0]").is_none());
    }

    #[test]
    fn index_must_fit_sixteen_bits() {
        assert_eq!(EbusMsg::parse("0x1234:0x10010[2]"), None);
    }
}
