//! probe.rs — the periodic register probe set
//!
//! One probe round asks every motor for its status and position, plus
//! the BMMH for its absolute angle. The responses feed the controllers'
//! caches, the status aggregator and the skew computer alike.

use ebus_types::axis::{Axis, MotorParams};
use ebus_types::register::{REG_BMMHPOS, REG_CURRPOS, REG_STATUS};
use ebus_types::EbusMsg;

/// The GET lines of one probe round, in bus order.
pub fn probe_round(params: &[MotorParams; 4], timestamp_us: Option<i64>) -> Vec<EbusMsg> {
    let mut out = Vec::with_capacity(7);
    for axis in [Axis::Left, Axis::Right, Axis::Sail] {
        let p = &params[axis as usize];
        out.push(EbusMsg::get(p.serial, REG_STATUS));
        out.push(EbusMsg::get(p.serial, REG_CURRPOS));
    }
    out.push(EbusMsg::get(params[Axis::Bmmh as usize].serial, REG_BMMHPOS));
    if let Some(us) = timestamp_us {
        out = out.into_iter().map(|m| m.with_timestamp(us)).collect();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ebus_types::axis::default_params;

    #[test]
    fn one_round_covers_all_axes() {
        let p = default_params();
        let round = probe_round(&p, None);
        assert_eq!(round.len(), 7);
        assert_eq!(round[0], EbusMsg::get(p[0].serial, REG_STATUS));
        assert_eq!(round[1], EbusMsg::get(p[0].serial, REG_CURRPOS));
        assert_eq!(round[2], EbusMsg::get(p[1].serial, REG_STATUS));
        assert_eq!(round[3], EbusMsg::get(p[1].serial, REG_CURRPOS));
        assert_eq!(round[4], EbusMsg::get(p[2].serial, REG_STATUS));
        assert_eq!(round[5], EbusMsg::get(p[2].serial, REG_CURRPOS));
        assert_eq!(round[6], EbusMsg::get(p[3].serial, REG_BMMHPOS));
    }

    #[test]
    fn timestamped_round() {
        let p = default_params();
        let round = probe_round(&p, Some(123));
        assert!(round.iter().all(|m| m.timestamp_us == Some(123)));
        assert!(round[0].to_string().ends_with("? T:123"));
    }
}
