//! axis.rs — actuator axis parameters and unit conversion
//!
//! Home is the extreme outer position for both rudders; the controller
//! reports 0 qc there, and commands are bracketed between the home and
//! extreme positions. For the sail winch and the BMMH angle sensor the
//! (home, extreme) pair just fixes the linear angle transformation and
//! must span exactly ±360°, so positions wrap around the full circle.

use serde::Deserialize;

/// The four devices on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    Left,
    Right,
    Sail,
    Bmmh,
}

impl Axis {
    pub const ALL: [Axis; 4] = [Axis::Left, Axis::Right, Axis::Sail, Axis::Bmmh];

    pub fn label(self) -> &'static str {
        match self {
            Axis::Left => "LEFT",
            Axis::Right => "RIGHT",
            Axis::Sail => "SAIL",
            Axis::Bmmh => "BMMH",
        }
    }
}

/// Static per-axis parameters: bus identity and the affine (angle, qc)
/// mapping endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct MotorParams {
    pub label: String,
    pub serial: u32,
    pub home_angle_deg: f64,
    pub extr_angle_deg: f64,
    pub home_pos_qc: i32,
    pub extr_pos_qc: i32,
}

impl MotorParams {
    /// True for axes whose angle range spans the full circle and whose
    /// positions therefore wrap instead of clamping.
    pub fn full_circle(&self) -> bool {
        (self.extr_angle_deg - self.home_angle_deg).abs() == 360.0
    }

    /// Convert an angle to a position, clamped to the [home, extreme]
    /// travel. For full-circle axes the clamp never engages on inputs
    /// normalized into (−180, +180].
    pub fn angle_to_qc(&self, angle_deg: f64) -> i32 {
        let mut alpha =
            (angle_deg - self.home_angle_deg) / (self.extr_angle_deg - self.home_angle_deg);
        alpha = alpha.clamp(0.0, 1.0);
        ((1.0 - alpha) * self.home_pos_qc as f64 + alpha * self.extr_pos_qc as f64) as i32
    }

    pub fn qc_to_angle(&self, pos_qc: i32) -> f64 {
        let alpha =
            (pos_qc - self.home_pos_qc) as f64 / (self.extr_pos_qc - self.home_pos_qc) as f64;
        (1.0 - alpha) * self.home_angle_deg + alpha * self.extr_angle_deg
    }

    /// Reduce a wrapped position into the [home, extreme] qc interval.
    /// Only meaningful for full-circle axes.
    pub fn normalize_qc(&self, mut qc: i32) -> i32 {
        debug_assert!(self.full_circle());
        let range = (self.extr_pos_qc - self.home_pos_qc).abs();
        let (min, max) = if self.home_pos_qc < self.extr_pos_qc {
            (self.home_pos_qc, self.extr_pos_qc)
        } else {
            (self.extr_pos_qc, self.home_pos_qc)
        };
        while qc < min {
            qc += range;
        }
        while qc > max {
            qc -= range;
        }
        qc
    }
}

/// Normalize an angle into (−180, +180].
pub fn normalize_deg(mut deg: f64) -> f64 {
    while deg <= -180.0 {
        deg += 360.0;
    }
    while deg > 180.0 {
        deg -= 360.0;
    }
    deg
}

/// The production actuator table. The rudder travel is limited to the
/// inner angles; the sail and BMMH rows span exactly one turn.
pub fn default_params() -> [MotorParams; 4] {
    [
        MotorParams {
            label: "LEFT".into(),
            serial: 0x09011145,
            home_angle_deg: 100.0,
            extr_angle_deg: -50.0,
            home_pos_qc: 0,
            extr_pos_qc: -288000 * 150 / 180,
        },
        MotorParams {
            label: "RIGHT".into(),
            serial: 0x09010537,
            home_angle_deg: -90.0,
            extr_angle_deg: 50.0,
            home_pos_qc: 0,
            extr_pos_qc: 288000 * 140 / 180,
        },
        MotorParams {
            label: "SAIL".into(),
            serial: 0x09010506,
            home_angle_deg: -180.0,
            extr_angle_deg: 180.0,
            home_pos_qc: 615000,
            extr_pos_qc: -615000,
        },
        // 4096 ticks for a complete rotation
        MotorParams {
            label: "BMMH".into(),
            serial: 0x00001227,
            home_angle_deg: -180.0,
            extr_angle_deg: 180.0,
            home_pos_qc: 2048,
            extr_pos_qc: -2048,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(axis: Axis) -> MotorParams {
        default_params()[axis as usize].clone()
    }

    #[test]
    fn rudder_affinity_within_travel() {
        for axis in [Axis::Left, Axis::Right] {
            let p = params(axis);
            let (lo, hi) = if p.home_angle_deg < p.extr_angle_deg {
                (p.home_angle_deg, p.extr_angle_deg)
            } else {
                (p.extr_angle_deg, p.home_angle_deg)
            };
            let mut a = lo;
            while a <= hi {
                let back = p.qc_to_angle(p.angle_to_qc(a));
                assert!((back - a).abs() < 0.01, "{axis:?} {a} -> {back}");
                a += 7.3;
            }
        }
    }

    #[test]
    fn rudder_clamps_at_limits() {
        // LEFT runs from home at +100° down to the extreme at −50°
        let p = params(Axis::Left);
        assert_eq!(p.angle_to_qc(-1000.0), p.extr_pos_qc);
        assert_eq!(p.angle_to_qc(1000.0), p.home_pos_qc);
        assert_eq!(p.angle_to_qc(200.0), p.home_pos_qc);
    }

    #[test]
    fn sail_affinity_is_exact_over_the_circle() {
        let p = params(Axis::Sail);
        assert!(p.full_circle());
        for a in [-179.0, -90.0, 0.0, 45.5, 180.0] {
            let back = p.qc_to_angle(p.angle_to_qc(a));
            assert!((back - a).abs() < 1e-3, "{a} -> {back}");
        }
        // zero angle maps to the qc midpoint, so deltas convert to
        // signed offsets
        assert_eq!(p.angle_to_qc(0.0), 0);
    }

    #[test]
    fn bmmh_normalize_qc_wraps() {
        let p = params(Axis::Bmmh);
        assert_eq!(p.normalize_qc(2049), 2049 - 4096);
        assert_eq!(p.normalize_qc(-2049), -2049 + 4096);
        assert_eq!(p.normalize_qc(100), 100);
    }

    #[test]
    fn normalize_deg_into_half_open_interval() {
        assert_eq!(normalize_deg(180.0), 180.0);
        assert_eq!(normalize_deg(-180.0), 180.0);
        assert_eq!(normalize_deg(540.0), 180.0);
        assert_eq!(normalize_deg(-190.0), 170.0);
        assert_eq!(normalize_deg(0.0), 0.0);
    }
}
