//! config.rs — optional TOML configuration for the actuator daemons
//!
//! Everything has a built-in default; a config file only overrides what
//! it names:
//!
//! ```toml
//! bus = "/var/run/lbus"
//! pending_expiry_ms = 1000
//! valid_expiry_ms = 5000      # also the brake-refresh cadence
//!
//! [[motors]]                  # exactly four rows: LEFT RIGHT SAIL BMMH
//! label = "LEFT"
//! serial = 0x09011145
//! home_angle_deg = 100.0
//! extr_angle_deg = -50.0
//! home_pos_qc = 0
//! extr_pos_qc = -240000
//! # …
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::{ensure, Context};
use serde::Deserialize;

use ebus_types::axis::{default_params, Axis, MotorParams};

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ActuatorConfig {
    /// Path of the line bus socket.
    pub bus: String,
    /// Pending requests older than this are abandoned.
    pub pending_expiry_ms: u64,
    /// Valid cache entries older than this are re-fetched; this is what
    /// paces the sail brake reinforcement writes.
    pub valid_expiry_ms: u64,
    /// Per-axis parameters, LEFT RIGHT SAIL BMMH.
    pub motors: Vec<MotorParams>,
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        ActuatorConfig {
            bus: "/var/run/lbus".into(),
            pending_expiry_ms: 1000,
            valid_expiry_ms: 5000,
            motors: default_params().to_vec(),
        }
    }
}

impl ActuatorConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<ActuatorConfig> {
        let cfg = match path {
            None => ActuatorConfig::default(),
            Some(p) => {
                let text = std::fs::read_to_string(p)
                    .with_context(|| format!("reading {}", p.display()))?;
                toml::from_str(&text).with_context(|| format!("parsing {}", p.display()))?
            }
        };
        ensure!(cfg.motors.len() == 4, "motors table must have exactly 4 rows");
        for axis in [Axis::Sail, Axis::Bmmh] {
            ensure!(
                cfg.params(axis).full_circle(),
                "{} must span exactly 360 degrees",
                cfg.params(axis).label
            );
        }
        Ok(cfg)
    }

    pub fn params(&self, axis: Axis) -> &MotorParams {
        &self.motors[axis as usize]
    }

    pub fn pending_expiry(&self) -> Duration {
        Duration::from_millis(self.pending_expiry_ms)
    }

    pub fn valid_expiry(&self) -> Duration {
        Duration::from_millis(self.valid_expiry_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = ActuatorConfig::load(None).unwrap();
        assert_eq!(cfg.params(Axis::Left).serial, 0x09011145);
        assert_eq!(cfg.valid_expiry(), Duration::from_secs(5));
    }

    #[test]
    fn partial_override_parses() {
        let cfg: ActuatorConfig = toml::from_str("valid_expiry_ms = 2500").unwrap();
        assert_eq!(cfg.valid_expiry_ms, 2500);
        assert_eq!(cfg.bus, "/var/run/lbus");
        assert_eq!(cfg.motors.len(), 4);
    }
}
