//! # rudderd
//!
//! The actuator side of the control core: a write-through register
//! cache speaking the ebus line protocol, the rudder and sail state
//! machines built on top of it, and the helper daemons that keep the
//! loop fed (periodic prober, skew computer, status aggregator, error
//! monitor).
//!
//! Every daemon here is a thin `tokio` main over a pure, synchronous
//! state machine; all device I/O happens as lines on the bus socket, so
//! the controllers are tested against scripted fake buses without any
//! hardware or sockets.

pub mod busio;
pub mod config;
pub mod eposclient;
pub mod monitor;
pub mod probe;
pub mod rudder;
pub mod sail;
pub mod skew;
pub mod status;

pub use eposclient::{Bus, DeviceId, Received};
pub use rudder::Step;
