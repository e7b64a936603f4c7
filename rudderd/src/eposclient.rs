//! eposclient.rs — write-through register cache over the line bus
//!
//! A [`Bus`] caches register values per device, grouped per serial
//! number. Reads and writes that cannot be satisfied from the cache
//! become GET/SET request lines on the outbound sink; responses feed
//! back in through [`Bus::receive`]. Every entry is `Invalid`, `Pending`
//! (request on the wire) or `Valid`.
//!
//! The point of the synchronous API: `get_register`/`set_register`
//! return immediately whether the value is ready or not, so the axis
//! state machines read as straight-line code and simply run again on
//! the next bus input.
//!
//! Staleness rules: a request Pending for more than the pending expiry
//! (1 s) is abandoned; a Valid value older than the valid expiry (5 s)
//! is discarded, so a stale cache cannot mask a desync. The periodic
//! re-issue this causes is also what keeps the sail brake register
//! asserted.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::debug;

use ebus_types::{now_us, EbusMsg, MsgKind, Register};

pub const DEFAULT_PENDING_EXPIRY: Duration = Duration::from_millis(1000);
pub const DEFAULT_VALID_EXPIRY: Duration = Duration::from_millis(5000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Invalid,
    Pending,
    Valid,
}

#[derive(Debug)]
struct Entry {
    state: State,
    value: u32,
    /// Issue time while Pending, refresh time while Valid.
    since: Instant,
}

#[derive(Debug)]
struct Device {
    serial: u32,
    registers: HashMap<Register, Entry>,
}

/// Handle for a device opened on a [`Bus`]; stable for the process
/// lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceId(usize);

/// Result of feeding a response line to [`Bus::receive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// Answered one of our pending requests; round trip time attached.
    Mine { latency: Duration },
    /// Understood and cached, but it answered someone else's request.
    Other,
}

pub struct Bus {
    sink: mpsc::UnboundedSender<String>,
    timestamps: bool,
    devices: Vec<Device>,
    pending_expiry: Duration,
    valid_expiry: Duration,
}

impl Bus {
    pub fn new(sink: mpsc::UnboundedSender<String>) -> Self {
        Bus {
            sink,
            timestamps: false,
            devices: Vec::new(),
            pending_expiry: DEFAULT_PENDING_EXPIRY,
            valid_expiry: DEFAULT_VALID_EXPIRY,
        }
    }

    /// Override the staleness periods (see module docs).
    pub fn set_expiry(&mut self, pending: Duration, valid: Duration) {
        self.pending_expiry = pending;
        self.valid_expiry = valid;
    }

    /// Append ` T:<us>` to generated requests.
    pub fn enable_timestamp(&mut self, on: bool) {
        self.timestamps = on;
    }

    /// Connect a device; repeated opens with the same serial are
    /// idempotent and return the same handle.
    pub fn open_device(&mut self, serial: u32) -> DeviceId {
        if let Some(i) = self.devices.iter().position(|d| d.serial == serial) {
            return DeviceId(i);
        }
        self.devices.push(Device { serial, registers: HashMap::new() });
        DeviceId(self.devices.len() - 1)
    }

    pub fn serial(&self, dev: DeviceId) -> u32 {
        self.devices[dev.0].serial
    }

    fn emit(&self, mut msg: EbusMsg) -> bool {
        if self.timestamps {
            msg = msg.with_timestamp(now_us());
        }
        self.sink.send(msg.to_string()).is_ok()
    }

    /// If Valid, the cached value. Otherwise `None`: an Invalid entry
    /// sends a GET and goes Pending, a Pending one just waits.
    pub fn get_register(&mut self, dev: DeviceId, reg: Register) -> Option<u32> {
        let serial = self.devices[dev.0].serial;
        let (state, value) = {
            let entry = self.devices[dev.0]
                .registers
                .entry(reg)
                .or_insert(Entry { state: State::Invalid, value: 0, since: Instant::now() });
            (entry.state, entry.value)
        };
        match state {
            State::Valid => Some(value),
            State::Pending => None,
            State::Invalid => {
                if self.emit(EbusMsg::get(serial, reg)) {
                    let entry = self.devices[dev.0].registers.get_mut(&reg).unwrap();
                    entry.state = State::Pending;
                    entry.since = Instant::now();
                }
                None
            }
        }
    }

    /// True if the register is already Valid with this value. Otherwise
    /// false: sends a SET and goes Pending. While a request is already
    /// Pending nothing is sent at all; overlapping sets for the same
    /// register only breed request storms.
    pub fn set_register(&mut self, dev: DeviceId, reg: Register, value: u32) -> bool {
        let serial = self.devices[dev.0].serial;
        let (state, cached) = {
            let entry = self.devices[dev.0]
                .registers
                .entry(reg)
                .or_insert(Entry { state: State::Invalid, value: 0, since: Instant::now() });
            (entry.state, entry.value)
        };
        match state {
            State::Pending => false,
            State::Valid if cached == value => true,
            _ => {
                let sent = self.emit(EbusMsg::set(serial, reg, value));
                let entry = self.devices[dev.0].registers.get_mut(&reg).unwrap();
                if sent {
                    entry.state = State::Pending;
                    entry.value = value;
                    entry.since = Instant::now();
                } else {
                    entry.state = State::Invalid;
                }
                false
            }
        }
    }

    /// Force Invalid so the next get or set always hits the wire.
    pub fn invalidate(&mut self, dev: DeviceId, reg: Register) {
        if let Some(entry) = self.devices[dev.0].registers.get_mut(&reg) {
            entry.state = State::Invalid;
        }
    }

    pub fn invalidate_all(&mut self, dev: DeviceId) {
        for entry in self.devices[dev.0].registers.values_mut() {
            entry.state = State::Invalid;
        }
    }

    /// Parse and dispatch one received line. `None` if the line is not a
    /// response for a register this bus has ever touched.
    pub fn receive(&mut self, line: &str) -> Option<Received> {
        let msg = EbusMsg::parse_response(line)?;
        let dev = self.devices.iter_mut().find(|d| d.serial == msg.serial)?;
        let entry = dev.registers.get_mut(&msg.reg)?;

        let was_pending = entry.state == State::Pending;
        let latency = entry.since.elapsed();
        match msg.kind {
            MsgKind::Ack(value) => {
                entry.value = value;
                entry.state = State::Valid;
                entry.since = Instant::now();
            }
            MsgKind::Err(code) => {
                debug!("0x{:x}:{} error 0x{:x}", msg.serial, msg.reg, code);
                entry.state = State::Invalid;
            }
            _ => unreachable!("parse_response yields only responses"),
        }
        if was_pending {
            Some(Received::Mine { latency })
        } else {
            Some(Received::Other)
        }
    }

    /// Expire stale entries. Returns how many Pending requests timed
    /// out (stale Valid values are silently discarded).
    pub fn expire(&mut self) -> usize {
        let mut timed_out = 0;
        for dev in &mut self.devices {
            for entry in dev.registers.values_mut() {
                match entry.state {
                    State::Pending if entry.since.elapsed() > self.pending_expiry => {
                        entry.state = State::Invalid;
                        timed_out += 1;
                    }
                    State::Valid if entry.since.elapsed() > self.valid_expiry => {
                        entry.state = State::Invalid;
                    }
                    _ => {}
                }
            }
        }
        timed_out
    }

    /// Backdate a register's clock, as if `age` had passed. Test hook
    /// for the expiry rules.
    #[cfg(test)]
    fn age_entry(&mut self, dev: DeviceId, reg: Register, age: Duration) {
        let entry = self.devices[dev.0].registers.get_mut(&reg).unwrap();
        entry.since -= age;
    }
}
