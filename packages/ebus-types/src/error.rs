//! error.rs — device error codes
//!
//! The 32-bit error codes a motor controller reports in reply frames
//! (SDO abort codes plus manufacturer extensions), and the link-local
//! codes the serial multiplexer uses for its own failures so they can
//! ride the same `#` error lines.

// Link-local codes, outside the device-defined space.
pub const ERR_BADRESPONSE: u32 = 0x0810_0010;
pub const ERR_NACK: u32 = 0x0810_0020;
pub const ERR_RECV: u32 = 0x0810_0030;
pub const ERR_XMIT: u32 = 0x0810_0040;
pub const ERR_BADCRC: u32 = 0x0810_0050;
pub const ERR_TIMEOUT: u32 = 0x0810_0060;

static ERROR_STR: &[(u32, &str)] = &[
    (0x0000_0000, "No error."),
    (0x0503_0000, "Toggle bit not alternated."),
    (0x0504_0000, "SDO protocol timed out."),
    (0x0504_0001, "Client/server command specifier not valid or unknown."),
    (0x0504_0005, "Out of memory"),
    (0x0601_0000, "Unsupported access to an object."),
    (0x0601_0001, "Attempt to read a write only object."),
    (0x0601_0002, "Attempt to write a read only object."),
    (0x0602_0000, "Object does not exist in the object dictionary."),
    (0x0604_0041, "Object cannot be mapped to the PDO."),
    (0x0604_0042, "The number and length of the objects to be mapped would exceed PDO length."),
    (0x0604_0043, "General parameter incompatibility reason."),
    (0x0604_0047, "General internal incompatibility reason."),
    (0x0606_0000, "Access failed due to an hardware error."),
    (0x0607_0010, "Data type does not match, length of service parameter does not match."),
    (0x0607_0012, "Data type does not match, length of service parameter too high."),
    (0x0607_0013, "Data type does not match, length of service parameter too low."),
    (0x0609_0011, "Sub-index does not exist."),
    (0x0609_0030, "Value range of parameter exceeded (only for write access)."),
    (0x0609_0031, "Value of parameter written too high."),
    (0x0609_0032, "Value of parameter written too low."),
    (0x0609_0036, "Maximum value is less than minimum value."),
    (0x0800_0000, "General error."),
    (0x0800_0020, "Data cannot be transferred or stored to the application."),
    (0x0800_0021, "Data cannot be transferred or stored to the application because of local control."),
    (0x0800_0022, "Data cannot be transferred or stored to the application because of the present device state."),
    (0x0F00_FFC0, "The device is in wrong NMT state."),
    (0x0F00_FFBF, "The RS232 command is illegal."),
    (0x0F00_FFBE, "The password is not correct."),
    (0x0F00_FFBC, "The device is not in service mode."),
    (0x0F00_FFB9, "Error Node-ID."),
    (ERR_BADRESPONSE, "RS232: Bad response frame."),
    (ERR_NACK, "RS232: Non-ACK."),
    (ERR_RECV, "RS232: Receive error."),
    (ERR_XMIT, "RS232: Transmit error."),
    (ERR_BADCRC, "RS232: Received bad CRC."),
    (ERR_TIMEOUT, "RS232: Timeout waiting for value."),
];

/// Human-readable text for a device or link error code.
pub fn strerror(code: u32) -> &'static str {
    ERROR_STR
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, m)| *m)
        .unwrap_or("Unknown error code")
}
