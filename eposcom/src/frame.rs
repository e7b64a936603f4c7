//! frame.rs — binary framing over the RS-232 link
//!
//! The motor controllers speak a half-duplex framed protocol with
//! per-frame acks (Communication Guide §6):
//!
//! ```text
//! host → device:  [opcode]
//! device → host:  ['O']                         ready ack
//! host → device:  [len-1][payload…][crc-lo][crc-hi]
//! device → host:  ['O' | 'F']                   end ack
//! ```
//!
//! and the mirror image for the reply frame. `len` counts 16-bit words
//! after the length byte, excluding the CRC. The CRC is CCITT-0x1021
//! computed word-wise with (opcode, len-1) as the first (big-endian)
//! word, the payload as little-endian words, and the CRC slot itself
//! counted as zero. Every read is bounded by a 500 ms timeout; there is
//! no pipelining.
//!
//! All transactions are generic over the port so tests can run them
//! against an in-memory pipe.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use ebus_types::error as ecode;
use ebus_types::error::strerror;

pub const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Everything that can go wrong in one transaction. `Device` carries
/// the 32-bit error code reported in the reply payload.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EposError {
    #[error("bad response frame")]
    BadResponse,
    #[error("non-ACK from device")]
    Nack,
    #[error("receive error or timeout")]
    Recv,
    #[error("transmit error")]
    Xmit,
    #[error("received bad CRC")]
    BadCrc,
    #[error("timeout waiting for value")]
    Timeout,
    #[error("device error 0x{0:08x}: {}", strerror(*.0))]
    Device(u32),
}

impl EposError {
    /// The 32-bit code used on `#` error lines; device codes pass
    /// through, link errors use the codes outside the device space.
    pub fn code(&self) -> u32 {
        match *self {
            EposError::BadResponse => ecode::ERR_BADRESPONSE,
            EposError::Nack => ecode::ERR_NACK,
            EposError::Recv => ecode::ERR_RECV,
            EposError::Xmit => ecode::ERR_XMIT,
            EposError::BadCrc => ecode::ERR_BADCRC,
            EposError::Timeout => ecode::ERR_TIMEOUT,
            EposError::Device(code) => code,
        }
    }
}

fn crc_ccitt(mut crc: u16, data: u16) -> u16 {
    let mut mask = 0x8000u16;
    while mask != 0 {
        let c = crc & 0x8000;
        crc <<= 1;
        if data & mask != 0 {
            crc += 1;
        }
        if c != 0 {
            crc ^= 0x1021;
        }
        mask >>= 1;
    }
    crc
}

/// CRC over a complete frame buffer (opcode, len-1, payload, crc slot).
/// The trailing two bytes are counted as a zero word.
fn frame_crc(frame: &[u8]) -> u16 {
    debug_assert!(frame.len() > 2 && frame.len() % 2 == 0);
    // opcode and len form a big-endian word, the payload little-endian ones
    let mut crc = crc_ccitt(0, ((frame[0] as u16) << 8) | frame[1] as u16);
    for chunk in frame[2..frame.len() - 2].chunks_exact(2) {
        crc = crc_ccitt(crc, chunk[0] as u16 | ((chunk[1] as u16) << 8));
    }
    crc_ccitt(crc, 0)
}

async fn read_byte<P>(port: &mut P) -> Result<u8, EposError>
where
    P: AsyncRead + Unpin,
{
    let mut byte = [0u8; 1];
    match tokio::time::timeout(READ_TIMEOUT, port.read_exact(&mut byte)).await {
        Ok(Ok(_)) => Ok(byte[0]),
        _ => Err(EposError::Recv),
    }
}

async fn write_bytes<P>(port: &mut P, data: &[u8]) -> Result<(), EposError>
where
    P: AsyncWrite + Unpin,
{
    port.write_all(data).await.map_err(|_| EposError::Xmit)?;
    port.flush().await.map_err(|_| EposError::Xmit)
}

/// Send one frame, observing both acks. `frame` must have room for the
/// CRC in its last two bytes.
async fn xmit<P>(port: &mut P, frame: &mut [u8]) -> Result<(), EposError>
where
    P: AsyncRead + AsyncWrite + Unpin,
{
    debug_assert!(frame.len() >= 6);
    let crc = frame_crc(frame);
    let n = frame.len();
    frame[n - 2] = crc as u8;
    frame[n - 1] = (crc >> 8) as u8;

    write_bytes(port, &frame[..1]).await?;
    if read_byte(port).await? != b'O' {
        return Err(EposError::Nack);
    }
    write_bytes(port, &frame[1..]).await?;
    if read_byte(port).await? != b'O' {
        return Err(EposError::Nack);
    }
    Ok(())
}

/// Receive one frame into `buf`, acking each stage. Returns the total
/// frame length (opcode + len byte + payload + crc).
async fn recv_frame<P>(port: &mut P, buf: &mut [u8]) -> Result<usize, EposError>
where
    P: AsyncRead + AsyncWrite + Unpin,
{
    debug_assert!(buf.len() >= 6);
    buf[0] = read_byte(port).await?;
    write_bytes(port, b"O").await?;

    buf[1] = read_byte(port).await?;
    let n = 2 * (buf[1] as usize + 1) + 2;
    if 2 + n > buf.len() {
        return Err(EposError::BadResponse);
    }
    let total = 2 + n;
    match tokio::time::timeout(READ_TIMEOUT, port.read_exact(&mut buf[2..total])).await {
        Ok(Ok(_)) => {}
        _ => return Err(EposError::Recv),
    }

    let crc = frame_crc(&buf[..total]);
    let wire = buf[total - 2] as u16 | ((buf[total - 1] as u16) << 8);
    let ok = crc == wire;
    write_bytes(port, if ok { b"O" } else { b"F" }).await?;
    if !ok {
        return Err(EposError::BadCrc);
    }
    Ok(total)
}

fn payload_u32(frame: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([frame[offset], frame[offset + 1], frame[offset + 2], frame[offset + 3]])
}

/// ReadObject (§6.3.1.1): fetch one register value.
pub async fn read_object<P>(
    port: &mut P,
    index: u16,
    subindex: u8,
    nodeid: u8,
) -> Result<u32, EposError>
where
    P: AsyncRead + AsyncWrite + Unpin,
{
    let mut frame = [
        0x10,
        1,
        index as u8,
        (index >> 8) as u8,
        subindex,
        nodeid,
        0,
        0,
    ];
    xmit(port, &mut frame).await?;

    let mut reply = [0u8; 12];
    let len = recv_frame(port, &mut reply).await?;
    if reply[0] != 0 || len != 12 || reply[1] != 3 {
        return Err(EposError::BadResponse);
    }
    let code = payload_u32(&reply, 2);
    if code != 0 {
        return Err(EposError::Device(code));
    }
    Ok(payload_u32(&reply, 6))
}

/// WriteObject (§6.3.2.1): store one register value.
pub async fn write_object<P>(
    port: &mut P,
    index: u16,
    subindex: u8,
    nodeid: u8,
    value: u32,
) -> Result<(), EposError>
where
    P: AsyncRead + AsyncWrite + Unpin,
{
    let mut frame = [
        0x11,
        3,
        index as u8,
        (index >> 8) as u8,
        subindex,
        nodeid,
        value as u8,
        (value >> 8) as u8,
        (value >> 16) as u8,
        (value >> 24) as u8,
        0,
        0,
    ];
    xmit(port, &mut frame).await?;

    let mut reply = [0u8; 10];
    let len = recv_frame(port, &mut reply).await?;
    if reply[0] != 0 || len != 8 || reply[1] != 1 {
        return Err(EposError::BadResponse);
    }
    let code = payload_u32(&reply, 2);
    if code != 0 {
        return Err(EposError::Device(code));
    }
    Ok(())
}

/// NMT services (§6.3.2.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NmtCommand {
    StartRemoteNode = 1,
    StopRemoteNode = 2,
    EnterPreOperational = 128,
    ResetNode = 129,
    ResetCommunication = 130,
}

/// SendNMTService: fire-and-forget network management command.
pub async fn send_nmt<P>(port: &mut P, nodeid: u8, cmd: NmtCommand) -> Result<(), EposError>
where
    P: AsyncRead + AsyncWrite + Unpin,
{
    let mut frame = [0x0e, 1, nodeid, 0, cmd as u8, 0, 0, 0];
    xmit(port, &mut frame).await
}

/// SendCANFrame (§6.3.3.1): raw CAN message, up to 8 data bytes.
pub async fn send_can_frame<P>(port: &mut P, cobid: u16, data: &[u8]) -> Result<(), EposError>
where
    P: AsyncRead + AsyncWrite + Unpin,
{
    debug_assert!(cobid & !0x7FF == 0);
    debug_assert!(data.len() <= 8);
    let mut frame = [0u8; 16];
    frame[0] = 0x20;
    frame[1] = 5;
    frame[2] = cobid as u8;
    frame[3] = (cobid >> 8) as u8;
    frame[4] = data.len() as u8;
    frame[6..6 + data.len()].copy_from_slice(data);
    xmit(port, &mut frame).await
}

/// RequestCANFrame (§6.3.3.2): remote transmission request; fills `data`.
pub async fn request_can_frame<P>(
    port: &mut P,
    cobid: u16,
    len: usize,
    data: &mut [u8; 8],
) -> Result<(), EposError>
where
    P: AsyncRead + AsyncWrite + Unpin,
{
    debug_assert!(cobid & !0x7FF == 0);
    debug_assert!(len <= 8);
    let mut frame = [0u8; 8];
    frame[0] = 0x20;
    frame[1] = 1;
    frame[2] = cobid as u8;
    frame[3] = (cobid >> 8) as u8;
    frame[4] = len as u8;
    xmit(port, &mut frame).await?;

    let mut reply = [0u8; 16];
    let n = recv_frame(port, &mut reply).await?;
    if reply[0] != 0 || n != 16 || reply[1] != 5 {
        return Err(EposError::BadResponse);
    }
    let code = payload_u32(&reply, 2);
    if code != 0 {
        return Err(EposError::Device(code));
    }
    data[..len].copy_from_slice(&reply[6..6 + len]);
    data[len..].fill(0);
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    /// Known-good reply to a ReadObject: error word 0, value 0x11223344.
    fn read_reply(value: u32) -> Vec<u8> {
        device_frame(
            0,
            &[0, 0, value as u16, (value >> 16) as u16],
        )
    }

    #[tokio::test]
    async fn read_object_roundtrip() {
        let (mut host, mut dev) = tokio::io::duplex(256);
        let reply = read_reply(0x11223344);
        let server = tokio::spawn(async move {
            serve_one(&mut dev, &reply).await;
        });
        let v = read_object(&mut host, 0x6041, 0, 1).await.unwrap();
        assert_eq!(v, 0x11223344);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn write_object_roundtrip() {
        let (mut host, mut dev) = tokio::io::duplex(256);
        let reply = device_frame(0, &[0, 0]);
        let server = tokio::spawn(async move {
            serve_one(&mut dev, &reply).await;
        });
        write_object(&mut host, 0x6040, 0, 1, 0x3f).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn device_error_code_is_surfaced() {
        let (mut host, mut dev) = tokio::io::duplex(256);
        let code = 0x0810_0020u32;
        let reply = device_frame(0, &[code as u16, (code >> 16) as u16, 0, 0]);
        let server = tokio::spawn(async move {
            serve_one(&mut dev, &reply).await;
        });
        let r = read_object(&mut host, 0x6041, 0, 1).await;
        assert_eq!(r, Err(EposError::Device(code)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn corrupted_payload_yields_bad_crc() {
        let (mut host, mut dev) = tokio::io::duplex(256);
        let mut reply = read_reply(0xdead);
        reply[4] ^= 0x40; // flip a payload bit, keep the old crc
        let server = tokio::spawn(async move {
            serve_one(&mut dev, &reply).await;
        });
        let r = read_object(&mut host, 0x6041, 0, 1).await;
        assert_eq!(r, Err(EposError::BadCrc));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn corrupted_crc_yields_bad_crc() {
        let (mut host, mut dev) = tokio::io::duplex(256);
        let mut reply = read_reply(0xdead);
        let n = reply.len();
        reply[n - 1] ^= 0xff;
        let server = tokio::spawn(async move {
            serve_one(&mut dev, &reply).await;
        });
        assert_eq!(
            read_object(&mut host, 0x6041, 0, 1).await,
            Err(EposError::BadCrc)
        );
        server.await.unwrap();
    }

    #[tokio::test]
    async fn wrong_length_reply_is_bad_response() {
        let (mut host, mut dev) = tokio::io::duplex(256);
        let reply = device_frame(0, &[0, 0]); // write-style reply to a read
        let server = tokio::spawn(async move {
            serve_one(&mut dev, &reply).await;
        });
        assert_eq!(
            read_object(&mut host, 0x6041, 0, 1).await,
            Err(EposError::BadResponse)
        );
        server.await.unwrap();
    }

    #[tokio::test]
    async fn nack_on_opcode() {
        let (mut host, mut dev) = tokio::io::duplex(256);
        let server = tokio::spawn(async move {
            let mut opcode = [0u8; 1];
            dev.read_exact(&mut opcode).await.unwrap();
            dev.write_all(b"F").await.unwrap();
        });
        assert_eq!(
            read_object(&mut host, 0x6041, 0, 1).await,
            Err(EposError::Nack)
        );
        server.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn silent_device_times_out() {
        let (mut host, _dev) = tokio::io::duplex(256);
        assert_eq!(
            read_object(&mut host, 0x6041, 0, 1).await,
            Err(EposError::Recv)
        );
    }

    #[test]
    fn crc_counts_its_own_slot_as_zero() {
        let f1 = testutil::device_frame(0x10, &[0x1234]);
        // recomputing over the finished frame must reproduce the stored crc
        let stored = f1[f1.len() - 2] as u16 | ((f1[f1.len() - 1] as u16) << 8);
        assert_eq!(frame_crc(&f1), stored);
    }
}
