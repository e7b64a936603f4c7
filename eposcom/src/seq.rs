//! seq.rs — retry sequencing for register writes and polled reads
//!
//! Register configuration happens in bursts of writes; a single serial
//! hiccup must not abort a whole setup sequence, but a dead device must
//! not stall it forever either. Every command gets up to 3 tries with a
//! doubling backoff starting at 10 ms; the sequence as a whole carries a
//! budget of 10 failed tries. A command that exhausts its tries stops
//! the sequence and surfaces the last error.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use ebus_types::Register;

use crate::frame::{read_object, write_object, EposError};

const TRIES: u32 = 3;
const BACKOFF: Duration = Duration::from_millis(10);
const SEQUENCE_FAULT_BUDGET: u32 = 10;
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Write `cmds` in order with bounded retries.
pub async fn sequence<P>(
    port: &mut P,
    nodeid: u8,
    cmds: &[(Register, u32)],
) -> Result<(), EposError>
where
    P: AsyncRead + AsyncWrite + Unpin,
{
    let mut faults = 0u32;
    for &(reg, value) in cmds {
        let mut delay = BACKOFF;
        let mut last = EposError::Xmit;
        let mut done = false;
        for _ in 0..TRIES {
            match write_object(port, reg.index(), reg.subindex(), nodeid, value).await {
                Ok(()) => {
                    done = true;
                    break;
                }
                Err(e) => {
                    last = e;
                    faults += 1;
                    if faults >= SEQUENCE_FAULT_BUDGET {
                        return Err(last);
                    }
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
        if !done {
            return Err(last);
        }
    }
    Ok(())
}

/// Repeatedly read `reg` until `value & mask == expected` or the timeout
/// elapses. A mask of zero turns this into a single retried read.
/// Blocks for up to `timeout`; use with care.
pub async fn wait_object<P>(
    port: &mut P,
    timeout: Duration,
    reg: Register,
    nodeid: u8,
    mask: u32,
    expected: u32,
) -> Result<u32, EposError>
where
    P: AsyncRead + AsyncWrite + Unpin,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let mut delay = BACKOFF;
        let mut result = Err(EposError::Recv);
        for _ in 0..TRIES {
            result = read_object(port, reg.index(), reg.subindex(), nodeid).await;
            if result.is_ok() {
                break;
            }
            tokio::time::sleep(delay).await;
            delay *= 2;
        }

        if let Ok(value) = result {
            if value & mask == expected {
                return Ok(value);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(EposError::Timeout);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
