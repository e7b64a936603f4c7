//! eposcom — serial command multiplexer
//!
//! Owns the RS-232 link to the motor controllers and translates between
//! the textual line bus and the binary register protocol. On startup it
//! probes node-ids 1..=9 for their serial numbers, subscribes to the
//! discovered serials on the bus, and then serves request lines:
//!
//! ```text
//! 0x<serial>:0x<index>[<sub>]             → read, answered with = or #
//! 0x<serial>:0x<index>[<sub>] := 0x<val>  → write, answered with = or #
//! ```
//!
//! `-r` switches to raw single-shot transactions (no retry sequencer);
//! `-T` appends ` T:<us>` to every emitted line. A transaction slower
//! than 100 ms is logged; SIGUSR1 dumps the per-node latency timers.

mod frame;
mod seq;

use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio_serial::SerialPortBuilderExt;
use tracing::{info, warn};

use ebus_types::register::REG_SERIALNUMBER;
use ebus_types::{now_us, EbusMsg, MsgKind, Timer};

use frame::{read_object, write_object};
use seq::{sequence, wait_object};

/// Node-ids beyond this are never probed.
const MAX_NODEID: u8 = 9;
const SLOW_TRANSACTION_US: i64 = 100 * 1000;

#[derive(Parser, Debug)]
#[command(name = "eposcom", about = "Serial line multiplexer for EPOS motor controllers")]
struct Args {
    /// Serial device, e.g. /dev/ttyUSB0
    device: String,
    /// Raw single-shot transactions instead of the retry sequencer
    #[arg(short = 'r')]
    raw: bool,
    /// Timestamp emitted acks and errors
    #[arg(short = 'T')]
    timestamps: bool,
    /// Timeout for polled reads [ms]
    #[arg(short = 't', default_value = "1000")]
    timeout_ms: u64,
    /// Path of the line bus socket
    #[arg(short = 'b', long, default_value = "/var/run/lbus")]
    bus: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "eposcom=info".into()),
        )
        .init();

    let mut port = tokio_serial::new(&args.device, 38400)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .open_native_async()
        .with_context(|| format!("open {}", args.device))?;

    let bus = UnixStream::connect(&args.bus)
        .await
        .with_context(|| format!("connect {}", args.bus))?;
    let (bus_read, mut bus_write) = bus.into_split();
    let mut bus_lines = BufReader::new(bus_read).lines();

    // hold traffic until probing is done, so requests can't pile up
    let name = args.device.rsplit('/').next().unwrap_or(&args.device);
    bus_write
        .write_all(format!("$xoff\n$name epos-{name}\n").as_bytes())
        .await?;

    // serial-number probe: node-id → serial map for this bus session
    let mut serial_of_node: [Option<u32>; MAX_NODEID as usize + 1] = Default::default();
    let mut timers: Vec<Timer> = (0..=MAX_NODEID).map(|_| Timer::new()).collect();
    let mut found = 0;
    for nodeid in 1..=MAX_NODEID {
        match read_object(
            &mut port,
            REG_SERIALNUMBER.index(),
            REG_SERIALNUMBER.subindex(),
            nodeid,
        )
        .await
        {
            Ok(serial) => {
                info!("port:{} nodeid:{} serial:0x{:x}", args.device, nodeid, serial);
                serial_of_node[nodeid as usize] = Some(serial);
                bus_write
                    .write_all(format!("$subscribe 0x{serial:x}\n").as_bytes())
                    .await?;
                found += 1;
            }
            Err(e) => {
                tracing::debug!("nodeid {nodeid}: {e}");
            }
        }
    }
    bus_write.write_all(b"$xon\n").await?;

    if found == 0 {
        bail!("no epos devices found on {}", args.device);
    }

    let timeout = Duration::from_millis(args.timeout_ms);
    let mut sigusr1 = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined1())?;

    loop {
        tokio::select! {
            line = bus_lines.next_line() => {
                let Some(line) = line.context("reading bus")? else {
                    bail!("bus closed");
                };
                let Some(req) = EbusMsg::parse_request(&line) else {
                    tracing::debug!("unparseable line:\"{}\"", line.trim_end());
                    continue;
                };
                let Some(nodeid) = serial_of_node
                    .iter()
                    .position(|s| *s == Some(req.serial))
                else {
                    continue; // not one of our devices
                };

                let timer = &mut timers[nodeid];
                timer.tick(now_us(), true);

                let result = match req.kind {
                    MsgKind::Set(value) => {
                        let r = if args.raw {
                            write_object(
                                &mut port,
                                req.reg.index(),
                                req.reg.subindex(),
                                nodeid as u8,
                                value,
                            )
                            .await
                        } else {
                            sequence(&mut port, nodeid as u8, &[(req.reg, value)]).await
                        };
                        r.map(|()| value)
                    }
                    MsgKind::Get => {
                        if args.raw {
                            read_object(
                                &mut port,
                                req.reg.index(),
                                req.reg.subindex(),
                                nodeid as u8,
                            )
                            .await
                        } else {
                            wait_object(&mut port, timeout, req.reg, nodeid as u8, 0, 0).await
                        }
                    }
                    _ => continue,
                };

                let lat_us = timer.tick(now_us(), false);
                if lat_us > SLOW_TRANSACTION_US {
                    warn!("slow epos response on serial:0x{:x}", req.serial);
                }

                let mut reply = match result {
                    Ok(value) => EbusMsg::ack(req.serial, req.reg, value),
                    Err(e) => EbusMsg::err(req.serial, req.reg, e.code()),
                };
                if args.timestamps {
                    reply = reply.with_timestamp(now_us());
                }
                bus_write
                    .write_all(format!("{reply}\n").as_bytes())
                    .await
                    .context("writing bus")?;
            }
            _ = sigusr1.recv() => {
                for (nodeid, serial) in serial_of_node.iter().enumerate() {
                    let Some(serial) = serial else { continue };
                    match timers[nodeid].stats() {
                        Some(stats) => info!("serial: 0x{serial:x} {stats}"),
                        None => info!("serial: 0x{serial:x} count:{}", timers[nodeid].count()),
                    }
                }
            }
        }
    }
}
