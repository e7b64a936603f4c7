//! linebusd — the text-line fan-out daemon
//!
//! Listens on a unix socket. Every connection is a client that can send
//! lines (broadcast to all other clients, subject to their filters) and
//! `$`-prefixed control commands handled by the daemon itself:
//!
//! ```text
//! $name <id>          name this client for diagnostics
//! $subscribe <prefix> only forward lines starting with <prefix>
//! $xoff / $xon        pause / resume delivery to this client
//! $precious           take the bus down when this client goes away
//! $stats              echo per-client state (JSON, one line per client)
//! $kill <id>          close every client bearing that name
//! ```
//!
//! Delivery is not reliable: a client that cannot keep up has lines
//! dropped rather than slowing anyone else down.

mod filter;
mod hub;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{info, warn};

use ebus_types::{now_us, Timer};
use hub::{Hub, CLIENT_QUEUE};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "linebusd", about = "Line bus fan-out daemon")]
struct Args {
    /// Path of the unix socket to listen on
    socket: PathBuf,
    /// Command prefix character
    #[arg(short = 'c', default_value = "$")]
    cmdchar: char,
    /// Debug mode: verbose logging, tight slow-cycle threshold
    #[arg(short = 'd', long)]
    debug: bool,
}

// ── Per-connection task ───────────────────────────────────────────────────────

enum Event {
    Line(usize, String),
    Closed(usize),
}

async fn client_task(
    id: usize,
    stream: UnixStream,
    mut out_rx: mpsc::Receiver<String>,
    events: mpsc::Sender<Event>,
) {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    loop {
        tokio::select! {
            read = lines.next_line() => match read {
                Ok(Some(line)) => {
                    if events.send(Event::Line(id, line)).await.is_err() {
                        break;
                    }
                }
                // EOF or read error: the peer is gone
                _ => break,
            },
            msg = out_rx.recv() => match msg {
                Some(mut line) => {
                    line.push('\n');
                    // write failure (EPIPE) closes this client only
                    if write.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                }
                // hub dropped our queue ($kill or hung verdict)
                None => break,
            },
        }
    }
    let _ = events.send(Event::Closed(id)).await;
}

// ── Main ──────────────────────────────────────────────────────────────────────

fn cleanup(socket: &PathBuf) {
    let _ = std::fs::remove_file(socket);
    let _ = std::fs::remove_file(pidfile_path(socket));
}

fn pidfile_path(socket: &PathBuf) -> PathBuf {
    let mut p = socket.as_os_str().to_owned();
    p.push(".pid");
    PathBuf::from(p)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                if args.debug { "linebusd=debug".into() } else { "linebusd=info".into() }
            }),
        )
        .init();

    // a previous unclean shutdown may have left the socket behind
    let _ = std::fs::remove_file(&args.socket);
    let listener = UnixListener::bind(&args.socket)
        .with_context(|| format!("bind {}", args.socket.display()))?;

    std::fs::write(pidfile_path(&args.socket), format!("{}\n", std::process::id()))
        .context("writing pidfile")?;

    info!("started on socket {}", args.socket.display());

    let slow_cycle_us: i64 = if args.debug { 200 } else { 4_000 };
    let mut hub = Hub::new(args.cmdchar);
    let mut cycle = Timer::new();
    let (event_tx, mut event_rx) = mpsc::channel::<Event>(1024);

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    let result = loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let (tx, rx) = mpsc::channel(CLIENT_QUEUE);
                    let id = hub.add_client(tx);
                    tokio::spawn(client_task(id, stream, rx, event_tx.clone()));
                }
                Err(e) => {
                    // peer probably hung up before we got here
                    info!("accept: {e}");
                }
            },
            event = event_rx.recv() => {
                let Some(event) = event else { break Ok(()) };
                cycle.tick(now_us(), true);
                let r = match event {
                    Event::Line(id, line) => hub.handle_line(id, &line),
                    Event::Closed(id) => hub.client_closed(id),
                };
                let run_us = cycle.tick(now_us(), false);
                if run_us > slow_cycle_us {
                    match cycle.stats() {
                        Some(stats) => warn!("slow cycle: {stats}"),
                        None => warn!("slow cycle: {run_us}us"),
                    }
                }
                if let Err(e) = r {
                    break Err(e);
                }
            },
            _ = sigterm.recv() => {
                info!("SIGTERM, shutting down");
                break Ok(());
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                break Ok(());
            }
        }
    };

    cleanup(&args.socket);
    // give connection tasks a beat to observe their closed queues
    tokio::time::sleep(Duration::from_millis(10)).await;

    result.context("bus terminated")
}
