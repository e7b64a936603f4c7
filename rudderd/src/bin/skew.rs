//! skew — estimate the angular slip between boom sensor and sail motor
//!
//! Subscribes to exactly the two position acks it needs (sail CURRPOS
//! and BMMH position), emits `skew:` lines whenever a BMMH sample falls
//! between two close motor samples, and probes for fresh samples when
//! starved.

use std::path::PathBuf;

use clap::Parser;
use tracing::debug;

use ebus_types::axis::Axis;
use ebus_types::now_us;
use ebus_types::register::{REG_BMMHPOS, REG_CURRPOS};
use rudderd::busio::BusClient;
use rudderd::config::ActuatorConfig;
use rudderd::skew::SkewComputer;

#[derive(Parser, Debug)]
#[command(name = "skew", about = "Boom/motor skew computer")]
struct Args {
    /// Timestamp generated probe requests
    #[arg(short = 'T')]
    timestamps: bool,
    /// Bus socket path (overrides the config file)
    #[arg(short = 'b', long)]
    bus: Option<String>,
    /// Optional TOML config
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "skew=info".into()),
        )
        .init();

    let cfg = ActuatorConfig::load(args.config.as_deref())?;
    let sail = cfg.params(Axis::Sail).clone();
    let bmmh = cfg.params(Axis::Bmmh).clone();
    let socket = args.bus.unwrap_or_else(|| cfg.bus.clone());

    // subscribe to the acks only; the " = " suffix keeps requests and
    // error lines out
    let mut client = BusClient::connect(
        &socket,
        "skewmon",
        &[
            format!("0x{:x}:{} = ", sail.serial, REG_CURRPOS),
            format!("0x{:x}:{} = ", bmmh.serial, REG_BMMHPOS),
        ],
    )
    .await?;

    let mut computer = SkewComputer::new(sail, bmmh, args.timestamps);

    loop {
        let line = client.next_line().await?;
        let out = computer.handle(&line, now_us());
        if let Some(skew) = out.skew {
            debug!("skew {:.3} deg", skew.angle_deg);
            client.send(skew.to_string());
        }
        for probe in out.probes {
            client.send(probe.to_string());
        }
    }
}
