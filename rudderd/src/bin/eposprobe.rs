//! eposprobe — fixed-rate register probing
//!
//! Emits GET requests for the status and position registers of all
//! axes at a fixed frequency, so every listener on the bus sees a
//! steady stream of fresh responses. The interval is measured against
//! the monotonic clock and catches up after drift.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use ebus_types::now_us;
use rudderd::busio::BusClient;
use rudderd::config::ActuatorConfig;
use rudderd::probe::probe_round;

#[derive(Parser, Debug)]
#[command(name = "eposprobe", about = "Periodic register prober")]
struct Args {
    /// Probing frequency [Hz]
    #[arg(short = 'f', default_value = "8")]
    freq_hz: u32,
    /// Timestamp the probe requests
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
                .unwrap_or_else(|_| "eposprobe=info".into()),
        )
        .init();

    anyhow::ensure!(args.freq_hz > 0, "frequency must be positive");

    let cfg = ActuatorConfig::load(args.config.as_deref())?;
    let socket = args.bus.unwrap_or_else(|| cfg.bus.clone());
    let client = BusClient::connect(&socket, "eposprobe", &[]).await?;
    // write-only client: drop all incoming traffic at the bus
    client.send("$xoff".into());

    let params = [
        cfg.motors[0].clone(),
        cfg.motors[1].clone(),
        cfg.motors[2].clone(),
        cfg.motors[3].clone(),
    ];

    let mut ticker = tokio::time::interval(Duration::from_micros(1_000_000 / args.freq_hz as u64));
    loop {
        ticker.tick().await;
        let stamp = args.timestamps.then(now_us);
        for msg in probe_round(&params, stamp) {
            client.send(msg.to_string());
        }
    }
}
