//! eposmon — watch the bus for device errors and faults
//!
//! Passive observer: counts requests, acks and error lines per axis,
//! decodes fault status words and device error codes into text, and
//! logs a summary at a bounded cadence.

use std::path::PathBuf;

use clap::Parser;
use ebus_types::now_us;
use rudderd::busio::BusClient;
use rudderd::config::ActuatorConfig;
use rudderd::monitor::Monitor;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "eposmon", about = "Bus error monitor")]
struct Args {
    /// Minimum time between summaries [s]
    #[arg(short = 'n', default_value = "10")]
    min_s: i64,
    /// Maximum time between summaries [s]
    #[arg(short = 'x', default_value = "300")]
    max_s: i64,
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
                .unwrap_or_else(|_| "eposmon=info".into()),
        )
        .init();

    let cfg = ActuatorConfig::load(args.config.as_deref())?;
    let socket = args.bus.unwrap_or_else(|| cfg.bus.clone());
    // no filters: the monitor wants to see everything
    let mut client = BusClient::connect(&socket, "eposmon", &[]).await?;

    let params = [
        cfg.motors[0].clone(),
        cfg.motors[1].clone(),
        cfg.motors[2].clone(),
        cfg.motors[3].clone(),
    ];
    let mut monitor = Monitor::new(params, args.min_s, args.max_s);

    loop {
        let line = client.next_line().await?;
        if let Some(summary) = monitor.handle(&line, now_us()) {
            info!("{summary}");
        }
    }
}
