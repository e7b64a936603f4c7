//! ruddersts — publish rudder/sail status lines
//!
//! Condenses the STATUS and position responses of all four devices
//! into `ruddersts:` messages for the planner, rate-limited between a
//! minimum and maximum cadence.

use std::path::PathBuf;

use clap::Parser;
use ebus_types::now_us;
use rudderd::busio::BusClient;
use rudderd::config::ActuatorConfig;
use rudderd::status::StatusAggregator;

#[derive(Parser, Debug)]
#[command(name = "ruddersts", about = "Rudder status aggregator")]
struct Args {
    /// Minimum time between reports [ms]
    #[arg(short = 'n', default_value = "250")]
    min_ms: i64,
    /// Maximum time between reports [ms]
    #[arg(short = 'x', default_value = "1000")]
    max_ms: i64,
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
                .unwrap_or_else(|_| "ruddersts=info".into()),
        )
        .init();

    let cfg = ActuatorConfig::load(args.config.as_deref())?;
    let socket = args.bus.unwrap_or_else(|| cfg.bus.clone());

    // one subscription per device serial: all responses, nothing else
    let subs: Vec<String> = cfg.motors.iter().map(|p| format!("0x{:x}:", p.serial)).collect();
    let mut client = BusClient::connect(&socket, "ruddersts", &subs).await?;

    let params = [
        cfg.motors[0].clone(),
        cfg.motors[1].clone(),
        cfg.motors[2].clone(),
        cfg.motors[3].clone(),
    ];
    let mut aggregator = StatusAggregator::new(params, args.min_ms, args.max_ms);

    loop {
        let line = client.next_line().await?;
        if let Some(sts) = aggregator.handle(&line, now_us()) {
            client.send(sts.to_string());
        }
    }
}
