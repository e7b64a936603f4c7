//! sailctl — drive the sail winch to the commanded angle
//!
//! Subscribes to the sail and BMMH register responses plus the
//! `rudderctl:` setpoints and the `skew:` estimates. The commanded sail
//! angle is corrected by the measured skew before targeting; motion
//! never starts before the first skew estimate arrives.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use ebus_types::axis::Axis;
use ebus_types::proto::{RudderCtl, Skew};
use ebus_types::register::REG_STATUS;
use ebus_types::{now_us, Timer};
use rudderd::busio::BusClient;
use rudderd::config::ActuatorConfig;
use rudderd::sail::Sail;
use rudderd::{Bus, Received, Step};

const BUSLATENCY_WARN: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(name = "sailctl", about = "Sail winch controller")]
struct Args {
    /// Timestamp generated requests
    #[arg(short = 'T')]
    timestamps: bool,
    /// Bus socket path (overrides the config file)
    #[arg(short = 'b', long)]
    bus: Option<String>,
    /// Optional TOML config
    #[arg(long)]
    config: Option<PathBuf>,
}

struct Ctl {
    bus: Bus,
    client: BusClient,
    sail: Sail,
}

impl Ctl {
    async fn process_input(&mut self) -> anyhow::Result<bool> {
        let line = self.client.next_line().await?;

        if let Some(msg) = RudderCtl::parse(&line) {
            self.sail.target_deg = msg.sail_deg;
            self.sail.storm = msg.storm_flag;
            return Ok(true);
        }
        if let Some(msg) = Skew::parse(&line) {
            if self.sail.skew_deg.is_nan() && !msg.angle_deg.is_nan() {
                info!("got skew angle {:.2}", msg.angle_deg);
            }
            self.sail.skew_deg = msg.angle_deg;
            return Ok(true);
        }

        let timed_out = self.bus.expire();
        if timed_out > 0 {
            warn!("timed out {timed_out} epos requests");
        }
        match self.bus.receive(&line) {
            Some(Received::Mine { latency }) => {
                if latency > BUSLATENCY_WARN {
                    warn!("high epos latency: {} ms", latency.as_millis());
                }
                Ok(true)
            }
            Some(Received::Other) => Ok(true),
            None => Ok(false),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sailctl=info".into()),
        )
        .init();

    let cfg = ActuatorConfig::load(args.config.as_deref())?;
    let params = cfg.params(Axis::Sail).clone();
    let bmmh_serial = cfg.params(Axis::Bmmh).serial;
    let socket = args.bus.unwrap_or_else(|| cfg.bus.clone());

    let client = BusClient::connect(
        &socket,
        "sail",
        &[
            format!("0x{:x}", params.serial),
            format!("0x{bmmh_serial:x}"),
            "rudderctl:".into(),
            "skew:".into(),
        ],
    )
    .await?;

    let mut bus = Bus::new(client.tx.clone());
    bus.set_expiry(cfg.pending_expiry(), cfg.valid_expiry());
    bus.enable_timestamp(args.timestamps);
    let sail = Sail::new(&mut bus, params);

    let mut ctl = Ctl { bus, client, sail };
    let mut reach = Timer::new();
    let mut state = Step::Defunct;

    loop {
        info!("initializing sail");
        let dev = ctl.sail.dev;
        ctl.bus.invalidate_all(dev);
        let _ = ctl.bus.get_register(dev, REG_STATUS); // kick off communications

        while state != Step::Targeting {
            if ctl.process_input().await? {
                state = ctl.sail.init(&mut ctl.bus);
            }
        }
        info!("done initializing sail");

        if ctl.sail.skew_deg.is_nan() {
            warn!("no skew angle input yet");
            while ctl.sail.skew_deg.is_nan() {
                ctl.process_input().await?;
            }
            info!("got skew angle {:.2}", ctl.sail.skew_deg);
        }

        while state != Step::Homing {
            if ctl.process_input().await? {
                state = ctl.sail.control(&mut ctl.bus);
            }
            if ctl.sail.target_deg.is_nan() {
                continue;
            }

            match state {
                Step::Targeting => {
                    if !reach.running() {
                        reach.tick(now_us(), true);
                    }
                }
                Step::Reached => {
                    if reach.running() {
                        reach.tick(now_us(), false);
                        if reach.count() % 200 == 0 {
                            if let Some(stats) = reach.stats() {
                                info!("target reached {stats}");
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }
}
