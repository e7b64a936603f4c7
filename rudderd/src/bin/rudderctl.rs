//! rudderctl — keep one rudder homed and on the commanded angle
//!
//! Subscribes to its own motor's register responses and to the
//! `rudderctl:` setpoint lines. The outer loop alternates between the
//! init sequence (fault clear, configuration, homing) and the control
//! loop, falling back to init whenever homing or PPM mode is lost.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::bail;
use clap::Parser;
use tracing::{info, warn};

use ebus_types::axis::Axis;
use ebus_types::proto::RudderCtl;
use ebus_types::register::REG_STATUS;
use ebus_types::{now_ms, now_us, Timer};
use rudderd::busio::BusClient;
use rudderd::config::ActuatorConfig;
use rudderd::rudder::Rudder;
use rudderd::{Bus, Received, Step};

const BUSLATENCY_WARN: Duration = Duration::from_millis(200);
const WARN_INTERVAL_MS: i64 = 15_000;
const MAX_WARN_INTERVAL_MS: i64 = 15 * 60 * 1000;

#[derive(Parser, Debug)]
#[command(name = "rudderctl", about = "Rudder axis controller")]
struct Args {
    /// Control the port (left) rudder
    #[arg(short = 'l')]
    left: bool,
    /// Control the starboard (right) rudder
    #[arg(short = 'r')]
    right: bool,
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
    rudder: Rudder,
    axis: Axis,
}

impl Ctl {
    /// Process one line from the bus. True if anything changed that
    /// makes running a step worthwhile.
    async fn process_input(&mut self) -> anyhow::Result<bool> {
        let line = self.client.next_line().await?;

        if let Some(msg) = RudderCtl::parse(&line) {
            self.rudder.target_deg = match self.axis {
                Axis::Left => msg.rudder_l_deg,
                _ => msg.rudder_r_deg,
            };
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
    let axis = match (args.left, args.right) {
        (true, false) => Axis::Left,
        (false, true) => Axis::Right,
        _ => bail!("exactly one of -l or -r required"),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rudderctl=info".into()),
        )
        .init();

    let cfg = ActuatorConfig::load(args.config.as_deref())?;
    let params = cfg.params(axis).clone();
    let socket = args.bus.unwrap_or_else(|| cfg.bus.clone());

    let client = BusClient::connect(
        &socket,
        &params.label,
        &[format!("0x{:x}", params.serial), "rudderctl:".into()],
    )
    .await?;

    let mut bus = Bus::new(client.tx.clone());
    bus.set_expiry(cfg.pending_expiry(), cfg.valid_expiry());
    bus.enable_timestamp(args.timestamps);
    let rudder = Rudder::new(&mut bus, params);

    let mut ctl = Ctl { bus, client, rudder, axis };
    let mut reach = Timer::new();
    let mut last_reached = now_ms();
    let mut warn_interval = WARN_INTERVAL_MS;
    let mut state = Step::Defunct;

    loop {
        warn!("initializing rudder");
        let dev = ctl.rudder.dev;
        ctl.bus.invalidate_all(dev);
        let _ = ctl.bus.get_register(dev, REG_STATUS); // kick off communications

        while state != Step::Targeting {
            if ctl.process_input().await? {
                state = ctl.rudder.init(&mut ctl.bus);
            }
        }
        warn!("done initializing rudder");

        while state != Step::Homing {
            if ctl.process_input().await? {
                state = ctl.rudder.control(&mut ctl.bus);
            }
            if ctl.rudder.target_deg.is_nan() {
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

            let now = now_ms();
            if state == Step::Reached || now < last_reached {
                last_reached = now;
                warn_interval = WARN_INTERVAL_MS;
            }
            if now - last_reached > warn_interval {
                warn!(
                    "unable to reach target {:.3} for {} s",
                    ctl.rudder.target_deg,
                    (now - last_reached) / 1000
                );
                last_reached = now; // quiet until the next interval
                if warn_interval < MAX_WARN_INTERVAL_MS {
                    warn_interval *= 2;
                }
            }
        }
    }
}
