//! plug — netcat for the line bus
//!
//! Bridges stdin/stdout to a linebusd socket so shell pipelines and
//! humans can tap or feed the bus:
//!
//! ```text
//! plug /var/run/lbus                      # interactive tap
//! plug -o -f 'ruddersts:' /var/run/lbus   # follow status lines only
//! echo 'rudderctl: ...' | plug -i /var/run/lbus
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

#[derive(Parser, Debug)]
#[command(name = "plug", about = "Connect stdin/stdout to a line bus socket")]
struct Args {
    /// Path of the bus socket
    socket: PathBuf,
    /// Input only: forward stdin to the bus, ignore bus output
    #[arg(short = 'i')]
    input_only: bool,
    /// Output only: print bus traffic, ignore stdin
    #[arg(short = 'o')]
    output_only: bool,
    /// Subscription prefix (may be repeated)
    #[arg(short = 'f')]
    filters: Vec<String>,
    /// Diagnostic name to register with the bus
    #[arg(short = 'n')]
    name: Option<String>,
    /// Mark this client precious: the bus dies when we exit
    #[arg(short = 'p')]
    precious: bool,
    /// Alternate command character used by the bus
    #[arg(short = 'c', default_value = "$")]
    cmdchar: char,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let stream = UnixStream::connect(&args.socket)
        .await
        .with_context(|| format!("connect {}", args.socket.display()))?;
    let (read, mut write) = stream.into_split();

    let c = args.cmdchar;
    let mut preamble = String::new();
    if let Some(name) = &args.name {
        preamble.push_str(&format!("{c}name {name}\n"));
    }
    for f in &args.filters {
        preamble.push_str(&format!("{c}subscribe {f}\n"));
    }
    if args.precious {
        preamble.push_str(&format!("{c}precious\n"));
    }
    if args.input_only {
        preamble.push_str(&format!("{c}xoff\n"));
    }
    write.write_all(preamble.as_bytes()).await?;

    let mut bus_lines = BufReader::new(read).lines();
    let mut stdin_lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        tokio::select! {
            line = bus_lines.next_line() => match line? {
                Some(mut l) if !args.input_only => {
                    l.push('\n');
                    stdout.write_all(l.as_bytes()).await?;
                    stdout.flush().await?;
                }
                Some(_) => {}
                None => break, // bus went away
            },
            line = stdin_lines.next_line(), if !args.output_only => match line? {
                Some(mut l) => {
                    l.push('\n');
                    write.write_all(l.as_bytes()).await?;
                }
                None => break, // end of input
            },
        }
    }
    Ok(())
}
