//! busio.rs — line-bus client plumbing
//!
//! Connects to the linebusd socket, registers a diagnostic name and the
//! subscription filters, and splits the stream into a line reader plus
//! a queued writer task. The controllers stay synchronous: they push
//! outbound lines into the queue and consume inbound lines one at a
//! time from the main loop.

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedReadHalf;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::debug;

pub struct BusClient {
    pub lines: tokio::io::Lines<BufReader<OwnedReadHalf>>,
    pub tx: mpsc::UnboundedSender<String>,
}

impl BusClient {
    /// Connect and announce ourselves: `$name <name>` plus one
    /// `$subscribe` per filter.
    pub async fn connect(
        socket: &str,
        name: &str,
        subscriptions: &[String],
    ) -> anyhow::Result<BusClient> {
        let stream = UnixStream::connect(socket)
            .await
            .with_context(|| format!("connect {socket}"))?;
        let (read, mut write) = stream.into_split();

        let mut preamble = format!("$name {name}\n");
        for sub in subscriptions {
            preamble.push_str(&format!("$subscribe {sub}\n"));
        }
        write.write_all(preamble.as_bytes()).await?;

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(mut line) = rx.recv().await {
                if !line.ends_with('\n') {
                    line.push('\n');
                }
                if write.write_all(line.as_bytes()).await.is_err() {
                    debug!("bus write failed, stopping writer");
                    break;
                }
            }
        });

        Ok(BusClient {
            lines: BufReader::new(read).lines(),
            tx,
        })
    }

    /// Next line from the bus; `Err` when the bus goes away.
    pub async fn next_line(&mut self) -> anyhow::Result<String> {
        self.lines
            .next_line()
            .await
            .context("reading bus")?
            .context("bus closed")
    }

    pub fn send(&self, line: String) {
        let _ = self.tx.send(line);
    }
}
