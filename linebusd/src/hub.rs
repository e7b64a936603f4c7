//! hub.rs — the broadcast state machine
//!
//! The hub owns every connected client and runs entirely on the main
//! task: connection tasks feed it one event per line, it fans lines out
//! through each client's bounded outbound queue. A full queue means the
//! peer is slow and the line is dropped — publishers are never blocked.
//!
//! Delivery policy per line:
//! 1. empty lines are dropped
//! 2. a line starting with the command character is a control command
//!    against the issuing client
//! 3. anything else goes to every other client with no filters, or with
//!    at least one matching prefix filter; xoff'ed clients are skipped
//! 4. after processing, the publishing client is rotated to the tail so
//!    a chatty client cannot starve the rest
//!
//! Losing a precious client (disconnect, or hung past the drop budget)
//! is fatal for the whole bus; the supervisor restarts everything.

use std::collections::VecDeque;

use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::filter::FilterTable;

/// Outbound queue depth per client; beyond this the client is dropping.
pub const CLIENT_QUEUE: usize = 64;
/// A precious client that drops more than this many lines is hung.
const HUNG_DROPS: u64 = 100;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("lost precious client {0}")]
    PreciousLost(String),
}

struct Client {
    name: Option<String>,
    tx: Option<mpsc::Sender<String>>,
    xoff: bool,
    precious: bool,
    dropped: u64,
    filters: Vec<usize>,
}

impl Client {
    fn display_name(&self, id: usize) -> String {
        match &self.name {
            Some(n) => n.clone(),
            None => format!("<anon:{id}>"),
        }
    }
}

pub struct Hub {
    cmdchar: char,
    clients: Vec<Option<Client>>,
    /// Broadcast order; the most recent publisher lives at the tail.
    order: VecDeque<usize>,
    filters: FilterTable,
}

impl Hub {
    pub fn new(cmdchar: char) -> Self {
        Hub {
            cmdchar,
            clients: Vec::new(),
            order: VecDeque::new(),
            filters: FilterTable::new(),
        }
    }

    /// Register a connection; `tx` is its outbound line queue.
    pub fn add_client(&mut self, tx: mpsc::Sender<String>) -> usize {
        let client = Client {
            name: None,
            tx: Some(tx),
            xoff: false,
            precious: false,
            dropped: 0,
            filters: Vec::new(),
        };
        let id = if let Some(id) = self.clients.iter().position(Option::is_none) {
            self.clients[id] = Some(client);
            id
        } else {
            self.clients.push(Some(client));
            self.clients.len() - 1
        };
        self.order.push_back(id);
        info!("new client {id}");
        id
    }

    /// The connection task saw EOF or a write error.
    pub fn client_closed(&mut self, id: usize) -> Result<(), HubError> {
        if let Some(c) = self.clients.get_mut(id).and_then(Option::as_mut) {
            c.tx = None;
        }
        self.reap()
    }

    /// Process one received line from client `id`.
    pub fn handle_line(&mut self, id: usize, line: &str) -> Result<(), HubError> {
        let line = line.trim_end_matches(['\n', '\r']);
        if self.clients.get(id).and_then(Option::as_ref).is_none() {
            return Ok(());
        }
        if !line.is_empty() {
            let mut chars = line.chars();
            if chars.next() == Some(self.cmdchar) {
                self.handle_cmd(id, chars.as_str());
            } else {
                self.broadcast(id, line);
            }
        }
        self.rotate_to_tail(id);
        self.reap()
    }

    fn handle_cmd(&mut self, id: usize, cmd: &str) {
        let cmd = cmd.trim_end();
        let who = self.clients[id].as_ref().unwrap().display_name(id);

        if let Some(name) = cmd.strip_prefix("name ") {
            let name = name.trim();
            info!("client {who} named '{name}'");
            self.clients[id].as_mut().unwrap().name = Some(name.to_string());
        } else if let Some(prefix) = cmd.strip_prefix("subscribe ") {
            info!("client {who} subscribed:'{prefix}'");
            let handle = self.filters.subscribe(prefix);
            self.clients[id].as_mut().unwrap().filters.push(handle);
        } else if cmd == "xoff" {
            info!("client {who} set xoff");
            self.clients[id].as_mut().unwrap().xoff = true;
        } else if cmd == "xon" {
            info!("client {who} set xon");
            self.clients[id].as_mut().unwrap().xoff = false;
        } else if cmd == "precious" {
            info!("client {who} set precious");
            self.clients[id].as_mut().unwrap().precious = true;
        } else if cmd == "stats" {
            self.send_stats(id);
        } else if let Some(name) = cmd.strip_prefix("kill ") {
            let name = name.trim();
            info!("client {who} killing '{name}'");
            for c in self.clients.iter_mut().flatten() {
                if c.name.as_deref() == Some(name) {
                    c.tx = None;
                }
            }
        } else {
            debug!("client {who}: unknown command '{cmd}'");
        }
    }

    fn send_stats(&mut self, requester: usize) {
        let mut lines = Vec::new();
        for (id, c) in self.clients.iter().enumerate() {
            let Some(c) = c else { continue };
            lines.push(
                json!({
                    "client": c.display_name(id),
                    "id": id,
                    "dropped": c.dropped,
                    "xoff": c.xoff,
                    "precious": c.precious,
                    "filters": c
                        .filters
                        .iter()
                        .filter_map(|&h| self.filters.prefix(h))
                        .collect::<Vec<_>>(),
                })
                .to_string(),
            );
        }
        for line in lines {
            self.deliver(requester, &line);
        }
    }

    fn broadcast(&mut self, publisher: usize, line: &str) {
        self.filters.mark(line);
        let ids: Vec<usize> = self.order.iter().copied().collect();
        for id in ids {
            if id == publisher {
                continue;
            }
            let Some(c) = self.clients.get(id).and_then(Option::as_ref) else {
                continue;
            };
            if c.tx.is_none() || c.xoff {
                continue;
            }
            if !c.filters.is_empty() && !self.filters.hit(&c.filters) {
                continue;
            }
            self.deliver(id, line);
        }
    }

    /// Queue a line to one client, applying the drop policy.
    fn deliver(&mut self, id: usize, line: &str) {
        let c = self.clients[id].as_mut().unwrap();
        let Some(tx) = c.tx.clone() else { return };
        match tx.try_send(line.to_string()) {
            Ok(()) => {
                // halve the dropped count so a recovering client can
                // slowly work its way back into good standing
                c.dropped >>= 1;
            }
            Err(_) => {
                c.dropped += 1;
                if c.dropped % 10 == 0 {
                    debug!("client {} dropped {} messages", c.display_name(id), c.dropped);
                }
                if c.precious && c.dropped > HUNG_DROPS {
                    warn!("assuming client {} is hung", c.display_name(id));
                    c.tx = None;
                }
            }
        }
    }

    fn rotate_to_tail(&mut self, id: usize) {
        if let Some(pos) = self.order.iter().position(|&x| x == id) {
            self.order.remove(pos);
            self.order.push_back(id);
        }
    }

    /// Free closed clients; losing a precious one takes the bus down.
    fn reap(&mut self) -> Result<(), HubError> {
        let mut fatal = None;
        for id in 0..self.clients.len() {
            let closed = self.clients[id].as_ref().is_some_and(|c| c.tx.is_none());
            if !closed {
                continue;
            }
            let c = self.clients[id].take().unwrap();
            let name = c.display_name(id);
            for handle in &c.filters {
                self.filters.release(*handle);
            }
            self.order.retain(|&x| x != id);
            if c.precious {
                warn!("closed precious client {name}, shutting down");
                fatal.get_or_insert(HubError::PreciousLost(name));
            } else {
                info!("closed client {name}");
            }
        }
        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(hub: &mut Hub) -> (usize, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE);
        (hub.add_client(tx), rx)
    }

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(l) = rx.try_recv() {
            out.push(l);
        }
        out
    }

    #[test]
    fn fanout_respects_filters() {
        let mut hub = Hub::new('$');
        let (a, mut arx) = client(&mut hub);
        let (b, mut brx) = client(&mut hub);
        let (_c, mut crx) = client(&mut hub);

        hub.handle_line(b, "$subscribe foo").unwrap();
        hub.handle_line(a, "foo: bar").unwrap();
        assert_eq!(drain(&mut brx), vec!["foo: bar"]);
        assert_eq!(drain(&mut crx), vec!["foo: bar"]); // no filters: gets all
        assert!(drain(&mut arx).is_empty()); // publisher excluded

        hub.handle_line(a, "baz").unwrap();
        assert!(drain(&mut brx).is_empty()); // filtered out
        assert_eq!(drain(&mut crx), vec!["baz"]);
    }

    #[test]
    fn serial_subscription_scenario() {
        let mut hub = Hub::new('$');
        let (a, _arx) = client(&mut hub);
        let (b, mut brx) = client(&mut hub);
        hub.handle_line(b, "$subscribe 0x9011145").unwrap();

        hub.handle_line(a, "0x9011145:0x6041[0] = 0x237").unwrap();
        hub.handle_line(a, "0x9010537:0x6041[0] = 0x237").unwrap();
        assert_eq!(drain(&mut brx), vec!["0x9011145:0x6041[0] = 0x237"]);
    }

    #[test]
    fn empty_lines_are_dropped() {
        let mut hub = Hub::new('$');
        let (a, _arx) = client(&mut hub);
        let (_b, mut brx) = client(&mut hub);
        hub.handle_line(a, "").unwrap();
        hub.handle_line(a, "\n").unwrap();
        assert!(drain(&mut brx).is_empty());
    }

    #[test]
    fn xoff_xon_gate_delivery() {
        let mut hub = Hub::new('$');
        let (a, _arx) = client(&mut hub);
        let (b, mut brx) = client(&mut hub);
        hub.handle_line(b, "$xoff").unwrap();
        hub.handle_line(a, "one").unwrap();
        assert!(drain(&mut brx).is_empty());
        hub.handle_line(b, "$xon").unwrap();
        hub.handle_line(a, "two").unwrap();
        assert_eq!(drain(&mut brx), vec!["two"]);
    }

    #[test]
    fn precious_disconnect_is_fatal() {
        let mut hub = Hub::new('$');
        let (a, _arx) = client(&mut hub);
        hub.handle_line(a, "$name helm").unwrap();
        hub.handle_line(a, "$precious").unwrap();
        match hub.client_closed(a) {
            Err(HubError::PreciousLost(name)) => assert_eq!(name, "helm"),
            other => panic!("expected fatal, got {other:?}"),
        }
    }

    #[test]
    fn ordinary_disconnect_is_not_fatal() {
        let mut hub = Hub::new('$');
        let (a, _arx) = client(&mut hub);
        assert!(hub.client_closed(a).is_ok());
    }

    #[test]
    fn hung_precious_client_is_fatal_after_drop_budget() {
        let mut hub = Hub::new('$');
        let (a, _arx) = client(&mut hub);
        let (b, brx) = client(&mut hub);
        hub.handle_line(b, "$precious").unwrap();
        // b never drains its queue
        std::mem::forget(brx);
        let mut fatal = false;
        for i in 0..(CLIENT_QUEUE as u64 + HUNG_DROPS + 8) {
            if hub.handle_line(a, &format!("line {i}")).is_err() {
                fatal = true;
                break;
            }
        }
        assert!(fatal);
    }

    #[test]
    fn kill_by_name_closes_all_bearers() {
        let mut hub = Hub::new('$');
        let (a, _arx) = client(&mut hub);
        let (b, _brx) = client(&mut hub);
        let (_c, mut crx) = client(&mut hub);
        hub.handle_line(b, "$name victim").unwrap();
        hub.handle_line(a, "$kill victim").unwrap();
        hub.handle_line(a, "hello").unwrap();
        // only the survivor sees traffic
        assert_eq!(drain(&mut crx), vec!["hello"]);
        hub.handle_line(b, "ignored after close").unwrap();
    }

    #[test]
    fn stats_reports_to_requester_only() {
        let mut hub = Hub::new('$');
        let (a, mut arx) = client(&mut hub);
        let (b, mut brx) = client(&mut hub);
        hub.handle_line(b, "$name probe").unwrap();
        hub.handle_line(a, "$stats").unwrap();
        let got = drain(&mut arx);
        assert_eq!(got.len(), 2);
        assert!(got.iter().any(|l| l.contains("\"probe\"")));
        assert!(drain(&mut brx).is_empty());
    }

    #[test]
    fn alternate_command_character() {
        let mut hub = Hub::new('!');
        let (a, _arx) = client(&mut hub);
        let (_b, mut brx) = client(&mut hub);
        hub.handle_line(a, "!xoff").unwrap(); // command, not traffic
        assert!(drain(&mut brx).is_empty());
        hub.handle_line(a, "$xoff").unwrap(); // ordinary line now
        assert_eq!(drain(&mut brx), vec!["$xoff"]);
    }
}
