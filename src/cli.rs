//! Interactive command shell.
//!
//! Thin front-end over the shared state, the router, the rendezvous client,
//! and the overlay controller. Outcome lines are printed; detail goes to
//! the log at the runtime-selectable level.

use std::io::Write as _;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use log::LevelFilter;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::app_log;
use crate::overlay::protocol::PeerIdentity;
use crate::overlay::OverlayController;
use crate::rendezvous::RendezvousClient;
use crate::router::SendOutcome;
use crate::state::SharedState;

pub struct Cli {
    state: Arc<SharedState>,
    controller: Arc<OverlayController>,
    rendezvous: Arc<RendezvousClient>,
}

impl Cli {
    pub fn new(
        state: Arc<SharedState>,
        controller: Arc<OverlayController>,
        rendezvous: Arc<RendezvousClient>,
    ) -> Self {
        Self {
            state,
            controller,
            rendezvous,
        }
    }

    /// Read-eval loop until `quit`, EOF, or shutdown.
    pub async fn run(&self) -> Result<()> {
        println!(
            "peerchat — connected as {} (type 'help' for commands)",
            self.state.peer_label()
        );

        let stdin = BufReader::new(tokio::io::stdin());
        let mut lines = stdin.lines();
        let shutdown = self.state.shutdown_token();

        loop {
            print!("> ");
            std::io::stdout().flush().ok();

            tokio::select! {
                _ = shutdown.cancelled() => break,
                line = lines.next_line() => {
                    let Some(line) = line? else { break };
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    if !self.handle(line).await {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Execute one command line; returns false when the shell should exit.
    async fn handle(&self, line: &str) -> bool {
        let (command, rest) = match line.split_once(char::is_whitespace) {
            Some((command, rest)) => (command, rest.trim()),
            None => (line, ""),
        };

        match command.to_ascii_lowercase().as_str() {
            "peers" => self.cmd_peers(rest).await,
            "msg" => self.cmd_msg(rest).await,
            "pub" => self.cmd_pub(rest).await,
            "conn" => self.cmd_conn(),
            "status" => self.cmd_status(),
            "rtt" => self.cmd_rtt(),
            "reconnect" => {
                let started = self.controller.clone().reconnect().await;
                println!("reconnect: {} dial(s) initiated", started);
            }
            "log" => self.cmd_log(rest),
            "help" => print_help(),
            "quit" => {
                println!("shutting down …");
                return false;
            }
            other => println!("unknown command '{}' — try 'help'", other),
        }
        true
    }

    async fn cmd_peers(&self, rest: &str) {
        let namespace = (!rest.is_empty()).then_some(rest);
        match self.rendezvous.discover(namespace).await {
            Ok(peers) if peers.is_empty() => println!("no peers found"),
            Ok(peers) => {
                for peer in peers {
                    let label = format!("{}@{}", peer.name, peer.namespace);
                    let connected = peer
                        .identity()
                        .map(|id| self.state.has_session(&id))
                        .unwrap_or(false);
                    println!(
                        "  {} at {}:{}{}",
                        label,
                        peer.ip,
                        peer.port,
                        if connected { "  [connected]" } else { "" }
                    );
                }
            }
            Err(e) => {
                println!("discover failed");
                log::error!("discover failed: {}", e);
            }
        }
    }

    async fn cmd_msg(&self, rest: &str) {
        let Some((dst, text)) = rest.split_once(char::is_whitespace) else {
            println!("usage: msg <name@namespace> <text>");
            return;
        };
        let Ok(dst) = dst.parse::<PeerIdentity>() else {
            println!("'{}' is not a valid peer id (expected name@namespace)", dst);
            return;
        };

        match self
            .state
            .router()
            .send(&dst, text.trim(), true, None, None)
            .await
        {
            SendOutcome::Delivered(_) => println!("delivered to {}", dst),
            SendOutcome::NotConnected => println!("{} is offline", dst),
            SendOutcome::TimedOut => println!("timed out waiting for {} to acknowledge", dst),
        }
    }

    async fn cmd_pub(&self, rest: &str) {
        let Some((dst, text)) = rest.split_once(char::is_whitespace) else {
            println!("usage: pub <*|#namespace> <text>");
            return;
        };
        if !valid_publish_target(dst) {
            println!("publish target must be '*' or '#namespace'");
            return;
        }

        let count = self.state.router().publish(dst, text.trim()).await;
        println!("published to {} peer(s)", count);
    }

    fn cmd_conn(&self) {
        let sessions = self.state.sessions();
        if sessions.is_empty() {
            println!("no active sessions");
            return;
        }
        for session in sessions {
            println!(
                "  {} at {} — {} ({})",
                session.remote_id(),
                session.remote_addr(),
                if session.is_initiator() {
                    "outbound"
                } else {
                    "inbound"
                },
                session.status().label(),
            );
        }
    }

    fn cmd_status(&self) {
        println!("  peer:      {}", self.state.peer_label());
        println!("  port:      {}", self.state.listen_port());
        match self.state.registration() {
            (Some(ttl), Some(_)) => {
                let remaining = self.state.ttl_remaining().unwrap_or(0);
                println!("  directory: registered, TTL {}s ({}s left)", ttl, remaining);
            }
            _ => println!("  directory: not registered"),
        }
        println!("  sessions:  {}", self.state.session_count());
        println!("  backoffs:  {} peer(s)", self.controller.failure_count());
    }

    fn cmd_rtt(&self) {
        let sessions = self.state.sessions();
        if sessions.is_empty() {
            println!("no active sessions");
            return;
        }
        for session in sessions {
            match session.keepalive_stats() {
                Some((Some(mean), samples)) => {
                    println!(
                        "  {}: {:.1} ms over {} sample(s)",
                        session.remote_id(),
                        mean,
                        samples
                    );
                }
                Some((None, _)) => println!("  {}: no samples yet", session.remote_id()),
                None => println!("  {}: inbound session, peer probes", session.remote_id()),
            }
        }
    }

    fn cmd_log(&self, rest: &str) {
        match LevelFilter::from_str(rest) {
            Ok(level) => {
                app_log::set_level(level);
                println!("log level set to {}", level);
            }
            Err(_) => println!("usage: log <OFF|ERROR|WARN|INFO|DEBUG|TRACE>"),
        }
    }
}

/// Publish destinations accepted at the CLI boundary.
fn valid_publish_target(dst: &str) -> bool {
    dst == "*" || dst.strip_prefix('#').is_some_and(|ns| !ns.is_empty())
}

fn print_help() {
    println!("commands:");
    println!("  peers [ns]          list peers known to the directory");
    println!("  msg <peer> <text>   send a message and wait for the ACK");
    println!("  pub <*|#ns> <text>  fan a message out, no ACK");
    println!("  conn                list active sessions");
    println!("  status              local peer and directory status");
    println!("  rtt                 keepalive round-trip times");
    println!("  reconnect           clear backoffs and re-run discovery now");
    println!("  log <LEVEL>         set log verbosity");
    println!("  help                this text");
    println!("  quit                say BYE to everyone and exit");
}
