//! Session keepalive: periodic PING with RTT sampling and failure counting.
//!
//! Runs only on sessions this side dialed, so each session has exactly one
//! keepalive driver and no redundant probes cross on the wire.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::protocol::{wire_timestamp, PeerMessage, WIRE_TTL};
use super::session::PeerSession;

/// Number of RTT samples kept for the running mean.
const RTT_WINDOW: usize = 10;

pub struct KeepAlive {
    /// PINGs sent but not yet answered, keyed by `msg_id`.
    pending: Mutex<HashMap<String, Instant>>,
    /// Most recent RTT samples in milliseconds.
    rtts: Mutex<VecDeque<f64>>,
    /// Consecutive unanswered PINGs.
    failures: AtomicU32,
    cancel: CancellationToken,
}

impl KeepAlive {
    fn new(cancel: CancellationToken) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            rtts: Mutex::new(VecDeque::with_capacity(RTT_WINDOW)),
            failures: AtomicU32::new(0),
            cancel,
        }
    }

    /// Start the ping loop for `session` and return its handle.
    ///
    /// The token is a child of the session's, so closing the session always
    /// stops the loop even without an explicit [`KeepAlive::stop`].
    pub fn spawn(session: &Arc<PeerSession>) -> Arc<KeepAlive> {
        let keepalive = Arc::new(KeepAlive::new(session.close_token().child_token()));
        let worker = keepalive.clone();
        let session = session.clone();
        tokio::spawn(async move {
            worker.run(session).await;
        });
        keepalive
    }

    async fn run(self: Arc<Self>, session: Arc<PeerSession>) {
        let config = &session.shared().config.keepalive;
        let interval = Duration::from_secs(config.ping_interval);
        let max_failures = config.max_ping_failures.max(1);
        let peer = session.remote_id().clone();

        log::debug!("keepalive started for {}", peer);

        while !self.cancel.is_cancelled() {
            let msg_id = Uuid::new_v4().to_string();
            self.pending.lock().insert(msg_id.clone(), Instant::now());

            let ping = PeerMessage::Ping {
                msg_id: msg_id.clone(),
                timestamp: wire_timestamp(),
                ttl: WIRE_TTL,
            };
            if !session.enqueue(ping).await {
                break;
            }
            log::debug!("PING sent to {}", peer);

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep(interval) => {}
            }

            // Still pending after a full interval means the PING went
            // unanswered; drop the stale entry so the map stays bounded.
            if self.pending.lock().remove(&msg_id).is_some() {
                let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
                log::warn!(
                    "PING to {} unanswered ({}/{} consecutive failures)",
                    peer,
                    failures,
                    max_failures
                );

                if failures >= max_failures {
                    log::error!("keepalive failure threshold reached for {}, closing", peer);
                    session.begin_close();
                    break;
                }
            }
        }

        log::debug!("keepalive stopped for {}", peer);
    }

    /// Account an incoming PONG against its pending PING.
    pub fn handle_pong(&self, msg_id: &str) {
        let sent_at = self.pending.lock().remove(msg_id);
        match sent_at {
            Some(at) => {
                let rtt_ms = at.elapsed().as_secs_f64() * 1000.0;
                self.failures.store(0, Ordering::SeqCst);

                let mut rtts = self.rtts.lock();
                rtts.push_back(rtt_ms);
                if rtts.len() > RTT_WINDOW {
                    rtts.pop_front();
                }
                log::debug!("PONG received, RTT {:.2} ms", rtt_ms);
            }
            None => log::info!("PONG with unknown msg_id {}", msg_id),
        }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Mean RTT over the sample window, in milliseconds.
    pub fn mean_rtt(&self) -> Option<f64> {
        let rtts = self.rtts.lock();
        if rtts.is_empty() {
            return None;
        }
        Some(rtts.iter().sum::<f64>() / rtts.len() as f64)
    }

    pub fn sample_count(&self) -> usize {
        self.rtts.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pong_for_unknown_msg_id_is_ignored() {
        let keepalive = KeepAlive::new(CancellationToken::new());
        keepalive.handle_pong("nope");
        assert_eq!(keepalive.sample_count(), 0);
        assert_eq!(keepalive.mean_rtt(), None);
    }

    #[test]
    fn pong_clears_pending_and_records_rtt() {
        let keepalive = KeepAlive::new(CancellationToken::new());
        keepalive.failures.store(2, Ordering::SeqCst);
        keepalive
            .pending
            .lock()
            .insert("m1".into(), Instant::now());

        keepalive.handle_pong("m1");

        assert!(keepalive.pending.lock().is_empty());
        assert_eq!(keepalive.failures.load(Ordering::SeqCst), 0);
        assert_eq!(keepalive.sample_count(), 1);
        assert!(keepalive.mean_rtt().unwrap() >= 0.0);
    }

    #[test]
    fn rtt_window_is_bounded() {
        let keepalive = KeepAlive::new(CancellationToken::new());
        for i in 0..RTT_WINDOW + 5 {
            let id = format!("m{}", i);
            keepalive.pending.lock().insert(id.clone(), Instant::now());
            keepalive.handle_pong(&id);
        }
        assert_eq!(keepalive.sample_count(), RTT_WINDOW);
    }
}
