//! Message router: unicast with ACK correlation, publish fan-out, and
//! delivery to subscribers.
//!
//! One instance per process, owned by [`SharedState`]. The router never
//! stores sessions; every fan-out takes a fresh registry snapshot, so the
//! Session ↔ Router ↔ SharedState cycle stays broken.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

use crate::overlay::protocol::{wire_timestamp, PeerIdentity, PeerMessage, WIRE_TTL};
use crate::overlay::session::PeerSession;
use crate::state::SharedState;

// ────────────────────────────────────────────────────────────────────────────
// Delivery to subscribers
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryKind {
    /// Arrived as a SEND addressed to us.
    Direct,
    /// Arrived as a PUB fan-out.
    Publish,
}

/// Metadata handed to subscribers along with the payload.
///
/// `msg_id` is surfaced so applications that care about duplicates under
/// retry can use it as a dedup key.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub kind: DeliveryKind,
    pub msg_id: String,
}

/// Receive callback: `(source peer id, payload, metadata)`.
///
/// A failing subscriber is logged and must never poison dispatch to the
/// others, so callbacks report errors instead of panicking.
pub type Subscriber = Arc<dyn Fn(&str, &str, &Delivery) -> anyhow::Result<()> + Send + Sync>;

// ────────────────────────────────────────────────────────────────────────────
// Send outcome
// ────────────────────────────────────────────────────────────────────────────

/// Tagged outcome of [`MessageRouter::send`]; an undelivered message is a
/// normal result, not an error.
#[derive(Debug)]
pub enum SendOutcome {
    /// The message was handed to the session; with `require_ack` the peer's
    /// ACK is attached.
    Delivered(Option<PeerMessage>),
    /// No session for the destination; nothing was sent and no retry ran.
    NotConnected,
    /// No ACK arrived within the timeout on any attempt.
    TimedOut,
}

// ────────────────────────────────────────────────────────────────────────────
// Router
// ────────────────────────────────────────────────────────────────────────────

pub struct MessageRouter {
    state: Weak<SharedState>,
    /// ACKs being waited on, keyed by the SEND's `msg_id`. The one-shot
    /// sender is the waiter's completion signal; dropping it unblocks the
    /// waiter with a negative outcome.
    pending_acks: Mutex<HashMap<String, oneshot::Sender<PeerMessage>>>,
    subscribers: RwLock<Vec<Subscriber>>,
}

impl MessageRouter {
    pub fn new(state: Weak<SharedState>) -> Self {
        Self {
            state,
            pending_acks: Mutex::new(HashMap::new()),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Register a receive callback for incoming SEND/PUB payloads.
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&str, &str, &Delivery) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribers.write().push(Arc::new(callback));
    }

    /// Unicast `payload` to `dst`.
    ///
    /// With `require_ack` the call blocks until the peer's ACK arrives, the
    /// per-attempt timeout expires on the final attempt, or shutdown
    /// unblocks it. Retries re-send the same `msg_id` after an exponential
    /// `2^(attempt-1)` s pause. `timeout`/`retries` default to the
    /// configured `network.ack_timeout` and `message_router.max_retries`.
    pub async fn send(
        &self,
        dst: &PeerIdentity,
        payload: &str,
        require_ack: bool,
        ack_timeout: Option<Duration>,
        retries: Option<u32>,
    ) -> SendOutcome {
        let Some(state) = self.state.upgrade() else {
            return SendOutcome::NotConnected;
        };
        let ack_timeout =
            ack_timeout.unwrap_or_else(|| Duration::from_secs(state.config.network.ack_timeout));
        let retries = retries.unwrap_or(state.config.message_router.max_retries);

        let Some(session) = state.session(dst) else {
            log::warn!("no session with {}", dst);
            return SendOutcome::NotConnected;
        };

        let msg_id = Uuid::new_v4().to_string();
        let msg = PeerMessage::Send {
            msg_id: msg_id.clone(),
            src: state.peer_label(),
            dst: dst.to_string(),
            payload: payload.to_owned(),
            require_ack,
            ttl: WIRE_TTL,
        };

        if !require_ack {
            return if session.enqueue(msg).await {
                SendOutcome::Delivered(None)
            } else {
                SendOutcome::NotConnected
            };
        }

        let (ack_tx, mut ack_rx) = oneshot::channel();
        self.pending_acks.lock().insert(msg_id.clone(), ack_tx);

        let mut attempt: u32 = 0;
        let outcome = loop {
            log::debug!("SEND {} to {} (attempt {})", msg_id, dst, attempt + 1);
            if !session.enqueue(msg.clone()).await {
                break SendOutcome::NotConnected;
            }

            match timeout(ack_timeout, &mut ack_rx).await {
                Ok(Ok(ack)) => {
                    log::debug!("ACK received for {}", msg_id);
                    break SendOutcome::Delivered(Some(ack));
                }
                // Sender dropped: the router shut down underneath us.
                Ok(Err(_)) => break SendOutcome::TimedOut,
                Err(_) => {
                    attempt += 1;
                    if attempt > retries {
                        log::warn!(
                            "no ACK for {} after {} attempt(s)",
                            msg_id,
                            retries + 1
                        );
                        break SendOutcome::TimedOut;
                    }
                    let backoff = Duration::from_secs(1u64 << (attempt - 1).min(16));
                    log::info!("ACK timeout for {}, retrying in {:?}", msg_id, backoff);
                    sleep(backoff).await;
                }
            }
        };

        self.pending_acks.lock().remove(&msg_id);
        outcome
    }

    /// Fan `payload` out as PUB to every currently open session matching
    /// `dst` (`*` for all, `#ns` for one namespace). Returns how many
    /// sessions the message was enqueued to; no ACK, no retry.
    pub async fn publish(&self, dst: &str, payload: &str) -> usize {
        let Some(state) = self.state.upgrade() else {
            return 0;
        };

        let namespace = match dst {
            "*" => None,
            _ => match dst.strip_prefix('#') {
                Some(ns) if !ns.is_empty() => Some(ns.to_owned()),
                _ => {
                    log::warn!("PUB target must be '*' or '#namespace', got {:?}", dst);
                    return 0;
                }
            },
        };

        let mut count = 0;
        for session in state.sessions() {
            if let Some(ns) = &namespace {
                if session.remote_id().namespace() != ns {
                    continue;
                }
            }

            let msg = PeerMessage::Pub {
                msg_id: Uuid::new_v4().to_string(),
                src: state.peer_label(),
                dst: dst.to_owned(),
                payload: payload.to_owned(),
                ttl: WIRE_TTL,
            };
            if session.enqueue(msg).await {
                log::debug!("PUB enqueued for {}", session.remote_id());
                count += 1;
            }
        }

        if count == 0 {
            log::warn!("PUB {}: no matching peer connected", dst);
        } else {
            log::info!("PUB {}: enqueued to {} peer(s)", dst, count);
        }
        count
    }

    /// Entry point for every SEND/ACK/PUB a session receives.
    pub async fn process_incoming(&self, msg: PeerMessage, session: &PeerSession) {
        match msg {
            msg @ PeerMessage::Ack { .. } => self.handle_ack(msg),
            PeerMessage::Send {
                msg_id,
                src,
                payload,
                require_ack,
                ..
            } => {
                self.deliver(
                    &src,
                    &payload,
                    Delivery {
                        kind: DeliveryKind::Direct,
                        msg_id: msg_id.clone(),
                    },
                );

                if require_ack {
                    let Some(state) = self.state.upgrade() else {
                        return;
                    };
                    let ack = PeerMessage::Ack {
                        msg_id,
                        timestamp: wire_timestamp(),
                        src: state.peer_label(),
                        dst: src,
                        ttl: WIRE_TTL,
                    };
                    if !session.enqueue(ack).await {
                        log::warn!("could not queue ACK for {}", session.remote_id());
                    }
                }
            }
            PeerMessage::Pub {
                msg_id,
                src,
                payload,
                ..
            } => {
                self.deliver(
                    &src,
                    &payload,
                    Delivery {
                        kind: DeliveryKind::Publish,
                        msg_id,
                    },
                );
            }
            other => {
                log::debug!("router ignoring {} message", other.kind());
            }
        }
    }

    /// Match an incoming ACK against its waiting `send`.
    fn handle_ack(&self, msg: PeerMessage) {
        let PeerMessage::Ack { ref msg_id, .. } = msg else {
            return;
        };
        let waiter = self.pending_acks.lock().remove(msg_id);
        match waiter {
            // The waiter may have timed out a moment ago; a dead one-shot
            // receiver is not an error.
            Some(ack_tx) => {
                let _ = ack_tx.send(msg);
            }
            None => log::debug!("ACK for unknown msg_id {}, dropping", msg_id),
        }
    }

    /// Run every subscriber against one payload; a failing subscriber is
    /// logged and the rest still run.
    fn deliver(&self, src: &str, payload: &str, delivery: Delivery) {
        let subscribers: Vec<Subscriber> = self.subscribers.read().clone();
        for subscriber in subscribers {
            if let Err(e) = subscriber(src, payload, &delivery) {
                log::error!("receive subscriber failed: {:#}", e);
            }
        }
    }

    /// Unblock every waiting `send` with a negative outcome and clear the
    /// table. Called once during orderly shutdown.
    pub fn shutdown(&self) {
        let drained: Vec<_> = {
            let mut pending = self.pending_acks.lock();
            pending.drain().collect()
        };
        if !drained.is_empty() {
            log::debug!("unblocking {} pending send(s)", drained.len());
        }
        // Dropping the one-shot senders wakes the waiters.
        drop(drained);
    }
}
