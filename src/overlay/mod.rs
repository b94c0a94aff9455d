//! Overlay maintenance: discovery, dialing, and directory liveness.
//!
//! The controller ties the rendezvous client, the peer server, and the
//! session layer together:
//!
//! ```text
//!  ┌──────────────────────────────────────────────────────────────┐
//!  │                     OverlayController                        │
//!  │                                                              │
//!  │  ┌──────────────┐  ┌───────────────┐  ┌───────────────────┐ │
//!  │  │ discovery +  │  │ re-register   │  │  peer server      │ │
//!  │  │  dial loop   │  │    loop       │  │ (accepts inbound) │ │
//!  │  └──────┬───────┘  └───────────────┘  └─────────┬─────────┘ │
//!  │         │ dial tasks (≤ MAX_CONCURRENT_DIALS)   │           │
//!  │         ▼                                       ▼           │
//!  │            PeerSession (reader + writer + keepalive)        │
//!  │                     registered in SharedState               │
//!  └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Failed dials land in a per-peer failure table; a peer is not re-dialed
//! until its backoff window has passed. `reconnect` clears the table and
//! forces one immediate discovery pass.

pub mod keepalive;
pub mod protocol;
pub mod server;
pub mod session;

use std::cmp;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::rendezvous::{RemotePeerRecord, RendezvousClient};
use crate::state::SharedState;
use protocol::PeerIdentity;
use session::{PeerSession, SessionError};

// ────────────────────────────────────────────────────────────────────────────
// Tunables
// ────────────────────────────────────────────────────────────────────────────

/// Upper bound on concurrently in-flight outbound dials.
const MAX_CONCURRENT_DIALS: usize = 10;

/// Ceiling for the per-peer dial backoff.
const MAX_DIAL_BACKOFF: Duration = Duration::from_secs(30 * 60);

/// How often the re-registration loop wakes up.
const REREGISTER_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Grace period for queued BYEs to reach the wire during shutdown.
const SHUTDOWN_FLUSH: Duration = Duration::from_secs(2);

/// Cap on waiting for one session's workers to finish during shutdown.
const SHUTDOWN_JOIN_CAP: Duration = Duration::from_secs(5);

/// Backoff before the next permitted dial of a peer that has failed
/// `attempts` times in a row: 1 min doubling per failure, capped at 30 min.
fn dial_backoff(attempts: u32) -> Duration {
    let exp = attempts.saturating_sub(1).min(5);
    cmp::min(Duration::from_secs(60u64 << exp), MAX_DIAL_BACKOFF)
}

/// Re-register when the remaining TTL drops to this many seconds. Both an
/// absolute and a relative floor apply so a short TTL cannot cause a
/// re-register storm.
fn reregister_threshold(warning_threshold: u64, confirmed_ttl: u64) -> f64 {
    (warning_threshold as f64).min(0.1 * confirmed_ttl as f64)
}

/// One row of the failure table.
#[derive(Debug, Clone)]
pub struct FailureEntry {
    pub first_failure: Instant,
    pub last_failure: Instant,
    pub attempts: u32,
}

// ────────────────────────────────────────────────────────────────────────────
// Controller
// ────────────────────────────────────────────────────────────────────────────

pub struct OverlayController {
    state: Arc<SharedState>,
    rendezvous: Arc<RendezvousClient>,
    /// Dial failures per peer; consulted before every dial, cleared on a
    /// successful connect or by `reconnect`. Never held across I/O.
    failures: Mutex<HashMap<PeerIdentity, FailureEntry>>,
    dial_permits: Arc<Semaphore>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl OverlayController {
    pub fn new(state: Arc<SharedState>, rendezvous: Arc<RendezvousClient>) -> Arc<Self> {
        let cancel = state.shutdown_token().child_token();
        Arc::new(Self {
            state,
            rendezvous,
            failures: Mutex::new(HashMap::new()),
            dial_permits: Arc::new(Semaphore::new(MAX_CONCURRENT_DIALS)),
            cancel,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Bind the peer listener and spawn the periodic loops.
    pub fn start(self: Arc<Self>) -> Result<()> {
        let port = self.state.listen_port();
        let listener = server::bind_listener(port)
            .with_context(|| format!("failed to bind peer listener on port {}", port))?;

        let mut tasks = self.tasks.lock();

        tasks.push(tokio::spawn(server::run_accept_loop(
            listener,
            self.state.clone(),
            self.cancel.child_token(),
        )));

        let controller = self.clone();
        tasks.push(tokio::spawn(async move {
            controller.run_discovery_loop().await;
        }));

        let controller = self.clone();
        tasks.push(tokio::spawn(async move {
            controller.run_reregister_loop().await;
        }));

        Ok(())
    }

    // ────────────────────────────────────────────────────────────────────
    // Discovery + dial
    // ────────────────────────────────────────────────────────────────────

    async fn run_discovery_loop(self: Arc<Self>) {
        let interval = Duration::from_secs(self.state.config.rendezvous.discover_interval);
        log::debug!("discovery loop started (every {:?})", interval);

        loop {
            self.clone().discovery_pass().await;

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep(interval) => {}
            }
        }
        log::debug!("discovery loop stopped");
    }

    /// One DISCOVER round: filter candidates and spawn a dial task for each.
    /// Returns how many dials were started; they complete in the background.
    pub(crate) async fn discovery_pass(self: Arc<Self>) -> usize {
        let records = match self.rendezvous.discover(None).await {
            Ok(records) => records,
            Err(e) => {
                log::error!("periodic discover failed: {}", e);
                return 0;
            }
        };

        let local_id = self.state.local_id();
        let mut started = 0;

        for record in records {
            let remote_id = match record.identity() {
                Ok(id) => id,
                Err(e) => {
                    log::warn!("skipping discovered peer with bad identity: {}", e);
                    continue;
                }
            };

            if remote_id == local_id {
                continue;
            }
            if self.state.has_session(&remote_id) {
                continue;
            }
            if !self.dial_allowed(&remote_id) {
                log::debug!("dial to {} still backed off", remote_id);
                continue;
            }

            started += 1;
            let controller = self.clone();
            tokio::spawn(async move {
                // The semaphore caps how many dials are in flight at once;
                // the rest of the batch queues here.
                let Ok(_permit) = controller.dial_permits.clone().acquire_owned().await else {
                    return;
                };
                if !controller.cancel.is_cancelled() {
                    controller.dial_peer(remote_id, record).await;
                }
            });
        }

        if started > 0 {
            log::info!("discovery pass: dialing {} peer(s)", started);
        }
        started
    }

    fn dial_allowed(&self, id: &PeerIdentity) -> bool {
        match self.failures.lock().get(id) {
            None => true,
            Some(entry) => entry.last_failure.elapsed() >= dial_backoff(entry.attempts),
        }
    }

    /// Dial one peer with the configured immediate-retry policy; a dial that
    /// exhausts its attempts is recorded in the failure table.
    async fn dial_peer(&self, remote_id: PeerIdentity, record: RemotePeerRecord) {
        let addr = record.addr();
        let attempts = self.state.config.peer_connection.retry_attempts.max(1);
        let backoff_base = self.state.config.peer_connection.backoff_base;
        let connect_timeout = Duration::from_secs(self.state.config.network.connection_timeout);

        for attempt in 1..=attempts {
            if self.cancel.is_cancelled() {
                return;
            }
            log::debug!(
                "dialing {} at {} (attempt {}/{})",
                remote_id,
                addr,
                attempt,
                attempts
            );

            match self.dial_once(&addr, connect_timeout).await {
                Ok(session) => {
                    log::info!("connected to {} at {}", session.remote_id(), addr);
                    self.failures.lock().remove(&remote_id);
                    return;
                }
                Err(SessionError::Duplicate(id)) => {
                    // Someone (possibly the peer itself) beat us to it; a
                    // session exists, so this is not a failure.
                    log::debug!("dial to {} lost the registry race", id);
                    self.failures.lock().remove(&remote_id);
                    return;
                }
                Err(e) => {
                    log::warn!(
                        "dial to {} failed (attempt {}/{}): {}",
                        remote_id,
                        attempt,
                        attempts,
                        e
                    );
                    if attempt < attempts {
                        let pause = Duration::from_secs(backoff_base.pow(attempt - 1).max(1));
                        sleep(pause).await;
                    }
                }
            }
        }

        self.record_failure(remote_id);
    }

    async fn dial_once(
        &self,
        addr: &str,
        connect_timeout: Duration,
    ) -> Result<Arc<PeerSession>, SessionError> {
        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| SessionError::Timeout)??;
        PeerSession::initiate(stream, self.state.clone()).await
    }

    fn record_failure(&self, remote_id: PeerIdentity) {
        let mut failures = self.failures.lock();
        let now = Instant::now();
        let entry = failures
            .entry(remote_id.clone())
            .and_modify(|entry| {
                entry.attempts += 1;
                entry.last_failure = now;
            })
            .or_insert(FailureEntry {
                first_failure: now,
                last_failure: now,
                attempts: 1,
            });
        log::warn!(
            "peer {} unreachable for {}s ({} failure(s)), next dial in {:?}",
            remote_id,
            entry.first_failure.elapsed().as_secs(),
            entry.attempts,
            dial_backoff(entry.attempts)
        );
    }

    pub fn failure_count(&self) -> usize {
        self.failures.lock().len()
    }

    /// Forced reconciliation: forget every backoff and run one discovery
    /// pass right now. Returns the number of dials initiated.
    pub async fn reconnect(self: Arc<Self>) -> usize {
        self.failures.lock().clear();
        log::info!("reconnect: failure table cleared, running discovery");
        self.discovery_pass().await
    }

    // ────────────────────────────────────────────────────────────────────
    // Re-registration
    // ────────────────────────────────────────────────────────────────────

    async fn run_reregister_loop(&self) {
        let warning = self.state.config.rendezvous.ttl_warning_treshold;
        log::debug!("re-registration loop started");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep(REREGISTER_CHECK_INTERVAL) => {}
            }

            let (Some(confirmed_ttl), Some(registered_at)) = self.state.registration() else {
                continue;
            };

            let remaining = confirmed_ttl as f64 - registered_at.elapsed().as_secs_f64();
            if remaining > reregister_threshold(warning, confirmed_ttl) {
                continue;
            }

            log::info!("directory TTL expires in {:.0}s, re-registering", remaining);
            match self.rendezvous.register(&self.state).await {
                Ok(outcome) => log::info!("re-registered, new TTL {}s", outcome.ttl),
                // The loop itself is the retry mechanism here.
                Err(e) => log::error!("re-registration failed: {}", e),
            }
        }
        log::debug!("re-registration loop stopped");
    }

    // ────────────────────────────────────────────────────────────────────
    // Shutdown
    // ────────────────────────────────────────────────────────────────────

    /// Orderly shutdown: stop the loops, say BYE to every peer, close the
    /// sessions, unregister from the directory, and release router waiters.
    pub async fn shutdown(&self) {
        self.state.begin_shutdown();
        self.cancel.cancel();

        let sessions = self.state.sessions();
        if !sessions.is_empty() {
            log::info!("closing {} session(s)", sessions.len());
            for session in &sessions {
                session.send_bye("client shutting down").await;
            }
            sleep(SHUTDOWN_FLUSH).await;
            for session in &sessions {
                session.close_and_wait(SHUTDOWN_JOIN_CAP).await;
            }
        }

        if let Err(e) = self.rendezvous.unregister(&self.state).await {
            log::warn!("unregister failed (entry will expire by TTL): {}", e);
        }

        self.state.router().shutdown();

        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = timeout(Duration::from_secs(1), handle).await;
        }
        log::info!("overlay controller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::router::SendOutcome;
    use protocol::PeerMessage;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    #[test]
    fn dial_backoff_is_monotonic_and_capped() {
        assert_eq!(dial_backoff(1), Duration::from_secs(60));
        assert_eq!(dial_backoff(2), Duration::from_secs(120));
        assert_eq!(dial_backoff(5), Duration::from_secs(960));
        assert_eq!(dial_backoff(6), MAX_DIAL_BACKOFF);
        assert_eq!(dial_backoff(60), MAX_DIAL_BACKOFF);

        let mut previous = Duration::ZERO;
        for attempts in 1..12 {
            let backoff = dial_backoff(attempts);
            assert!(backoff >= previous);
            previous = backoff;
        }
    }

    #[test]
    fn reregister_threshold_applies_both_floors() {
        // Long TTL: the configured warning threshold wins.
        assert_eq!(reregister_threshold(60, 7200), 60.0);
        // Short TTL: the relative floor wins, avoiding a re-register storm.
        assert_eq!(reregister_threshold(60, 300), 30.0);
        assert_eq!(reregister_threshold(60, 10), 1.0);
    }

    // ── Two-peer integration scenarios ───────────────────────────────────

    fn peer_config(name: &str, port: u16, ping_interval: u64) -> Config {
        toml::from_str(&format!(
            r#"
                [peer]
                name = "{name}"
                namespace = "cic"
                port = {port}

                [network]
                connection_timeout = 5
                ack_timeout = 1

                [keepalive]
                ping_interval = {ping_interval}
                max_ping_failures = 3
            "#
        ))
        .unwrap()
    }

    /// Start a peer listening on an ephemeral port; returns its state and
    /// the actual port.
    async fn start_peer(name: &str, ping_interval: u64) -> (Arc<SharedState>, u16) {
        let state = SharedState::new(peer_config(name, 1, ping_interval)).unwrap();
        let listener = server::bind_listener(0).unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(server::run_accept_loop(
            listener,
            state.clone(),
            state.shutdown_token().child_token(),
        ));
        (state, port)
    }

    async fn dial(state: &Arc<SharedState>, port: u16) -> Arc<PeerSession> {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        PeerSession::initiate(stream, state.clone()).await.unwrap()
    }

    /// Poll until `predicate` holds or the deadline passes.
    async fn wait_until(deadline: Duration, mut predicate: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if predicate() {
                return true;
            }
            sleep(Duration::from_millis(25)).await;
        }
        predicate()
    }

    #[tokio::test]
    async fn connect_exchange_disconnect() {
        let (alice, _alice_port) = start_peer("alice", 30).await;
        let (bob, bob_port) = start_peer("bob", 30).await;

        let received = Arc::new(AtomicUsize::new(0));
        let observed = received.clone();
        bob.router().subscribe(move |src, payload, delivery| {
            assert_eq!(src, "alice@cic");
            assert_eq!(payload, "hi");
            assert_eq!(delivery.kind, crate::router::DeliveryKind::Direct);
            observed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let session = dial(&alice, bob_port).await;
        assert_eq!(session.remote_id().to_string(), "bob@cic");
        assert!(session.is_initiator());

        let bob_sees_alice = {
            let bob = bob.clone();
            wait_until(Duration::from_secs(2), move || {
                bob.has_session(&"alice@cic".parse().unwrap())
            })
            .await
        };
        assert!(bob_sees_alice);

        // Unicast with ACK.
        let dst: PeerIdentity = "bob@cic".parse().unwrap();
        let outcome = alice.router().send(&dst, "hi", true, None, None).await;
        match outcome {
            SendOutcome::Delivered(Some(PeerMessage::Ack { src, .. })) => {
                assert_eq!(src, "bob@cic");
            }
            other => panic!("expected delivery with ACK, got {:?}", other),
        }
        assert_eq!(received.load(Ordering::SeqCst), 1);

        // Graceful BYE: both registries empty shortly after.
        session.send_bye("test over").await;
        let both_empty = {
            let (alice, bob) = (alice.clone(), bob.clone());
            wait_until(Duration::from_secs(2), move || {
                alice.session_count() == 0 && bob.session_count() == 0
            })
            .await
        };
        assert!(both_empty);
    }

    #[tokio::test]
    async fn duplicate_sessions_are_refused() {
        let (alice, _) = start_peer("alice", 30).await;
        let (bob, bob_port) = start_peer("bob", 30).await;

        let _session = dial(&alice, bob_port).await;

        // A second connection for the same identity pair must be refused:
        // either bob drops it before HELLO_OK (we observe the closed socket)
        // or our own registry insert loses the race.
        let stream = TcpStream::connect(("127.0.0.1", bob_port)).await.unwrap();
        match PeerSession::initiate(stream, alice.clone()).await {
            Err(SessionError::Duplicate(id)) => assert_eq!(id.to_string(), "bob@cic"),
            Err(SessionError::Frame(_)) | Err(SessionError::Timeout) => {}
            Ok(_) => panic!("second session for bob@cic must be refused"),
            Err(e) => panic!("unexpected error: {}", e),
        }

        assert_eq!(alice.session_count(), 1);
        let bob_stable = wait_until(Duration::from_millis(500), move || {
            bob.session_count() <= 1
        })
        .await;
        assert!(bob_stable);
    }

    #[tokio::test]
    async fn publish_fans_out_by_namespace() {
        // alice holds sessions to bob@cic, carol@cic, dan@mat.
        let config = toml::from_str(
            r#"
                [peer]
                name = "alice"
                namespace = "g"
                port = 1
            "#,
        )
        .unwrap();
        let alice = SharedState::new(config).unwrap();

        for (name, namespace) in [("bob", "cic"), ("carol", "cic"), ("dan", "mat")] {
            let config = toml::from_str(&format!(
                r#"
                    [peer]
                    name = "{name}"
                    namespace = "{namespace}"
                    port = 1
                "#
            ))
            .unwrap();
            let peer = SharedState::new(config).unwrap();
            let listener = server::bind_listener(0).unwrap();
            let port = listener.local_addr().unwrap().port();
            tokio::spawn(server::run_accept_loop(
                listener,
                peer.clone(),
                peer.shutdown_token().child_token(),
            ));
            dial(&alice, port).await;
        }
        assert_eq!(alice.session_count(), 3);

        assert_eq!(alice.router().publish("#cic", "hello").await, 2);
        assert_eq!(alice.router().publish("*", "hello").await, 3);
        assert_eq!(alice.router().publish("#none", "hello").await, 0);
    }

    #[tokio::test]
    async fn keepalive_tears_down_unresponsive_session() {
        let (alice, _) = start_peer("alice", 1).await;

        // A fake peer that completes the handshake and then goes silent.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            let mut hello = String::new();
            reader.read_line(&mut hello).await.unwrap();
            let mut stream = reader.into_inner();
            stream
                .write_all(
                    b"{\"type\":\"HELLO_OK\",\"peer_id\":\"mute@cic\",\"version\":\"1.0\",\"features\":[],\"ttl\":1}\n",
                )
                .await
                .unwrap();
            // Swallow everything, answer nothing.
            let mut sink = [0u8; 1024];
            use tokio::io::AsyncReadExt;
            while stream.read(&mut sink).await.unwrap_or(0) > 0 {}
        });

        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        PeerSession::initiate(stream, alice.clone()).await.unwrap();
        assert_eq!(alice.session_count(), 1);

        // 3 unanswered pings at 1 s intervals: gone well within 6 s.
        let removed = {
            let alice = alice.clone();
            wait_until(Duration::from_secs(6), move || alice.session_count() == 0).await
        };
        assert!(removed);
    }

    #[tokio::test]
    async fn oversize_frame_closes_the_session() {
        let (alice, alice_port) = start_peer("alice", 30).await;

        // Handshake manually, then send a frame past the 32 KiB cap.
        let mut stream = TcpStream::connect(("127.0.0.1", alice_port)).await.unwrap();
        stream
            .write_all(
                b"{\"type\":\"HELLO\",\"peer_id\":\"bully@cic\",\"version\":\"1.0\",\"features\":[],\"ttl\":1}\n",
            )
            .await
            .unwrap();
        let mut reader = BufReader::new(&mut stream);
        let mut hello_ok = String::new();
        reader.read_line(&mut hello_ok).await.unwrap();
        assert!(hello_ok.contains("HELLO_OK"));

        let inserted = {
            let alice = alice.clone();
            wait_until(Duration::from_secs(2), move || alice.session_count() == 1).await
        };
        assert!(inserted);

        let oversize = vec![b'x'; alice.config.network.max_msg_size + 1];
        stream.write_all(&oversize).await.unwrap();

        let removed = {
            let alice = alice.clone();
            wait_until(Duration::from_secs(2), move || alice.session_count() == 0).await
        };
        assert!(removed);
    }

    #[tokio::test]
    async fn discovery_pass_dials_and_records_failures() {
        let (_bob, bob_port) = start_peer("bob", 30).await;

        // A port with nothing listening, so dials to it are refused.
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = dead.local_addr().unwrap().port();
        drop(dead);

        // Mock directory answering every DISCOVER with the same peer list,
        // including the asking peer itself.
        let directory = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dir_port = directory.local_addr().unwrap().port();
        let reply = serde_json::json!({
            "status": "OK",
            "peers": [
                {"name": "alice", "namespace": "cic", "ip": "127.0.0.1", "port": 1},
                {"name": "bob", "namespace": "cic", "ip": "127.0.0.1", "port": bob_port},
                {"name": "ghost", "namespace": "cic", "ip": "127.0.0.1", "port": dead_port},
            ],
        })
        .to_string();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = directory.accept().await else { break };
                let mut reader = BufReader::new(stream);
                let mut request = String::new();
                if reader.read_line(&mut request).await.is_err() {
                    continue;
                }
                let mut stream = reader.into_inner();
                let _ = stream.write_all(reply.as_bytes()).await;
                let _ = stream.write_all(b"\n").await;
            }
        });

        let config: Config = toml::from_str(&format!(
            r#"
                [peer]
                name = "alice"
                namespace = "cic"
                port = 1

                [rendezvous]
                host = "127.0.0.1"
                port = {dir_port}

                [network]
                connection_timeout = 2

                [peer_connection]
                retry_attempts = 1
            "#
        ))
        .unwrap();
        let alice = SharedState::new(config).unwrap();
        let rendezvous = Arc::new(RendezvousClient::new(&alice.config));
        let controller = OverlayController::new(alice.clone(), rendezvous);

        // Self is skipped; bob and ghost are dialed.
        let started = controller.clone().discovery_pass().await;
        assert_eq!(started, 2);

        let connected = {
            let alice = alice.clone();
            wait_until(Duration::from_secs(3), move || alice.session_count() == 1).await
        };
        assert!(connected);
        let ghost_failed = {
            let controller = controller.clone();
            wait_until(Duration::from_secs(3), move || controller.failure_count() == 1).await
        };
        assert!(ghost_failed);

        // bob is connected, ghost is backed off: nothing left to dial.
        assert_eq!(controller.clone().discovery_pass().await, 0);

        // Forced reconciliation forgets the backoff and re-dials ghost.
        assert_eq!(controller.clone().reconnect().await, 1);
    }

    #[tokio::test]
    async fn send_retries_and_times_out_without_ack() {
        let (alice, _) = start_peer("alice", 30).await;

        // Peer that handshakes and reads but never ACKs.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            let mut hello = String::new();
            reader.read_line(&mut hello).await.unwrap();
            let mut stream = reader.into_inner();
            stream
                .write_all(
                    b"{\"type\":\"HELLO_OK\",\"peer_id\":\"deaf@cic\",\"version\":\"1.0\",\"features\":[],\"ttl\":1}\n",
                )
                .await
                .unwrap();
            let mut sink = [0u8; 4096];
            use tokio::io::AsyncReadExt;
            while stream.read(&mut sink).await.unwrap_or(0) > 0 {}
        });

        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        PeerSession::initiate(stream, alice.clone()).await.unwrap();

        let dst: PeerIdentity = "deaf@cic".parse().unwrap();
        let started = Instant::now();
        let outcome = alice
            .router()
            .send(&dst, "anyone?", true, Some(Duration::from_millis(100)), Some(1))
            .await;
        assert!(matches!(outcome, SendOutcome::TimedOut));
        // Two attempts of 100 ms plus one 1 s backoff pause.
        assert!(started.elapsed() >= Duration::from_millis(1200));
    }
}
