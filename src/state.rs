//! Process-wide shared state.
//!
//! One [`SharedState`] is built at startup and injected into every component.
//! The session registry, the local peer record, and the router handle each
//! sit behind their own lock; iteration always goes through snapshots so no
//! lock is ever held across I/O.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::overlay::protocol::PeerIdentity;
use crate::overlay::session::PeerSession;
use crate::router::MessageRouter;

/// The local peer as the rendezvous directory sees it.
///
/// Mutated only by successful REGISTER responses.
#[derive(Debug, Clone)]
pub struct LocalPeer {
    pub identity: PeerIdentity,
    pub port: u16,
    pub requested_ttl: u64,
    pub confirmed_ttl: Option<u64>,
    pub registered_at: Option<Instant>,
}

pub struct SharedState {
    pub config: Config,
    local: Mutex<LocalPeer>,
    sessions: Mutex<HashMap<PeerIdentity, Arc<PeerSession>>>,
    router: OnceLock<Arc<MessageRouter>>,
    shutdown: CancellationToken,
}

impl SharedState {
    /// Build the shared state and wire the message router into it.
    ///
    /// The configuration must have passed [`Config::validate`].
    pub fn new(config: Config) -> anyhow::Result<Arc<Self>> {
        let identity = PeerIdentity::new(&config.peer.name, &config.peer.namespace)?;
        let local = LocalPeer {
            identity,
            port: config.peer.port,
            requested_ttl: config.peer.ttl,
            confirmed_ttl: None,
            registered_at: None,
        };

        let state = Arc::new(Self {
            config,
            local: Mutex::new(local),
            sessions: Mutex::new(HashMap::new()),
            router: OnceLock::new(),
            shutdown: CancellationToken::new(),
        });

        let router = Arc::new(MessageRouter::new(Arc::downgrade(&state)));
        state
            .router
            .set(router)
            .unwrap_or_else(|_| unreachable!("router installed twice"));

        Ok(state)
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        self.router.get().expect("router is installed in new()")
    }

    // ── Local peer ───────────────────────────────────────────────────────

    pub fn local_id(&self) -> PeerIdentity {
        self.local.lock().identity.clone()
    }

    /// Canonical `name@namespace` string carried in wire messages.
    pub fn peer_label(&self) -> String {
        self.local.lock().identity.to_string()
    }

    pub fn listen_port(&self) -> u16 {
        self.local.lock().port
    }

    pub fn requested_ttl(&self) -> u64 {
        self.local.lock().requested_ttl
    }

    /// Record a successful REGISTER: the server-confirmed TTL and the moment
    /// it started counting.
    pub fn record_registration(&self, confirmed_ttl: u64) {
        let mut local = self.local.lock();
        local.confirmed_ttl = Some(confirmed_ttl);
        local.registered_at = Some(Instant::now());
    }

    pub fn registration(&self) -> (Option<u64>, Option<Instant>) {
        let local = self.local.lock();
        (local.confirmed_ttl, local.registered_at)
    }

    /// Seconds left on the directory TTL, if registered.
    pub fn ttl_remaining(&self) -> Option<u64> {
        let local = self.local.lock();
        let (ttl, at) = (local.confirmed_ttl?, local.registered_at?);
        Some(ttl.saturating_sub(at.elapsed().as_secs()))
    }

    // ── Session registry ─────────────────────────────────────────────────

    /// Insert a session unless its identity is already present.
    ///
    /// This is the single authority for the at-most-one-session-per-peer
    /// rule; both handshake paths go through it and the loser of a
    /// simultaneous-dial race is refused here.
    pub fn try_insert_session(&self, session: Arc<PeerSession>) -> bool {
        use std::collections::hash_map::Entry;

        let mut sessions = self.sessions.lock();
        match sessions.entry(session.remote_id().clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                log::info!("session registered: {}", session.remote_id());
                slot.insert(session);
                true
            }
        }
    }

    /// Remove `session` from the registry if it is the registered one.
    ///
    /// The pointer comparison keeps a refused duplicate from evicting the
    /// session that won the race.
    pub fn remove_session(&self, session: &Arc<PeerSession>) -> bool {
        let mut sessions = self.sessions.lock();
        if let Some(current) = sessions.get(session.remote_id()) {
            if Arc::ptr_eq(current, session) {
                sessions.remove(session.remote_id());
                log::info!("session removed: {}", session.remote_id());
                return true;
            }
        }
        false
    }

    pub fn session(&self, id: &PeerIdentity) -> Option<Arc<PeerSession>> {
        self.sessions.lock().get(id).cloned()
    }

    pub fn has_session(&self, id: &PeerIdentity) -> bool {
        self.sessions.lock().contains_key(id)
    }

    /// Snapshot of all registered sessions, for lock-free iteration.
    pub fn sessions(&self) -> Vec<Arc<PeerSession>> {
        self.sessions.lock().values().cloned().collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Token cancelled exactly once, when orderly shutdown begins.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn begin_shutdown(&self) {
        self.shutdown.cancel();
    }
}
