//! One full-duplex TCP session with one remote peer.
//!
//! A session owns a split TCP stream and two long-running workers: a reader
//! that blocks on receive and dispatches by message type, and a writer that
//! drains the outbound queue. Producers never touch the socket directly:
//! everything goes through the queue except the handshake, which is written
//! before the workers start under the same write mutex the writer uses.
//!
//! The close path is idempotent: it stops the keepalive, cancels the session
//! token (releasing both workers from blocking I/O), and a monitor task joins
//! the workers and removes the registry entry exactly once.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::keepalive::KeepAlive;
use super::protocol::{
    decode_message, encode_frame, wire_timestamp, FrameError, IdentityError, LineReader,
    PeerIdentity, PeerMessage, HANDSHAKE_TIMEOUT_SECS, WIRE_TTL,
};
use crate::state::SharedState;

/// Outbound queue depth per session.
const OUTBOUND_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("timed out waiting for the peer")]
    Timeout,
    #[error("peer sent {got} where {expected} was expected")]
    UnexpectedMessage {
        expected: &'static str,
        got: &'static str,
    },
    #[error("invalid peer identity in handshake: {0}")]
    Identity(#[from] IdentityError),
    #[error("already connected to {0}")]
    Duplicate(PeerIdentity),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Starting,
    Running,
    Closing,
    Closed,
}

impl SessionStatus {
    pub fn label(&self) -> &'static str {
        match self {
            SessionStatus::Starting => "starting",
            SessionStatus::Running => "running",
            SessionStatus::Closing => "closing",
            SessionStatus::Closed => "closed",
        }
    }
}

/// Worker-owned pieces, taken out once when the workers start.
struct SessionInner {
    status: SessionStatus,
    reader: Option<LineReader<OwnedReadHalf>>,
    outbound_rx: Option<mpsc::Receiver<PeerMessage>>,
}

pub struct PeerSession {
    remote_id: PeerIdentity,
    remote_addr: SocketAddr,
    /// True iff this side dialed the connection.
    initiated: bool,
    state: Arc<SharedState>,
    /// Serialises all socket writes, including the pre-worker handshake.
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    outbound_tx: mpsc::Sender<PeerMessage>,
    inner: parking_lot::Mutex<SessionInner>,
    keepalive: OnceLock<Arc<KeepAlive>>,
    /// Cancelled when the session starts closing; releases both workers.
    cancel: CancellationToken,
    /// Cancelled by the monitor once the workers have been joined and the
    /// registry entry is gone.
    done: CancellationToken,
}

impl PeerSession {
    fn new(
        reader: LineReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
        remote_id: PeerIdentity,
        remote_addr: SocketAddr,
        initiated: bool,
        state: Arc<SharedState>,
    ) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        Arc::new(Self {
            remote_id,
            remote_addr,
            initiated,
            state,
            writer: tokio::sync::Mutex::new(writer),
            outbound_tx,
            inner: parking_lot::Mutex::new(SessionInner {
                status: SessionStatus::Starting,
                reader: Some(reader),
                outbound_rx: Some(outbound_rx),
            }),
            keepalive: OnceLock::new(),
            cancel: CancellationToken::new(),
            done: CancellationToken::new(),
        })
    }

    // ────────────────────────────────────────────────────────────────────
    // Handshake entry points
    // ────────────────────────────────────────────────────────────────────

    /// Initiator handshake on a freshly dialed connection.
    ///
    /// Sends HELLO, waits for HELLO_OK (10 s deadline), registers the session
    /// under the identity the peer announced, and starts the workers. The
    /// socket is dropped on any failure, including losing a registry race.
    pub async fn initiate(
        stream: TcpStream,
        state: Arc<SharedState>,
    ) -> Result<Arc<Self>, SessionError> {
        let remote_addr = stream.peer_addr()?;
        let max = state.config.network.max_msg_size;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = LineReader::new(read_half, max);

        let hello = PeerMessage::hello(state.peer_label());
        log::debug!("sending HELLO to {}", remote_addr);
        write_frame(&mut write_half, &hello, max).await?;

        let reply = recv_handshake(&mut reader).await?;
        let remote_id = match reply {
            PeerMessage::HelloOk { peer_id, .. } => peer_id.parse::<PeerIdentity>()?,
            other => {
                return Err(SessionError::UnexpectedMessage {
                    expected: "HELLO_OK",
                    got: other.kind(),
                })
            }
        };
        log::debug!("received HELLO_OK from {} at {}", remote_id, remote_addr);

        let session = PeerSession::new(reader, write_half, remote_id, remote_addr, true, state);
        session.register_and_start()
    }

    /// Receiver handshake on an accepted connection.
    ///
    /// Waits for HELLO (10 s deadline), drops the socket quietly when the
    /// announced identity is already registered, otherwise replies HELLO_OK,
    /// registers, and starts the workers.
    pub async fn accept(
        stream: TcpStream,
        state: Arc<SharedState>,
    ) -> Result<Arc<Self>, SessionError> {
        let remote_addr = stream.peer_addr()?;
        let max = state.config.network.max_msg_size;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = LineReader::new(read_half, max);

        let hello = recv_handshake(&mut reader).await?;
        let remote_id = match hello {
            PeerMessage::Hello { peer_id, .. } => peer_id.parse::<PeerIdentity>()?,
            other => {
                return Err(SessionError::UnexpectedMessage {
                    expected: "HELLO",
                    got: other.kind(),
                })
            }
        };
        log::debug!("received HELLO from {} at {}", remote_id, remote_addr);

        // Fast-path dedup before answering; the registry insert below is the
        // authoritative check.
        if state.has_session(&remote_id) {
            return Err(SessionError::Duplicate(remote_id));
        }

        let hello_ok = PeerMessage::hello_ok(state.peer_label());
        write_frame(&mut write_half, &hello_ok, max).await?;
        log::debug!("sent HELLO_OK to {}", remote_id);

        let session = PeerSession::new(reader, write_half, remote_id, remote_addr, false, state);
        session.register_and_start()
    }

    /// Insert into the registry and spawn the workers.
    fn register_and_start(self: Arc<Self>) -> Result<Arc<Self>, SessionError> {
        if !self.state.try_insert_session(self.clone()) {
            return Err(SessionError::Duplicate(self.remote_id.clone()));
        }
        self.clone().start();
        Ok(self)
    }

    /// Transition to Running and spawn reader, writer, monitor, and (on the
    /// dialing side) the keepalive.
    fn start(self: Arc<Self>) {
        let (reader, outbound_rx) = {
            let mut inner = self.inner.lock();
            inner.status = SessionStatus::Running;
            (
                inner.reader.take().expect("session started twice"),
                inner.outbound_rx.take().expect("session started twice"),
            )
        };

        log::info!(
            "session with {} ({}) running — {}",
            self.remote_id,
            self.remote_addr,
            if self.initiated { "outbound" } else { "inbound" }
        );

        let reader_task = {
            let session = self.clone();
            tokio::spawn(async move { session.run_reader(reader).await })
        };
        let writer_task = {
            let session = self.clone();
            tokio::spawn(async move { session.run_writer(outbound_rx).await })
        };

        if self.initiated {
            let _ = self.keepalive.set(KeepAlive::spawn(&self));
        }

        // Monitor: the only place that joins the workers and removes the
        // registry entry, so no worker ever joins itself.
        let session = self.clone();
        tokio::spawn(async move {
            let _ = reader_task.await;
            let _ = writer_task.await;
            session.inner.lock().status = SessionStatus::Closed;
            session.state.remove_session(&session);
            session.done.cancel();
            log::info!("session with {} closed", session.remote_id);
        });
    }

    // ────────────────────────────────────────────────────────────────────
    // Worker loops
    // ────────────────────────────────────────────────────────────────────

    async fn run_reader(self: Arc<Self>, mut reader: LineReader<OwnedReadHalf>) {
        log::debug!("reader started for {}", self.remote_id);
        let read_timeout = Duration::from_secs(self.state.config.network.connection_timeout);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = timeout(read_timeout, reader.next_line()) => {
                    let line = match received {
                        Err(_) => {
                            log::warn!("receive from {} timed out", self.remote_id);
                            self.begin_close();
                            break;
                        }
                        Ok(Err(FrameError::Closed)) => {
                            log::info!("connection closed by {}", self.remote_id);
                            self.begin_close();
                            break;
                        }
                        Ok(Err(e)) => {
                            log::warn!("receive from {} failed: {}", self.remote_id, e);
                            self.begin_close();
                            break;
                        }
                        Ok(Ok(line)) => line,
                    };

                    match decode_message(&line) {
                        Ok(msg) => self.dispatch(msg).await,
                        Err(e) => {
                            log::warn!("bad frame from {}: {}", self.remote_id, e);
                            self.begin_close();
                            break;
                        }
                    }
                }
            }
        }
        log::debug!("reader stopped for {}", self.remote_id);
    }

    async fn run_writer(self: Arc<Self>, mut outbound_rx: mpsc::Receiver<PeerMessage>) {
        log::debug!("writer started for {}", self.remote_id);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    // Flush whatever is already queued (a BYE or BYE_OK on
                    // its way out) before dropping the socket.
                    while let Ok(msg) = outbound_rx.try_recv() {
                        if self.send_direct(&msg).await.is_err() {
                            break;
                        }
                    }
                    break;
                }
                queued = outbound_rx.recv() => {
                    match queued {
                        Some(msg) => {
                            if let Err(e) = self.send_direct(&msg).await {
                                log::warn!("send to {} failed: {}", self.remote_id, e);
                                self.begin_close();
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
        log::debug!("writer stopped for {}", self.remote_id);
    }

    /// Handle one received message according to its type.
    async fn dispatch(&self, msg: PeerMessage) {
        log::debug!("received {} from {}", msg.kind(), self.remote_id);

        match msg {
            PeerMessage::Ping { msg_id, .. } => {
                let pong = PeerMessage::Pong {
                    msg_id,
                    timestamp: wire_timestamp(),
                    ttl: WIRE_TTL,
                };
                self.enqueue(pong).await;
            }
            PeerMessage::Pong { msg_id, .. } => match self.keepalive.get() {
                Some(keepalive) => keepalive.handle_pong(&msg_id),
                None => log::debug!("PONG from {} outside keepalive", self.remote_id),
            },
            PeerMessage::Bye { msg_id, reason, .. } => {
                log::info!("BYE from {}: {}", self.remote_id, reason);
                let bye_ok = PeerMessage::ByeOk {
                    msg_id,
                    src: self.state.peer_label(),
                    dst: self.remote_id.to_string(),
                    ttl: WIRE_TTL,
                };
                self.enqueue(bye_ok).await;
                self.begin_close();
            }
            PeerMessage::ByeOk { .. } => {
                log::info!("BYE_OK from {}", self.remote_id);
                self.begin_close();
            }
            msg @ (PeerMessage::Send { .. } | PeerMessage::Ack { .. } | PeerMessage::Pub { .. }) => {
                self.state.router().process_incoming(msg, self).await;
            }
            PeerMessage::Hello { .. } | PeerMessage::HelloOk { .. } => {
                log::warn!(
                    "unexpected {} from {} after handshake",
                    msg.kind(),
                    self.remote_id
                );
            }
            PeerMessage::Unknown => {
                log::warn!("unknown message type from {}, ignoring", self.remote_id);
            }
        }
    }

    // ────────────────────────────────────────────────────────────────────
    // Sending
    // ────────────────────────────────────────────────────────────────────

    /// Queue a message for the writer. Returns false once the session is
    /// closing and the queue is gone.
    pub async fn enqueue(&self, msg: PeerMessage) -> bool {
        self.outbound_tx.send(msg).await.is_ok()
    }

    /// Queue a BYE announcing why we are leaving.
    pub async fn send_bye(&self, reason: &str) {
        let bye = PeerMessage::Bye {
            msg_id: Uuid::new_v4().to_string(),
            src: self.state.peer_label(),
            dst: self.remote_id.to_string(),
            reason: reason.to_owned(),
            ttl: WIRE_TTL,
        };
        if self.enqueue(bye).await {
            log::debug!("BYE queued for {}", self.remote_id);
        }
    }

    /// Write one frame to the socket under the write mutex.
    async fn send_direct(&self, msg: &PeerMessage) -> Result<(), SessionError> {
        log::debug!("sending {} to {}", msg.kind(), self.remote_id);
        let frame = encode_frame(msg, self.state.config.network.max_msg_size)?;
        let write_timeout = Duration::from_secs(self.state.config.network.connection_timeout);

        let mut writer = self.writer.lock().await;
        timeout(write_timeout, writer.write_all(&frame))
            .await
            .map_err(|_| SessionError::Timeout)?
            .map_err(SessionError::from)?;
        Ok(())
    }

    // ────────────────────────────────────────────────────────────────────
    // Close path
    // ────────────────────────────────────────────────────────────────────

    /// Begin the idempotent close: stop the keepalive and cancel the session
    /// token so both workers unblock. Safe to call from any task, including
    /// the workers themselves; concurrent calls collapse to one.
    pub fn begin_close(&self) {
        {
            let mut inner = self.inner.lock();
            if matches!(inner.status, SessionStatus::Closing | SessionStatus::Closed) {
                return;
            }
            inner.status = SessionStatus::Closing;
        }

        log::info!("closing session with {}", self.remote_id);
        if let Some(keepalive) = self.keepalive.get() {
            keepalive.stop();
        }
        self.cancel.cancel();
    }

    /// Begin the close and wait (bounded) until the workers are joined and
    /// the registry entry is gone. Must not be called from a session worker.
    pub async fn close_and_wait(&self, cap: Duration) {
        self.begin_close();
        if timeout(cap, self.done.cancelled()).await.is_err() {
            log::warn!(
                "session with {} did not close within {:?}",
                self.remote_id,
                cap
            );
        }
    }

    // ────────────────────────────────────────────────────────────────────
    // Accessors
    // ────────────────────────────────────────────────────────────────────

    pub fn remote_id(&self) -> &PeerIdentity {
        &self.remote_id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn is_initiator(&self) -> bool {
        self.initiated
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.lock().status
    }

    /// Mean RTT (ms) and sample count, when this side runs the keepalive.
    pub fn keepalive_stats(&self) -> Option<(Option<f64>, usize)> {
        let keepalive = self.keepalive.get()?;
        Some((keepalive.mean_rtt(), keepalive.sample_count()))
    }

    pub(crate) fn shared(&self) -> &Arc<SharedState> {
        &self.state
    }

    pub(crate) fn close_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Receive one handshake message within the handshake deadline.
async fn recv_handshake(
    reader: &mut LineReader<OwnedReadHalf>,
) -> Result<PeerMessage, SessionError> {
    let deadline = Duration::from_secs(HANDSHAKE_TIMEOUT_SECS);
    let line = timeout(deadline, reader.next_line())
        .await
        .map_err(|_| SessionError::Timeout)??;
    Ok(decode_message(&line)?)
}

/// Pre-worker frame write used by both handshake roles.
async fn write_frame(
    writer: &mut OwnedWriteHalf,
    msg: &PeerMessage,
    max: usize,
) -> Result<(), SessionError> {
    let frame = encode_frame(msg, max)?;
    let deadline = Duration::from_secs(HANDSHAKE_TIMEOUT_SECS);
    timeout(deadline, writer.write_all(&frame))
        .await
        .map_err(|_| SessionError::Timeout)?
        .map_err(SessionError::from)?;
    Ok(())
}
