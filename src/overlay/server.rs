//! Inbound peer listener.
//!
//! Binds the P2P port with address reuse and accepts connections; each
//! accepted socket gets its own task that runs the receiver handshake and,
//! on success, installs the session.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use super::session::{PeerSession, SessionError};
use crate::state::SharedState;

/// Accept backlog; inbound handshakes are short so a small queue suffices.
const ACCEPT_BACKLOG: i32 = 12;

/// Bind `0.0.0.0:port` with `SO_REUSEADDR` so a quick restart does not trip
/// over a listener in TIME_WAIT.
pub fn bind_listener(port: u16) -> std::io::Result<TcpListener> {
    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));

    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&socket2::SockAddr::from(addr))?;
    socket.listen(ACCEPT_BACKLOG)?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener)
}

/// Accept inbound peer connections until `cancel` fires.
pub async fn run_accept_loop(
    listener: TcpListener,
    state: Arc<SharedState>,
    cancel: CancellationToken,
) {
    match listener.local_addr() {
        Ok(addr) => log::info!("peer server listening on {}", addr),
        Err(_) => log::info!("peer server listening"),
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        log::info!("inbound connection from {}", peer_addr);
                        let state = state.clone();
                        tokio::spawn(async move {
                            handle_inbound(stream, peer_addr, state).await;
                        });
                    }
                    Err(e) => {
                        log::warn!("accept failed: {}", e);
                    }
                }
            }
        }
    }

    log::debug!("peer server stopped");
}

/// Receiver handshake for one accepted socket.
async fn handle_inbound(stream: TcpStream, peer_addr: SocketAddr, state: Arc<SharedState>) {
    match PeerSession::accept(stream, state).await {
        Ok(session) => {
            log::info!("inbound session established with {}", session.remote_id());
        }
        Err(SessionError::Duplicate(id)) => {
            // Simultaneous dials resolve here: the second connection for an
            // identity is dropped without completing the handshake.
            log::info!("dropping duplicate connection for {} from {}", id, peer_addr);
        }
        Err(e) => {
            log::warn!("inbound handshake with {} failed: {}", peer_addr, e);
        }
    }
}
