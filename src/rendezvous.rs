//! Client for the rendezvous directory.
//!
//! Each operation opens a short-lived TCP connection, writes one
//! newline-terminated JSON command, reads one newline-terminated JSON reply,
//! and closes. Errors split into transport failures (retried with backoff
//! where the operation allows it) and server-reported logical errors
//! (surfaced immediately, never retried).

use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

use crate::config::Config;
use crate::overlay::protocol::{encode_frame, FrameError, IdentityError, LineReader, PeerIdentity};
use crate::state::SharedState;

#[derive(Debug, Error)]
pub enum RendezvousError {
    /// Connect/read/write failure or timeout; the request may be retried.
    #[error("rendezvous transport error: {0}")]
    Transport(io::Error),
    /// Oversize, non-UTF-8, or non-JSON traffic; fatal for the request.
    #[error("rendezvous framing error: {0}")]
    Framing(String),
    /// `status: ERROR` reply; retrying cannot help.
    #[error("rendezvous rejected the request: {code}")]
    Server { code: String, details: String },
}

impl From<FrameError> for RendezvousError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(e) => RendezvousError::Transport(e),
            FrameError::Closed => RendezvousError::Transport(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before a full reply arrived",
            )),
            other => RendezvousError::Framing(other.to_string()),
        }
    }
}

fn timed_out(what: &str) -> RendezvousError {
    RendezvousError::Transport(io::Error::new(io::ErrorKind::TimedOut, what.to_owned()))
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum Request<'a> {
    #[serde(rename = "REGISTER")]
    Register {
        peer_id: String,
        name: &'a str,
        namespace: &'a str,
        port: u16,
        ttl: u64,
    },
    #[serde(rename = "DISCOVER")]
    Discover {
        #[serde(skip_serializing_if = "Option::is_none")]
        namespace: Option<&'a str>,
    },
    #[serde(rename = "UNREGISTER")]
    Unregister {
        namespace: &'a str,
        name: &'a str,
        port: u16,
    },
}

/// One peer as reported by DISCOVER. Transient; never persisted.
#[derive(Debug, Clone, Deserialize)]
pub struct RemotePeerRecord {
    pub name: String,
    pub namespace: String,
    pub ip: String,
    pub port: u16,
}

impl RemotePeerRecord {
    pub fn identity(&self) -> Result<PeerIdentity, IdentityError> {
        PeerIdentity::new(&self.name, &self.namespace)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Successful REGISTER reply: where the directory saw us from, and for how
/// long the entry lives.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterOutcome {
    pub ip: String,
    pub port: u16,
    pub ttl: u64,
}

pub struct RendezvousClient {
    host: String,
    port: u16,
    timeout: Duration,
    max_msg_size: usize,
    retry_attempts: u32,
    backoff_base: u64,
}

impl RendezvousClient {
    pub fn new(config: &Config) -> Self {
        Self {
            host: config.rendezvous.host.clone(),
            port: config.rendezvous.port,
            timeout: Duration::from_secs(config.network.connection_timeout),
            max_msg_size: config.network.max_msg_size,
            retry_attempts: config.rendezvous.register_retry_attempts.max(1),
            backoff_base: config.rendezvous.register_backoff_base,
        }
    }

    /// REGISTER the local peer, retrying transport failures with exponential
    /// backoff. On success the shared state's TTL bookkeeping is refreshed.
    pub async fn register(
        &self,
        state: &SharedState,
    ) -> Result<RegisterOutcome, RendezvousError> {
        let label = state.peer_label();
        let id = state.local_id();
        let port = state.listen_port();
        let ttl = state.requested_ttl();

        let request = Request::Register {
            peer_id: label.clone(),
            name: id.name(),
            namespace: id.namespace(),
            port,
            ttl,
        };

        let mut last_err = None;
        for attempt in 1..=self.retry_attempts {
            log::debug!(
                "REGISTER attempt {}/{} for {}",
                attempt,
                self.retry_attempts,
                label
            );

            match self.roundtrip(&request).await {
                Ok(reply) => {
                    let outcome: RegisterOutcome = serde_json::from_value(reply)
                        .map_err(|e| RendezvousError::Framing(e.to_string()))?;
                    state.record_registration(outcome.ttl);
                    log::info!(
                        "registered {} — visible at {}:{} with TTL {}s",
                        label,
                        outcome.ip,
                        outcome.port,
                        outcome.ttl
                    );
                    return Ok(outcome);
                }
                // Validation failures will not improve with retries.
                Err(err @ RendezvousError::Server { .. }) => return Err(err),
                Err(err @ RendezvousError::Framing(_)) => return Err(err),
                Err(err) => {
                    log::warn!(
                        "REGISTER attempt {}/{} failed: {}",
                        attempt,
                        self.retry_attempts,
                        err
                    );
                    last_err = Some(err);
                    if attempt < self.retry_attempts {
                        let backoff =
                            Duration::from_secs(self.backoff_base.pow(attempt - 1).max(1));
                        log::info!("retrying REGISTER in {:?}", backoff);
                        sleep(backoff).await;
                    }
                }
            }
        }

        log::error!("REGISTER failed after {} attempts", self.retry_attempts);
        Err(last_err.unwrap_or_else(|| timed_out("REGISTER exhausted all attempts")))
    }

    /// DISCOVER the overlay, optionally scoped to one namespace.
    ///
    /// Never retried; the overlay controller polls periodically anyway.
    pub async fn discover(
        &self,
        namespace: Option<&str>,
    ) -> Result<Vec<RemotePeerRecord>, RendezvousError> {
        log::debug!("DISCOVER (namespace = {})", namespace.unwrap_or("*"));
        let reply = self.roundtrip(&Request::Discover { namespace }).await?;

        let peers = reply
            .get("peers")
            .cloned()
            .unwrap_or_else(|| serde_json::Value::Array(Vec::new()));
        let peers: Vec<RemotePeerRecord> = serde_json::from_value(peers)
            .map_err(|e| RendezvousError::Framing(format!("bad peer list: {}", e)))?;
        log::debug!("DISCOVER returned {} peer(s)", peers.len());
        Ok(peers)
    }

    /// UNREGISTER the local peer during orderly shutdown.
    pub async fn unregister(&self, state: &SharedState) -> Result<(), RendezvousError> {
        let id = state.local_id();
        let request = Request::Unregister {
            namespace: id.namespace(),
            name: id.name(),
            port: state.listen_port(),
        };
        self.roundtrip(&request).await?;
        log::info!("unregistered {}", id);
        Ok(())
    }

    /// One request/response cycle on a fresh connection.
    async fn roundtrip(
        &self,
        request: &Request<'_>,
    ) -> Result<serde_json::Value, RendezvousError> {
        let frame = encode_frame(request, self.max_msg_size)
            .map_err(|e| RendezvousError::Framing(e.to_string()))?;

        let addr = (self.host.as_str(), self.port);
        let mut stream = timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| timed_out("timed out connecting to the rendezvous server"))?
            .map_err(RendezvousError::Transport)?;

        timeout(self.timeout, stream.write_all(&frame))
            .await
            .map_err(|_| timed_out("timed out sending the command"))?
            .map_err(RendezvousError::Transport)?;

        let mut reader = LineReader::new(stream, self.max_msg_size);
        let line = timeout(self.timeout, reader.next_line())
            .await
            .map_err(|_| timed_out("timed out waiting for the reply"))??;

        let reply: serde_json::Value = serde_json::from_str(&line)
            .map_err(|e| RendezvousError::Framing(format!("bad reply: {}", e)))?;

        if reply.get("status").and_then(|s| s.as_str()) == Some("ERROR") {
            // The server reports the error code in `message`; older builds
            // used `error`. Accept both.
            let code = reply
                .get("message")
                .or_else(|| reply.get("error"))
                .and_then(|m| m.as_str())
                .unwrap_or("unknown")
                .to_owned();
            let details = reply
                .get("details")
                .and_then(|d| d.as_str())
                .unwrap_or_default()
                .to_owned();
            return Err(RendezvousError::Server { code, details });
        }

        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    fn test_state(rdzv_port: u16) -> Arc<SharedState> {
        let config: Config = toml::from_str(&format!(
            r#"
                [peer]
                name = "alice"
                namespace = "cic"
                port = 9301

                [rendezvous]
                host = "127.0.0.1"
                port = {rdzv_port}
                register_retry_attempts = 3
                register_backoff_base = 1

                [network]
                connection_timeout = 2
            "#
        ))
        .unwrap();
        SharedState::new(config).unwrap()
    }

    /// Serve `replies` one connection at a time; count connections seen.
    async fn mock_server(replies: Vec<&'static str>) -> (u16, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        tokio::spawn(async move {
            for reply in replies {
                let (stream, _) = listener.accept().await.unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
                let mut reader = BufReader::new(stream);
                let mut request = String::new();
                reader.read_line(&mut request).await.unwrap();
                if !reply.is_empty() {
                    let mut stream = reader.into_inner();
                    stream.write_all(reply.as_bytes()).await.unwrap();
                    stream.write_all(b"\n").await.unwrap();
                }
                // Empty reply: drop the socket without answering.
            }
        });

        (port, hits)
    }

    #[tokio::test]
    async fn register_updates_local_peer() {
        let (port, hits) =
            mock_server(vec![r#"{"status":"OK","ip":"10.0.0.5","port":9301,"ttl":600}"#]).await;
        let state = test_state(port);
        let client = RendezvousClient::new(&state.config);

        let outcome = client.register(&state).await.unwrap();
        assert_eq!(outcome.ttl, 600);
        assert_eq!(outcome.ip, "10.0.0.5");
        assert_eq!(state.registration().0, Some(600));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn register_never_retries_server_errors() {
        let (port, hits) = mock_server(vec![
            r#"{"status":"ERROR","message":"bad_namespace","details":"namespace too long"}"#,
            r#"{"status":"OK","ip":"10.0.0.5","port":9301,"ttl":600}"#,
        ])
        .await;
        let state = test_state(port);
        let client = RendezvousClient::new(&state.config);

        match client.register(&state).await {
            Err(RendezvousError::Server { code, details }) => {
                assert_eq!(code, "bad_namespace");
                assert_eq!(details, "namespace too long");
            }
            other => panic!("expected server error, got {:?}", other),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(state.registration().0, None);
    }

    #[tokio::test]
    async fn register_retries_transport_failures() {
        // First connection is dropped without a reply, second succeeds.
        let (port, hits) = mock_server(vec![
            "",
            r#"{"status":"OK","ip":"10.0.0.5","port":9301,"ttl":600}"#,
        ])
        .await;
        let state = test_state(port);
        let client = RendezvousClient::new(&state.config);

        let outcome = client.register(&state).await.unwrap();
        assert_eq!(outcome.ttl, 600);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn discover_parses_peer_records() {
        let (port, _) = mock_server(vec![
            r#"{"status":"OK","peers":[{"name":"bob","namespace":"cic","ip":"10.0.0.7","port":9302}]}"#,
        ])
        .await;
        let state = test_state(port);
        let client = RendezvousClient::new(&state.config);

        let peers = client.discover(None).await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].identity().unwrap().to_string(), "bob@cic");
        assert_eq!(peers[0].addr(), "10.0.0.7:9302");
    }

    #[tokio::test]
    async fn unregister_roundtrip() {
        let (port, hits) = mock_server(vec![r#"{"status":"OK"}"#]).await;
        let state = test_state(port);
        let client = RendezvousClient::new(&state.config);

        client.unregister(&state).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
