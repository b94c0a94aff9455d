//! Peer-to-peer protocol message types.
//!
//! Every message exchanged on a peer TCP session is defined here so that all
//! sub-modules speak the same language. Framing is line-delimited UTF-8 JSON:
//! one object, one `\n`, at most [`DEFAULT_MAX_MSG_SIZE`] bytes per frame.

use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

// ────────────────────────────────────────────────────────────────────────────
// Constants
// ────────────────────────────────────────────────────────────────────────────

/// Protocol version announced in HELLO / HELLO_OK.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Feature labels announced in HELLO / HELLO_OK.
pub const FEATURES: [&str; 2] = ["ack", "metrics"];

/// Default frame-size ceiling (32 KiB), shared by both wire directions.
pub const DEFAULT_MAX_MSG_SIZE: usize = 32 * 1024;

/// Deadline for the HELLO / HELLO_OK exchange on a fresh connection.
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Every message carries `ttl: 1`; received values are ignored (no relaying).
pub const WIRE_TTL: u32 = 1;

/// Longest allowed peer name or namespace.
pub const MAX_IDENTITY_PART_LEN: usize = 64;

// ────────────────────────────────────────────────────────────────────────────
// Peer identity
// ────────────────────────────────────────────────────────────────────────────

/// Canonical `name@namespace` identity of a peer in the overlay.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerIdentity {
    name: String,
    namespace: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("peer {0} must not be empty")]
    Empty(&'static str),
    #[error("peer {0} exceeds {MAX_IDENTITY_PART_LEN} characters")]
    TooLong(&'static str),
    #[error("peer {0} must not contain '@'")]
    BadChar(&'static str),
    #[error("peer id is not of the form name@namespace")]
    MissingSeparator,
}

impl PeerIdentity {
    pub fn new(name: &str, namespace: &str) -> Result<Self, IdentityError> {
        validate_part(name, "name")?;
        validate_part(namespace, "namespace")?;
        Ok(Self {
            name: name.to_owned(),
            namespace: namespace.to_owned(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

fn validate_part(part: &str, label: &'static str) -> Result<(), IdentityError> {
    if part.is_empty() {
        return Err(IdentityError::Empty(label));
    }
    if part.chars().count() > MAX_IDENTITY_PART_LEN {
        return Err(IdentityError::TooLong(label));
    }
    if part.contains('@') {
        return Err(IdentityError::BadChar(label));
    }
    Ok(())
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.namespace)
    }
}

impl FromStr for PeerIdentity {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, namespace) = s.split_once('@').ok_or(IdentityError::MissingSeparator)?;
        PeerIdentity::new(name, namespace)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Peer messages  (line-delimited JSON over a persistent TCP stream)
// ────────────────────────────────────────────────────────────────────────────

/// Top-level envelope for every message exchanged on a peer session.
///
/// The internal tag serialises as `{ "type": "PING", ... }` with the wire
/// names used by the rendezvous ecosystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PeerMessage {
    // ── Handshake ────────────────────────────────────────────────────────
    /// Sent by the dialing side immediately after TCP connect.
    #[serde(rename = "HELLO")]
    Hello {
        peer_id: String,
        version: String,
        features: Vec<String>,
        ttl: u32,
    },
    /// Reply from the accepting side acknowledging the handshake.
    #[serde(rename = "HELLO_OK")]
    HelloOk {
        peer_id: String,
        version: String,
        features: Vec<String>,
        ttl: u32,
    },

    // ── Keepalive ────────────────────────────────────────────────────────
    #[serde(rename = "PING")]
    Ping {
        msg_id: String,
        timestamp: String,
        ttl: u32,
    },
    #[serde(rename = "PONG")]
    Pong {
        msg_id: String,
        timestamp: String,
        ttl: u32,
    },

    // ── Data plane ───────────────────────────────────────────────────────
    /// Unicast payload; answered with an ACK when `require_ack` is set.
    #[serde(rename = "SEND")]
    Send {
        msg_id: String,
        src: String,
        dst: String,
        payload: String,
        #[serde(default)]
        require_ack: bool,
        ttl: u32,
    },
    #[serde(rename = "ACK")]
    Ack {
        msg_id: String,
        timestamp: String,
        src: String,
        dst: String,
        ttl: u32,
    },
    /// Fan-out payload; never acknowledged.
    #[serde(rename = "PUB")]
    Pub {
        msg_id: String,
        src: String,
        dst: String,
        payload: String,
        ttl: u32,
    },

    // ── Graceful close ───────────────────────────────────────────────────
    #[serde(rename = "BYE")]
    Bye {
        msg_id: String,
        src: String,
        dst: String,
        reason: String,
        ttl: u32,
    },
    #[serde(rename = "BYE_OK")]
    ByeOk {
        msg_id: String,
        src: String,
        dst: String,
        ttl: u32,
    },

    /// Anything with an unrecognised `type` tag; logged and ignored.
    #[serde(other)]
    Unknown,
}

impl PeerMessage {
    /// Wire label of the variant (for log messages).
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::Hello { .. } => "HELLO",
            PeerMessage::HelloOk { .. } => "HELLO_OK",
            PeerMessage::Ping { .. } => "PING",
            PeerMessage::Pong { .. } => "PONG",
            PeerMessage::Send { .. } => "SEND",
            PeerMessage::Ack { .. } => "ACK",
            PeerMessage::Pub { .. } => "PUB",
            PeerMessage::Bye { .. } => "BYE",
            PeerMessage::ByeOk { .. } => "BYE_OK",
            PeerMessage::Unknown => "UNKNOWN",
        }
    }

    /// HELLO announcing `peer_id`, with the fixed version/feature set.
    pub fn hello(peer_id: String) -> Self {
        PeerMessage::Hello {
            peer_id,
            version: PROTOCOL_VERSION.to_owned(),
            features: FEATURES.iter().map(|f| (*f).to_owned()).collect(),
            ttl: WIRE_TTL,
        }
    }

    /// HELLO_OK announcing `peer_id`, mirroring [`PeerMessage::hello`].
    pub fn hello_ok(peer_id: String) -> Self {
        PeerMessage::HelloOk {
            peer_id,
            version: PROTOCOL_VERSION.to_owned(),
            features: FEATURES.iter().map(|f| (*f).to_owned()).collect(),
            ttl: WIRE_TTL,
        }
    }
}

/// RFC 3339 UTC timestamp for the wire `timestamp` fields.
///
/// Informational only; RTTs are measured with monotonic clocks.
pub fn wire_timestamp() -> String {
    humantime::format_rfc3339_millis(SystemTime::now()).to_string()
}

// ────────────────────────────────────────────────────────────────────────────
// Framing
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed by the remote end")]
    Closed,
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    Oversize { len: usize, max: usize },
    #[error("frame is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode one message as a newline-terminated JSON frame, enforcing `max`.
pub fn encode_frame<T: Serialize>(msg: &T, max: usize) -> Result<Vec<u8>, FrameError> {
    let mut buf = serde_json::to_vec(msg)?;
    buf.push(b'\n');
    if buf.len() > max {
        return Err(FrameError::Oversize {
            len: buf.len(),
            max,
        });
    }
    Ok(buf)
}

/// Parse one received line into a [`PeerMessage`].
pub fn decode_message(line: &str) -> Result<PeerMessage, FrameError> {
    Ok(serde_json::from_str(line)?)
}

/// Accumulating line reader over any byte stream.
///
/// Bytes are buffered until the first `\n`; the buffer growing past `max`
/// without a terminator, or a complete frame longer than `max`, is a framing
/// error. Trailing bytes after the newline stay buffered for the next call.
pub struct LineReader<R> {
    inner: R,
    buf: Vec<u8>,
    max: usize,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R, max: usize) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            max,
        }
    }

    /// Read until one full line is available and return it without the `\n`.
    pub async fn next_line(&mut self) -> Result<String, FrameError> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                if pos + 1 > self.max {
                    return Err(FrameError::Oversize {
                        len: pos + 1,
                        max: self.max,
                    });
                }
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                let text = std::str::from_utf8(&line[..pos])?;
                return Ok(text.trim().to_owned());
            }

            if self.buf.len() > self.max {
                return Err(FrameError::Oversize {
                    len: self.buf.len(),
                    max: self.max,
                });
            }

            let mut chunk = [0u8; 4096];
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                return Err(FrameError::Closed);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn identity_roundtrip() {
        let id: PeerIdentity = "alice@cic".parse().unwrap();
        assert_eq!(id.name(), "alice");
        assert_eq!(id.namespace(), "cic");
        assert_eq!(id.to_string(), "alice@cic");
    }

    #[test]
    fn identity_rejects_bad_input() {
        assert_eq!(
            "noseparator".parse::<PeerIdentity>().unwrap_err(),
            IdentityError::MissingSeparator
        );
        assert_eq!(
            PeerIdentity::new("", "cic").unwrap_err(),
            IdentityError::Empty("name")
        );
        assert_eq!(
            PeerIdentity::new("a", &"x".repeat(65)).unwrap_err(),
            IdentityError::TooLong("namespace")
        );
        assert!(PeerIdentity::new("a@b", "cic").is_err());
    }

    #[test]
    fn send_message_wire_shape() {
        let msg = PeerMessage::Send {
            msg_id: "m1".into(),
            src: "alice@cic".into(),
            dst: "bob@cic".into(),
            payload: "hi".into(),
            require_ack: true,
            ttl: WIRE_TTL,
        };
        let frame = encode_frame(&msg, DEFAULT_MAX_MSG_SIZE).unwrap();
        let text = std::str::from_utf8(&frame).unwrap();
        assert!(text.ends_with('\n'));
        assert!(text.contains("\"type\":\"SEND\""));

        match decode_message(text.trim()).unwrap() {
            PeerMessage::Send {
                msg_id,
                payload,
                require_ack,
                ..
            } => {
                assert_eq!(msg_id, "m1");
                assert_eq!(payload, "hi");
                assert!(require_ack);
            }
            other => panic!("unexpected variant {:?}", other),
        }
    }

    #[test]
    fn unknown_type_decodes_to_unknown() {
        let msg = decode_message(r#"{"type":"WHO_AS","ttl":1}"#).unwrap();
        assert!(matches!(msg, PeerMessage::Unknown));
    }

    #[test]
    fn encode_rejects_oversize() {
        let msg = PeerMessage::Pub {
            msg_id: "m".into(),
            src: "a@b".into(),
            dst: "*".into(),
            payload: "x".repeat(DEFAULT_MAX_MSG_SIZE),
            ttl: WIRE_TTL,
        };
        assert!(matches!(
            encode_frame(&msg, DEFAULT_MAX_MSG_SIZE),
            Err(FrameError::Oversize { .. })
        ));
    }

    #[tokio::test]
    async fn line_reader_splits_coalesced_frames() {
        let (mut tx, rx) = tokio::io::duplex(1024);
        tx.write_all(b"{\"a\":1}\n{\"b\":2}\npartial").await.unwrap();

        let mut reader = LineReader::new(rx, 256);
        assert_eq!(reader.next_line().await.unwrap(), r#"{"a":1}"#);
        assert_eq!(reader.next_line().await.unwrap(), r#"{"b":2}"#);

        tx.write_all(b" tail\n").await.unwrap();
        assert_eq!(reader.next_line().await.unwrap(), "partial tail");
    }

    #[tokio::test]
    async fn line_reader_enforces_limit_without_terminator() {
        let (mut tx, rx) = tokio::io::duplex(1024);
        let mut reader = LineReader::new(rx, 16);

        tx.write_all(&[b'x'; 32]).await.unwrap();
        assert!(matches!(
            reader.next_line().await,
            Err(FrameError::Oversize { .. })
        ));
    }

    #[tokio::test]
    async fn line_reader_frame_at_limit_is_accepted() {
        let max = 16;
        let (mut tx, rx) = tokio::io::duplex(1024);
        let mut reader = LineReader::new(rx, max);

        // 15 bytes + '\n' == 16 framed bytes: exactly at the cap.
        tx.write_all(b"123456789012345\n").await.unwrap();
        assert_eq!(reader.next_line().await.unwrap(), "123456789012345");

        // 16 bytes + '\n' == 17 framed bytes: one past the cap.
        tx.write_all(b"1234567890123456\n").await.unwrap();
        assert!(matches!(
            reader.next_line().await,
            Err(FrameError::Oversize { len: 17, max: 16 })
        ));
    }

    #[tokio::test]
    async fn line_reader_reports_eof() {
        let (tx, rx) = tokio::io::duplex(64);
        drop(tx);
        let mut reader = LineReader::new(rx, 64);
        assert!(matches!(reader.next_line().await, Err(FrameError::Closed)));
    }
}
