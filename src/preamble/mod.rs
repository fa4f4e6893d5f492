//! Connection Preamble Interception
//!
//! Inspects the first chunk read from a trusted connection on the intercept
//! port and recognizes one of:
//!
//! - `TEST`: health-check probe, answered with `OK\n` and closed
//! - `HELO` + 4 address bytes: binary handshake, fail-open on bad input
//! - `PROXY ...\r\n`: PROXY protocol v1 text header, fail-closed on bad input
//!
//! Anything else is passed through untouched. Recognized framing is stripped
//! and the remaining bytes are handed back to the caller to replay.

pub mod handshake;
pub mod proxy_v1;

use std::net::IpAddr;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::connection::ConnectionState;
use crate::policy::InterceptPolicy;

pub use handshake::HELO_SIGNATURE;
pub use proxy_v1::{ProxyFamily, ProxyHeaderV1, MAX_HEADER_LEN, PROXY_V1_SIGNATURE};

/// Health-check probe signature
pub const PROBE_SIGNATURE: &[u8; 4] = b"TEST";

/// Reply written to a health-check probe
pub const PROBE_REPLY: &[u8] = b"OK\n";

/// Size of the first read on an intercepted connection
pub const CHUNK_SIZE: usize = 8192;

/// Shortest chunk worth classifying
const MIN_CLASSIFY_LEN: usize = 4;

/// Errors raised while decoding a recognized preamble
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreambleError {
    /// Binary handshake did not yield a usable address (not fatal)
    Decode(String),
    /// Malformed PROXY v1 header (fatal for the connection)
    ProtocolViolation(String),
}

impl std::fmt::Display for PreambleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PreambleError::Decode(msg) => write!(f, "invalid HELO handshake: {}", msg),
            PreambleError::ProtocolViolation(msg) => write!(f, "invalid PROXY header: {}", msg),
        }
    }
}

impl std::error::Error for PreambleError {}

/// Framing recognized at the start of a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preamble {
    Probe,
    BinaryHandshake,
    TextProxyHeader,
    Unrecognized,
}

impl Preamble {
    /// Classify by literal prefix, in priority order.
    pub fn classify(chunk: &[u8]) -> Self {
        if chunk.len() < MIN_CLASSIFY_LEN {
            return Preamble::Unrecognized;
        }

        if chunk.starts_with(PROBE_SIGNATURE) {
            Preamble::Probe
        } else if chunk.starts_with(HELO_SIGNATURE) {
            Preamble::BinaryHandshake
        } else if chunk.starts_with(PROXY_V1_SIGNATURE) {
            Preamble::TextProxyHeader
        } else {
            Preamble::Unrecognized
        }
    }
}

/// What the caller must do with the chunk after processing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreambleAction {
    /// Drop the first `consumed` bytes and deliver the rest
    Forward { consumed: usize },
    /// Write [`PROBE_REPLY`] and close the connection
    Probe,
    /// Tear the connection down
    Abort(PreambleError),
}

/// Classify and decode the first chunk of a connection.
///
/// Runs at most once per connection. Later calls forward everything.
pub fn process_chunk(state: &mut ConnectionState, chunk: &[u8]) -> PreambleAction {
    if state.take_preamble() {
        return PreambleAction::Forward { consumed: 0 };
    }

    let preamble = Preamble::classify(chunk);
    debug!(peer = %state.peer_addr(), ?preamble, "Classified connection preamble");

    match preamble {
        Preamble::Unrecognized => PreambleAction::Forward { consumed: 0 },
        Preamble::Probe => PreambleAction::Probe,
        Preamble::BinaryHandshake => match handshake::decode(chunk) {
            Ok(addr) => {
                state.rewrite(IpAddr::V4(addr));
                PreambleAction::Forward {
                    consumed: handshake::FRAME_LEN,
                }
            }
            Err(e) => {
                warn!(peer = %state.peer_addr(), error = %e, "Ignoring HELO handshake");
                PreambleAction::Forward { consumed: 0 }
            }
        },
        Preamble::TextProxyHeader => match proxy_v1::decode(chunk) {
            Ok(header) => {
                state.rewrite(header.source.ip());
                PreambleAction::Forward {
                    consumed: header.len,
                }
            }
            Err(e) => {
                warn!(peer = %state.peer_addr(), error = %e, "Aborting connection");
                PreambleAction::Abort(e)
            }
        },
    }
}

/// Result of running interception on a stream
#[derive(Debug)]
pub enum InterceptOutcome {
    /// Keep serving. The buffer holds bytes already read that belong to the
    /// application and must be delivered before anything else.
    Continue(BytesMut),
    /// Probe answered and the write side shut down; release the socket.
    ProbeHandled,
    /// Protocol violation; release the socket.
    Aborted(PreambleError),
}

/// Run preamble interception on a freshly accepted stream.
///
/// Does nothing unless the connection is trusted, was accepted on the
/// intercept port, and has not been intercepted before. Otherwise performs a
/// single read and acts on what it finds.
pub async fn intercept<S>(
    stream: &mut S,
    state: &mut ConnectionState,
    policy: &InterceptPolicy,
) -> std::io::Result<InterceptOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::new();
    if !policy.applies_to(state) {
        return Ok(InterceptOutcome::Continue(buf));
    }

    buf.reserve(CHUNK_SIZE);
    if stream.read_buf(&mut buf).await? == 0 {
        return Ok(InterceptOutcome::Continue(buf));
    }

    match process_chunk(state, &buf) {
        PreambleAction::Forward { consumed } => {
            buf.advance(consumed);
            Ok(InterceptOutcome::Continue(buf))
        }
        PreambleAction::Probe => {
            stream.write_all(PROBE_REPLY).await?;
            stream.shutdown().await?;
            debug!(peer = %state.peer_addr(), "Answered health-check probe");
            Ok(InterceptOutcome::ProbeHandled)
        }
        PreambleAction::Abort(e) => Ok(InterceptOutcome::Aborted(e)),
    }
}
