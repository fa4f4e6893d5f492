//! PROXY Protocol v1 Parser
//!
//! Parses the text form `PROXY <TCP4|TCP6> <src> <dst> <sport> <dport>\r\n`.
//! The `UNKNOWN` form is rejected.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use smallvec::SmallVec;

use super::PreambleError;

/// PROXY v1 signature
pub const PROXY_V1_SIGNATURE: &[u8; 5] = b"PROXY";

/// Maximum v1 header length, CRLF included
pub const MAX_HEADER_LEN: usize = 107;

const FIELD_COUNT: usize = 6;

/// Transport family announced by the header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyFamily {
    Tcp4,
    Tcp6,
}

/// A parsed PROXY v1 header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyHeaderV1 {
    pub family: ProxyFamily,

    /// Original client address
    pub source: SocketAddr,

    /// Address the client connected to
    pub destination: SocketAddr,

    /// Bytes occupied by the header, CRLF included
    pub len: usize,
}

fn violation(msg: impl Into<String>) -> PreambleError {
    PreambleError::ProtocolViolation(msg.into())
}

/// Parse a PROXY v1 header from the front of `chunk`.
///
/// The whole line must already be buffered: a missing CRLF within the first
/// [`MAX_HEADER_LEN`] bytes is a violation.
pub fn decode(chunk: &[u8]) -> Result<ProxyHeaderV1, PreambleError> {
    let window = &chunk[..chunk.len().min(MAX_HEADER_LEN)];
    let line_end = window
        .windows(2)
        .position(|w| w == b"\r\n")
        .ok_or_else(|| violation("no CRLF found"))?;

    let line = std::str::from_utf8(&chunk[..line_end])
        .ok()
        .filter(|line| line.is_ascii())
        .ok_or_else(|| violation("header is not ASCII"))?;

    let fields: SmallVec<[&str; FIELD_COUNT]> = line.split(' ').collect();
    if fields.len() != FIELD_COUNT {
        return Err(violation(format!(
            "expected {} fields, got {}",
            FIELD_COUNT,
            fields.len()
        )));
    }
    if fields[0].as_bytes() != PROXY_V1_SIGNATURE {
        return Err(violation(format!("bad signature {:?}", fields[0])));
    }

    let family = match fields[1] {
        "TCP4" => ProxyFamily::Tcp4,
        "TCP6" => ProxyFamily::Tcp6,
        other => return Err(violation(format!("unsupported protocol {:?}", other))),
    };

    let src_ip = parse_ip(family, fields[2])?;
    let dst_ip = parse_ip(family, fields[3])?;
    let src_port = parse_port(fields[4])?;
    let dst_port = parse_port(fields[5])?;

    Ok(ProxyHeaderV1 {
        family,
        source: SocketAddr::new(src_ip, src_port),
        destination: SocketAddr::new(dst_ip, dst_port),
        len: line_end + 2,
    })
}

fn parse_ip(family: ProxyFamily, field: &str) -> Result<IpAddr, PreambleError> {
    let parsed = match family {
        ProxyFamily::Tcp4 => field.parse::<Ipv4Addr>().map(IpAddr::V4),
        ProxyFamily::Tcp6 => field.parse::<Ipv6Addr>().map(IpAddr::V6),
    };
    parsed.map_err(|_| violation(format!("invalid {:?} address {:?}", family, field)))
}

fn parse_port(field: &str) -> Result<u16, PreambleError> {
    field
        .parse()
        .map_err(|_| violation(format!("invalid port {:?}", field)))
}
