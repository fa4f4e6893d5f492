//! Binary HELO Handshake
//!
//! Fixed 8-byte frame: `HELO` followed by an IPv4 address in network order.

use std::net::Ipv4Addr;

use super::PreambleError;

/// Handshake signature: "HELO"
pub const HELO_SIGNATURE: &[u8; 4] = b"HELO";

/// Total frame length, signature included
pub const FRAME_LEN: usize = 8;

/// Build the handshake frame announcing `addr`.
pub fn encode(addr: Ipv4Addr) -> [u8; FRAME_LEN] {
    let mut frame = [0u8; FRAME_LEN];
    frame[..4].copy_from_slice(HELO_SIGNATURE);
    frame[4..].copy_from_slice(&addr.octets());
    frame
}

/// Decode the client address from a chunk starting with `HELO`.
///
/// The address is rendered to dotted-decimal and parsed back; a frame whose
/// text form does not round-trip is rejected.
pub fn decode(chunk: &[u8]) -> Result<Ipv4Addr, PreambleError> {
    if chunk.len() < FRAME_LEN {
        return Err(PreambleError::Decode(format!(
            "HELO frame truncated: {} of {} bytes",
            chunk.len(),
            FRAME_LEN
        )));
    }
    if chunk[..4] != *HELO_SIGNATURE {
        return Err(PreambleError::Decode("missing HELO signature".to_string()));
    }

    let addr = Ipv4Addr::new(chunk[4], chunk[5], chunk[6], chunk[7]);
    let text = addr.to_string();
    match text.parse::<Ipv4Addr>() {
        Ok(parsed) if parsed == addr => Ok(addr),
        _ => Err(PreambleError::Decode(format!("HELO address {} is invalid", text))),
    }
}
