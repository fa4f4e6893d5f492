//! Per-connection State
//!
//! Tracks what the socket saw, what was decided about it, and what address
//! the application should be told about. One task owns a `ConnectionState`
//! for the life of the connection.

use std::net::{IpAddr, SocketAddr};

use tracing::{debug, warn};

use crate::trust::TrustStore;

/// Cached trust decision for the immediate peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustVerdict {
    Unknown,
    Trusted,
    Untrusted,
}

/// Result of asking for the effective address to be replaced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteOutcome {
    Applied,
    Denied,
}

#[derive(Debug, Clone)]
pub struct ConnectionState {
    /// Socket-level source address. Never changes.
    peer_addr: SocketAddr,

    /// Local endpoint the connection was accepted on
    local_addr: SocketAddr,

    trust: TrustVerdict,

    /// Address reported to the application
    effective_ip: IpAddr,

    /// Peer address recorded at trust evaluation, whatever the verdict
    original_ip: Option<IpAddr>,

    /// Peer address recorded only when it is a trusted intermediary
    balancer_ip: Option<IpAddr>,

    /// Last committed rewrite, read by the header fallback stage
    rewritten_ip: Option<IpAddr>,

    /// Cached reverse-DNS name for `effective_ip`
    remote_host: Option<String>,

    preamble_consumed: bool,
}

impl ConnectionState {
    pub fn new(peer_addr: SocketAddr, local_addr: SocketAddr) -> Self {
        Self {
            peer_addr,
            local_addr,
            trust: TrustVerdict::Unknown,
            effective_ip: peer_addr.ip(),
            original_ip: None,
            balancer_ip: None,
            rewritten_ip: None,
            remote_host: None,
            preamble_consumed: false,
        }
    }

    /// Compute the trust verdict once and cache it.
    ///
    /// The first call also records the original peer address for audit.
    pub fn evaluate(&mut self, store: &TrustStore) -> TrustVerdict {
        if self.trust != TrustVerdict::Unknown {
            return self.trust;
        }

        let peer = self.peer_addr.ip();
        self.original_ip = Some(peer);
        self.trust = if store.is_trusted(peer) {
            self.balancer_ip = Some(peer);
            TrustVerdict::Trusted
        } else {
            TrustVerdict::Untrusted
        };

        debug!(peer = %peer, verdict = ?self.trust, "Evaluated peer trust");
        self.trust
    }

    /// Replace the effective address with `candidate`.
    ///
    /// Only the cached verdict is consulted; a connection that has not been
    /// evaluated yet is denied.
    pub fn rewrite(&mut self, candidate: IpAddr) -> RewriteOutcome {
        if self.trust != TrustVerdict::Trusted {
            warn!(
                balancer = %self.peer_addr.ip(),
                candidate = %candidate,
                "Rewrite of client address denied"
            );
            return RewriteOutcome::Denied;
        }

        debug!(from = %self.effective_ip, to = %candidate, "Rewriting client address");
        self.effective_ip = candidate;
        self.remote_host = None;
        self.rewritten_ip = Some(candidate);
        RewriteOutcome::Applied
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn trust(&self) -> TrustVerdict {
        self.trust
    }

    pub fn is_trusted(&self) -> bool {
        self.trust == TrustVerdict::Trusted
    }

    pub fn effective_ip(&self) -> IpAddr {
        self.effective_ip
    }

    /// Effective address paired with the socket's source port
    pub fn effective_addr(&self) -> SocketAddr {
        SocketAddr::new(self.effective_ip, self.peer_addr.port())
    }

    pub fn original_ip(&self) -> Option<IpAddr> {
        self.original_ip
    }

    pub fn balancer_ip(&self) -> Option<IpAddr> {
        self.balancer_ip
    }

    pub fn rewritten_ip(&self) -> Option<IpAddr> {
        self.rewritten_ip
    }

    pub fn remote_host(&self) -> Option<&str> {
        self.remote_host.as_deref()
    }

    #[cfg(test)]
    pub(crate) fn set_remote_host(&mut self, host: impl Into<String>) {
        self.remote_host = Some(host.into());
    }

    pub fn preamble_consumed(&self) -> bool {
        self.preamble_consumed
    }

    /// Set the one-shot preamble guard, returning whether it was already set.
    pub(crate) fn take_preamble(&mut self) -> bool {
        std::mem::replace(&mut self.preamble_consumed, true)
    }
}

/// Addresses exposed to the application layer for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAddrs {
    /// Address the application should treat as the client
    pub remote_addr: IpAddr,

    /// What the socket saw
    pub original_remote_addr: IpAddr,

    /// Set when the socket peer is a trusted intermediary
    pub load_balancer_addr: Option<IpAddr>,
}

impl From<&ConnectionState> for ClientAddrs {
    fn from(state: &ConnectionState) -> Self {
        Self {
            remote_addr: state.effective_ip(),
            original_remote_addr: state.original_ip().unwrap_or(state.peer_addr().ip()),
            load_balancer_addr: state.balancer_ip(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> TrustStore {
        TrustStore::from_literals(["10.0.0.0/8"]).unwrap()
    }

    fn state(peer: &str) -> ConnectionState {
        ConnectionState::new(peer.parse().unwrap(), "192.0.2.1:442".parse().unwrap())
    }

    #[test]
    fn test_new_connection_reports_peer() {
        let conn = state("10.0.0.5:40000");
        assert_eq!(conn.trust(), TrustVerdict::Unknown);
        assert_eq!(conn.effective_ip(), "10.0.0.5".parse::<IpAddr>().unwrap());
        assert!(conn.original_ip().is_none());
        assert!(!conn.preamble_consumed());
    }

    #[test]
    fn test_evaluate_trusted_records_audit() {
        let mut conn = state("10.0.0.5:40000");
        assert_eq!(conn.evaluate(&store()), TrustVerdict::Trusted);
        assert_eq!(conn.original_ip(), Some("10.0.0.5".parse().unwrap()));
        assert_eq!(conn.balancer_ip(), Some("10.0.0.5".parse().unwrap()));
    }

    #[test]
    fn test_evaluate_untrusted_still_records_original() {
        let mut conn = state("198.51.100.7:40000");
        assert_eq!(conn.evaluate(&store()), TrustVerdict::Untrusted);
        assert_eq!(conn.original_ip(), Some("198.51.100.7".parse().unwrap()));
        assert!(conn.balancer_ip().is_none());
    }

    #[test]
    fn test_verdict_is_cached() {
        let mut conn = state("10.0.0.5:40000");
        conn.evaluate(&store());

        // A different store must not change the cached answer.
        assert_eq!(conn.evaluate(&TrustStore::default()), TrustVerdict::Trusted);
    }

    #[test]
    fn test_rewrite_trusted() {
        let mut conn = state("10.0.0.5:40000");
        conn.evaluate(&store());
        conn.set_remote_host("lb1.internal");

        assert_eq!(conn.rewrite("1.2.3.4".parse().unwrap()), RewriteOutcome::Applied);
        assert_eq!(conn.effective_ip(), "1.2.3.4".parse::<IpAddr>().unwrap());
        assert_eq!(conn.effective_addr(), "1.2.3.4:40000".parse().unwrap());
        assert_eq!(conn.rewritten_ip(), Some("1.2.3.4".parse().unwrap()));
        assert!(conn.remote_host().is_none());
        assert_eq!(conn.peer_addr(), "10.0.0.5:40000".parse().unwrap());
    }

    #[test]
    fn test_rewrite_denied_when_untrusted() {
        let mut conn = state("198.51.100.7:40000");
        conn.evaluate(&store());

        assert_eq!(conn.rewrite("1.2.3.4".parse().unwrap()), RewriteOutcome::Denied);
        assert_eq!(conn.effective_ip(), "198.51.100.7".parse::<IpAddr>().unwrap());
        assert!(conn.rewritten_ip().is_none());
    }

    #[test]
    fn test_rewrite_denied_before_evaluation() {
        let mut conn = state("10.0.0.5:40000");
        assert_eq!(conn.rewrite("1.2.3.4".parse().unwrap()), RewriteOutcome::Denied);
        assert_eq!(conn.trust(), TrustVerdict::Unknown);
    }

    #[test]
    fn test_take_preamble_is_one_shot() {
        let mut conn = state("10.0.0.5:40000");
        assert!(!conn.take_preamble());
        assert!(conn.take_preamble());
        assert!(conn.preamble_consumed());
    }

    #[test]
    fn test_client_addrs() {
        let mut conn = state("10.0.0.5:40000");
        conn.evaluate(&store());
        conn.rewrite("203.0.113.5".parse().unwrap());

        let addrs = ClientAddrs::from(&conn);
        assert_eq!(addrs.remote_addr, "203.0.113.5".parse::<IpAddr>().unwrap());
        assert_eq!(addrs.original_remote_addr, "10.0.0.5".parse::<IpAddr>().unwrap());
        assert_eq!(addrs.load_balancer_addr, Some("10.0.0.5".parse().unwrap()));
    }
}
