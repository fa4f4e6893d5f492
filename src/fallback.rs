//! Client Address Header Fallback
//!
//! Runs once per request after headers are read. A rewrite committed by the
//! preamble stage wins; otherwise a trusted peer may supply the client
//! address in a request header.
//!
//! Scrubbing happens first and unconditionally, so a scope that scrubs the
//! header never falls back to it.

use std::net::IpAddr;

use hyper::header::HeaderName;
use hyper::HeaderMap;
use tracing::{debug, warn};

use crate::connection::{ConnectionState, RewriteOutcome, TrustVerdict};
use crate::policy::InterceptPolicy;
use crate::trust::TrustStore;

/// How the effective address was settled for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackOutcome {
    /// A rewrite was already committed on this connection
    Committed(IpAddr),
    /// The header supplied a new address
    Header(IpAddr),
    /// Nothing changed
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct HeaderFallback {
    header: HeaderName,
    scrub: bool,
}

impl HeaderFallback {
    pub fn new(header: HeaderName, scrub: bool) -> Self {
        Self { header, scrub }
    }

    pub fn from_policy(policy: &InterceptPolicy) -> Self {
        Self::new(policy.fallback_header().clone(), policy.scrub_fallback_header())
    }

    /// Reconcile the connection's address with the request headers.
    ///
    /// Removes the header from `headers` when scrubbing is enabled.
    pub fn resolve(
        &self,
        state: &mut ConnectionState,
        headers: &mut HeaderMap,
        trust: &TrustStore,
    ) -> FallbackOutcome {
        if self.scrub {
            headers.remove(&self.header);
        }

        if let Some(ip) = state.rewritten_ip() {
            return FallbackOutcome::Committed(ip);
        }

        let Some(value) = headers.get(&self.header) else {
            return FallbackOutcome::Unchanged;
        };

        if state.evaluate(trust) != TrustVerdict::Trusted {
            debug!(peer = %state.peer_addr(), "Ignoring {} from untrusted peer", self.header);
            return FallbackOutcome::Unchanged;
        }

        let candidate = match value.to_str().ok().and_then(|v| v.trim().parse::<IpAddr>().ok()) {
            Some(ip) => ip,
            None => {
                warn!(peer = %state.peer_addr(), value = ?value, "Invalid {} header", self.header);
                return FallbackOutcome::Unchanged;
            }
        };

        if candidate == state.effective_ip() {
            return FallbackOutcome::Unchanged;
        }

        match state.rewrite(candidate) {
            RewriteOutcome::Applied => FallbackOutcome::Header(candidate),
            RewriteOutcome::Denied => FallbackOutcome::Unchanged,
        }
    }
}
